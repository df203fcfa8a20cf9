//! Appointment status transitions and time-based eligibility.

use chrono::{DateTime, Utc};

use super::domain::{Appointment, AppointmentId, AppointmentStatus};

/// Business policy knobs for the state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionPolicy {
    /// Whether an appointment already under way may still be called off.
    pub allow_cancel_in_progress: bool,
}

impl TransitionPolicy {
    pub fn allows(&self, from: AppointmentStatus, to: AppointmentStatus) -> bool {
        use AppointmentStatus::*;

        match (from, to) {
            (Scheduled, InProgress) | (Scheduled, Cancelled) | (InProgress, Completed) => true,
            (InProgress, Cancelled) => self.allow_cancel_in_progress,
            _ => false,
        }
    }

    /// Validates moving `appointment` to `to` at instant `now`.
    ///
    /// Cancelling a scheduled appointment also requires its start to be in the future.
    pub fn check(
        &self,
        appointment: &Appointment,
        to: AppointmentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        let from = appointment.status;
        if !self.allows(from, to) {
            return Err(LifecycleError::IllegalTransition { from, to });
        }

        if from == AppointmentStatus::Scheduled && to == AppointmentStatus::Cancelled {
            check_cancellation(appointment, now)?;
        }

        Ok(())
    }
}

/// `cancel` is only valid for a scheduled appointment that has not started yet.
pub fn check_cancellation(
    appointment: &Appointment,
    now: DateTime<Utc>,
) -> Result<(), LifecycleError> {
    if appointment.can_cancel(now) {
        Ok(())
    } else {
        Err(LifecycleError::CancellationNotAllowed {
            id: appointment.id.clone(),
            status: appointment.status,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("cannot move appointment from {from} to {to}")]
    IllegalTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    #[error("appointment {id} ({status}) can no longer be cancelled")]
    CancellationNotAllowed {
        id: AppointmentId,
        status: AppointmentStatus,
    },
}
