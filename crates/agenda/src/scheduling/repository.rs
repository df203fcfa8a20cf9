use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::audit::AuditLog;
use super::domain::{
    Appointment, AppointmentId, AppointmentStatus, ClientId, ServiceId, StaffId, TimeSlot,
    MAX_SERVICE_MINUTES,
};

/// Listing filter for dashboards and reports. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentFilter {
    #[serde(default)]
    pub client: Option<ClientId>,
    #[serde(default)]
    pub staff: Option<StaffId>,
    #[serde(default)]
    pub service: Option<ServiceId>,
    #[serde(default)]
    pub statuses: Vec<AppointmentStatus>,
    /// Inclusive lower bound on the scheduled start.
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the scheduled start.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl AppointmentFilter {
    pub fn matches(&self, appointment: &Appointment) -> bool {
        self.client
            .as_ref()
            .map_or(true, |client| &appointment.client == client)
            && self
                .staff
                .as_ref()
                .map_or(true, |staff| &appointment.staff == staff)
            && self
                .service
                .as_ref()
                .map_or(true, |service| &appointment.service == service)
            && (self.statuses.is_empty() || self.statuses.contains(&appointment.status))
            && self
                .from
                .map_or(true, |from| appointment.scheduled_start >= from)
            && self
                .until
                .map_or(true, |until| appointment.scheduled_start < until)
    }
}

/// Length recorded on the appointment when it was booked.
pub fn booked_length(appointment: &Appointment) -> chrono::Duration {
    chrono::Duration::minutes(i64::from(appointment.duration_minutes))
}

/// Appointment persistence as seen from inside a transaction.
pub trait AppointmentRepository {
    /// Appointments of `staff` that occupy the slot (`Scheduled`/`InProgress`) and intersect
    /// `slot`, skipping `exclude`. `length` decides how long each stored appointment runs and
    /// must stay within [`MAX_SERVICE_MINUTES`]. Order is unspecified.
    fn find_overlapping(
        &self,
        staff: &StaffId,
        slot: &TimeSlot,
        exclude: Option<&AppointmentId>,
        length: &dyn Fn(&Appointment) -> chrono::Duration,
    ) -> Result<Vec<Appointment>, RepositoryError>;
    fn get(&self, id: &AppointmentId) -> Result<Option<Appointment>, RepositoryError>;
    /// Matching appointments, latest start first.
    fn list(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, RepositoryError>;
    fn save(&mut self, appointment: Appointment) -> Result<Appointment, RepositoryError>;
    fn delete(&mut self, id: &AppointmentId) -> Result<Appointment, RepositoryError>;
}

/// Unit of work over appointments and the audit log. Dropping it without `commit` discards
/// every staged write.
pub trait StoreTransaction: AppointmentRepository + AuditLog {
    fn commit(self: Box<Self>) -> Result<(), RepositoryError>;
}

/// What a transaction is allowed to touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionScope {
    ReadOnly,
    /// Serialises against every other transaction naming any of these staff members.
    Exclusive(Vec<StaffId>),
}

impl TransactionScope {
    pub fn staff(ids: impl IntoIterator<Item = StaffId>) -> Self {
        let mut ids: Vec<StaffId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        TransactionScope::Exclusive(ids)
    }
}

/// Transactional backing store for appointments and audit entries.
pub trait SchedulingStore: Send + Sync {
    fn begin(
        &self,
        scope: TransactionScope,
    ) -> Result<Box<dyn StoreTransaction + '_>, RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    Conflict,
    #[error("storage did not respond within {0:?}")]
    Timeout(Duration),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("transaction does not hold staff member {0}")]
    ScopeViolation(StaffId),
    #[error("transaction is read-only")]
    ReadOnly,
}
