use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc, Weekday};

use super::lifecycle::TransitionPolicy;
use crate::config::SchedulingConfig;

/// Calendar rules a proposed start time must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingPolicy {
    opening_hour: u32,
    closing_hour: u32,
    offset: FixedOffset,
    transitions: TransitionPolicy,
}

impl SchedulingPolicy {
    pub fn from_config(config: &SchedulingConfig) -> Self {
        Self {
            opening_hour: config.opening_hour,
            closing_hour: config.closing_hour,
            offset: config.utc_offset,
            transitions: TransitionPolicy {
                allow_cancel_in_progress: config.allow_cancel_in_progress,
            },
        }
    }

    pub fn transitions(&self) -> TransitionPolicy {
        self.transitions
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Business-hours check first, then the weekday check.
    pub fn check_start(&self, start: DateTime<Utc>) -> Result<(), CalendarViolation> {
        let local = start.with_timezone(&self.offset);

        if !(self.opening_hour..self.closing_hour).contains(&local.hour()) {
            return Err(CalendarViolation::OutsideBusinessHours { hour: local.hour() });
        }
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return Err(CalendarViolation::NonBusinessDay {
                weekday: local.weekday(),
            });
        }

        Ok(())
    }

    /// Human-readable opening window, e.g. `Mon-Fri 08:00-18:00 (+00:00)`.
    pub fn describe(&self) -> String {
        format!(
            "Mon-Fri {:02}:00-{:02}:00 ({})",
            self.opening_hour, self.closing_hour, self.offset
        )
    }
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulingConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarViolation {
    OutsideBusinessHours { hour: u32 },
    NonBusinessDay { weekday: Weekday },
}
