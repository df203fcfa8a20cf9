//! Appointment scheduling core for service businesses.
//!
//! The [`scheduling`] module owns the booking rules: business hours, staff availability,
//! overlap detection, the appointment lifecycle and the audit trail written alongside every
//! state change. Configuration, telemetry and the application error type live beside it so
//! the service binary can assemble everything from a single crate.

pub mod config;
pub mod error;
pub mod scheduling;
pub mod telemetry;
