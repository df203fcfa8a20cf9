//! Scheduling and conflict resolution for service appointments.
//!
//! [`SchedulingEngine`] is the only writer: it reads the [`DirectoryStore`], checks the calendar
//! rules in [`SchedulingPolicy`], runs the overlap query and the write inside one
//! [`StoreTransaction`] scoped to the affected staff members, and records the matching
//! [`AuditEntry`] in that same transaction.

pub mod audit;
pub mod clock;
pub mod directory;
pub mod domain;
pub mod engine;
pub mod lifecycle;
pub mod memory;
pub mod policy;
pub mod repository;
pub mod router;

#[cfg(test)]
mod tests;

pub use audit::{
    AuditAction, AuditDetail, AuditEntry, AuditError, AuditLog, AuditQuery, AuditRecord,
    AuditTrail,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use directory::{
    active_services, available_staff, DirectoryError, DirectoryStore, InMemoryDirectory,
};
pub use domain::{
    Actor, ActorId, Appointment, AppointmentChanges, AppointmentId, AppointmentStatus,
    BookingRequest, Capability, ClientId, InvalidService, RequestContext, RequestOrigin, Role,
    Service, ServiceId, Staff, StaffId, TimeSlot, MAX_SERVICE_MINUTES,
};
pub use engine::{
    BookingOptions, ErrorClass, SchedulingEngine, SchedulingError, APPOINTMENT_ENTITY,
};
pub use lifecycle::{check_cancellation, LifecycleError, TransitionPolicy};
pub use memory::InMemoryStore;
pub use policy::{CalendarViolation, SchedulingPolicy};
pub use repository::{
    booked_length, AppointmentFilter, AppointmentRepository, RepositoryError, SchedulingStore,
    StoreTransaction, TransactionScope,
};
pub use router::{
    request_context, scheduling_router, ACTOR_CAPABILITIES_HEADER, ACTOR_ID_HEADER,
    ACTOR_NAME_HEADER, ACTOR_ROLE_HEADER,
};
