use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::audit::{
    AuditAction, AuditEntry, AuditError, AuditLog, AuditQuery, AuditRecord, AuditTrail,
};
use super::clock::Clock;
use super::directory::{active_services, available_staff, DirectoryError, DirectoryStore};
use super::domain::{
    Appointment, AppointmentChanges, AppointmentId, AppointmentStatus, BookingRequest,
    RequestContext, Service, ServiceId, Staff, StaffId, MAX_SERVICE_MINUTES,
};
use super::lifecycle::{check_cancellation, LifecycleError};
use super::policy::{CalendarViolation, SchedulingPolicy};
use super::repository::{
    AppointmentFilter, AppointmentRepository, RepositoryError, SchedulingStore,
    StoreTransaction, TransactionScope,
};

/// Entity type written on every appointment audit entry.
pub const APPOINTMENT_ENTITY: &str = "appointment";

/// How often a mutation re-reads an appointment whose staff member moved under it.
const LOCK_ATTEMPTS: usize = 3;

static APPOINTMENT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_appointment_id() -> AppointmentId {
    let id = APPOINTMENT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    AppointmentId(format!("apt-{id:06}"))
}

/// Validates, persists and audits every appointment mutation.
pub struct SchedulingEngine<S, D> {
    store: Arc<S>,
    directory: Arc<D>,
    clock: Arc<dyn Clock>,
    policy: SchedulingPolicy,
}

/// Choices for a booking form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingOptions {
    pub services: Vec<Service>,
    pub staff: Vec<Staff>,
}

type Locked<'a> = (Box<dyn StoreTransaction + 'a>, Appointment);

impl<S, D> SchedulingEngine<S, D>
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        directory: Arc<D>,
        clock: Arc<dyn Clock>,
        policy: SchedulingPolicy,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &SchedulingPolicy {
        &self.policy
    }

    pub fn directory(&self) -> &Arc<D> {
        &self.directory
    }

    /// Audit facade sharing this engine's store, for events raised outside scheduling.
    pub fn audit_trail(&self) -> AuditTrail<S> {
        AuditTrail::new(Arc::clone(&self.store))
    }

    /// Validate and book a new appointment.
    pub fn propose(
        &self,
        ctx: &RequestContext,
        request: BookingRequest,
    ) -> Result<Appointment, SchedulingError> {
        self.try_propose(ctx, request).map_err(|error| {
            debug!(error = %error, class = ?error.class(), "booking rejected");
            error
        })
    }

    fn try_propose(
        &self,
        ctx: &RequestContext,
        request: BookingRequest,
    ) -> Result<Appointment, SchedulingError> {
        let now = self.clock.now();
        let staff = self.available_staff(&request.staff, now)?;
        let service = self.active_service(&request.service)?;

        if request.start <= now {
            return Err(SchedulingError::PastScheduling {
                requested: request.start,
                now,
            });
        }
        self.policy.check_start(request.start)?;

        let mut appointment = Appointment {
            id: next_appointment_id(),
            client: request.client,
            staff: staff.id.clone(),
            service: service.id.clone(),
            client_name: request.client_name,
            service_name: service.name.clone(),
            scheduled_start: request.start,
            duration_minutes: service.duration_minutes,
            status: AppointmentStatus::Scheduled,
            notes: normalize_notes(request.notes),
            final_price: service.price,
            created_by: Some(ctx.actor.id.clone()),
            created_at: now,
            updated_at: now,
        };

        let lengths = self.service_lengths()?;
        let mut tx = self.store.begin(TransactionScope::staff([staff.id.clone()]))?;
        ensure_free(&*tx, &appointment, None, &lengths)?;

        appointment.final_price = checked_price(request.final_price.unwrap_or(service.price))?;

        let saved = tx.save(appointment)?;
        tx.record(
            AuditRecord::new(AuditAction::Create, APPOINTMENT_ENTITY)
                .by(&ctx.actor)
                .target(saved.id.to_string(), saved.summary())
                .from_origin(&ctx.origin)
                .detail("staff", saved.staff.to_string())
                .detail("service", saved.service.to_string())
                .detail("start", saved.scheduled_start.to_rfc3339())
                .detail("final_price", saved.final_price.to_string()),
        )?;
        tx.commit()?;

        info!(
            appointment = %saved.id,
            staff = %saved.staff,
            start = %saved.scheduled_start,
            "appointment booked"
        );
        Ok(saved)
    }

    /// Change fields of an existing appointment, re-validating the resulting slot.
    ///
    /// The past-start check is skipped so that old records stay editable.
    pub fn edit(
        &self,
        ctx: &RequestContext,
        id: &AppointmentId,
        changes: AppointmentChanges,
    ) -> Result<Appointment, SchedulingError> {
        let (mut tx, existing) = self.lock_appointment(id, changes.staff.as_ref())?;
        let now = self.clock.now();

        let staff_id = changes.staff.unwrap_or_else(|| existing.staff.clone());
        let service_id = changes.service.unwrap_or_else(|| existing.service.clone());
        let staff = self.available_staff(&staff_id, now)?;
        let service = self.active_service(&service_id)?;

        let mut updated = existing.clone();
        updated.staff = staff.id;
        updated.service = service.id;
        updated.service_name = service.name;
        updated.duration_minutes = service.duration_minutes;
        if let Some(client) = changes.client {
            updated.client = client;
        }
        if let Some(client_name) = changes.client_name {
            updated.client_name = Some(client_name);
        }
        if let Some(start) = changes.start {
            updated.scheduled_start = start;
        }
        if let Some(notes) = changes.notes {
            updated.notes = normalize_notes(Some(notes));
        }

        self.policy.check_start(updated.scheduled_start)?;
        if updated.status.occupies_slot() {
            let lengths = self.service_lengths()?;
            ensure_free(&*tx, &updated, Some(&updated.id), &lengths)?;
        }
        if let Some(price) = changes.final_price {
            updated.final_price = checked_price(price)?;
        }

        let diff = field_changes(&existing, &updated);
        updated.updated_at = now;

        let saved = tx.save(updated)?;
        tx.record(
            AuditRecord::new(AuditAction::Update, APPOINTMENT_ENTITY)
                .by(&ctx.actor)
                .target(saved.id.to_string(), saved.summary())
                .from_origin(&ctx.origin)
                .detail("action", "edit")
                .detail("changes", Value::Object(diff)),
        )?;
        tx.commit()?;

        info!(appointment = %saved.id, staff = %saved.staff, "appointment updated");
        Ok(saved)
    }

    /// Cancel a scheduled appointment that has not started yet.
    pub fn cancel(
        &self,
        ctx: &RequestContext,
        id: &AppointmentId,
    ) -> Result<Appointment, SchedulingError> {
        self.change_status(ctx, id, AppointmentStatus::Cancelled, check_cancellation)
    }

    /// Move an appointment to `to`, subject to the configured transition policy.
    pub fn transition(
        &self,
        ctx: &RequestContext,
        id: &AppointmentId,
        to: AppointmentStatus,
    ) -> Result<Appointment, SchedulingError> {
        let transitions = self.policy.transitions();
        self.change_status(ctx, id, to, |appointment, now| {
            transitions.check(appointment, to, now)
        })
    }

    pub fn start(
        &self,
        ctx: &RequestContext,
        id: &AppointmentId,
    ) -> Result<Appointment, SchedulingError> {
        self.transition(ctx, id, AppointmentStatus::InProgress)
    }

    pub fn complete(
        &self,
        ctx: &RequestContext,
        id: &AppointmentId,
    ) -> Result<Appointment, SchedulingError> {
        self.transition(ctx, id, AppointmentStatus::Completed)
    }

    fn change_status<F>(
        &self,
        ctx: &RequestContext,
        id: &AppointmentId,
        to: AppointmentStatus,
        check: F,
    ) -> Result<Appointment, SchedulingError>
    where
        F: FnOnce(&Appointment, DateTime<Utc>) -> Result<(), LifecycleError>,
    {
        let (mut tx, mut appointment) = self.lock_appointment(id, None)?;
        let now = self.clock.now();
        check(&appointment, now)?;

        let from = appointment.status;
        appointment.status = to;
        appointment.updated_at = now;

        let saved = tx.save(appointment)?;
        tx.record(
            AuditRecord::new(AuditAction::Update, APPOINTMENT_ENTITY)
                .by(&ctx.actor)
                .target(saved.id.to_string(), saved.summary())
                .from_origin(&ctx.origin)
                .detail("action", "status_change")
                .detail("from", from.label())
                .detail("to", to.label()),
        )?;
        tx.commit()?;

        info!(appointment = %saved.id, %from, %to, "appointment status changed");
        Ok(saved)
    }

    /// Administrative removal; the audit entry keeps the last snapshot.
    pub fn delete(
        &self,
        ctx: &RequestContext,
        id: &AppointmentId,
    ) -> Result<Appointment, SchedulingError> {
        let (mut tx, _) = self.lock_appointment(id, None)?;

        let removed = tx.delete(id)?;
        tx.record(
            AuditRecord::new(AuditAction::Delete, APPOINTMENT_ENTITY)
                .by(&ctx.actor)
                .target(removed.id.to_string(), removed.summary())
                .from_origin(&ctx.origin)
                .detail("status", removed.status.label()),
        )?;
        tx.commit()?;

        info!(appointment = %removed.id, staff = %removed.staff, "appointment deleted");
        Ok(removed)
    }

    pub fn get(&self, id: &AppointmentId) -> Result<Appointment, SchedulingError> {
        let tx = self.store.begin(TransactionScope::ReadOnly)?;
        tx.get(id)?
            .ok_or_else(|| SchedulingError::AppointmentNotFound(id.clone()))
    }

    pub fn list(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, SchedulingError> {
        let tx = self.store.begin(TransactionScope::ReadOnly)?;
        Ok(tx.list(filter)?)
    }

    /// Audit entries for one appointment, oldest first. Deleted appointments keep theirs.
    pub fn history(&self, id: &AppointmentId) -> Result<Vec<AuditEntry>, SchedulingError> {
        let tx = self.store.begin(TransactionScope::ReadOnly)?;
        tx.history(&AuditQuery::for_entity(APPOINTMENT_ENTITY, id.to_string()))
            .map_err(|error| SchedulingError::StorageUnavailable(error.to_string()))
    }

    /// Services and staff a booking form may offer today.
    pub fn booking_options(&self) -> Result<BookingOptions, SchedulingError> {
        let today = self.local_date(self.clock.now());
        Ok(BookingOptions {
            services: active_services(&*self.directory)?,
            staff: available_staff(&*self.directory, today)?,
        })
    }

    fn available_staff(
        &self,
        id: &StaffId,
        now: DateTime<Utc>,
    ) -> Result<Staff, SchedulingError> {
        let staff = self
            .directory
            .staff(id)?
            .ok_or_else(|| SchedulingError::UnknownStaff(id.clone()))?;

        if !staff.is_available(self.local_date(now)) {
            return Err(SchedulingError::StaffUnavailable(id.clone()));
        }
        Ok(staff)
    }

    fn active_service(&self, id: &ServiceId) -> Result<Service, SchedulingError> {
        let service = self
            .directory
            .service(id)?
            .ok_or_else(|| SchedulingError::UnknownService(id.clone()))?;

        if !service.active {
            return Err(SchedulingError::ServiceInactive(id.clone()));
        }
        Ok(service)
    }

    fn service_lengths(&self) -> Result<ServiceLengths, SchedulingError> {
        let lengths = self
            .directory
            .services()?
            .into_iter()
            .map(|service| (service.id, service.duration_minutes))
            .collect();
        Ok(ServiceLengths(lengths))
    }

    fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.policy.offset()).date_naive()
    }

    /// Opens an exclusive transaction holding the appointment's staff member (plus `also`),
    /// re-reading until the staff member seen before locking is the one still assigned.
    fn lock_appointment(
        &self,
        id: &AppointmentId,
        also: Option<&StaffId>,
    ) -> Result<Locked<'_>, SchedulingError> {
        for _ in 0..LOCK_ATTEMPTS {
            let seen = self.get(id)?;
            let scope = TransactionScope::staff(
                std::iter::once(seen.staff.clone()).chain(also.cloned()),
            );

            let tx = self.store.begin(scope)?;
            let current = tx
                .get(id)?
                .ok_or_else(|| SchedulingError::AppointmentNotFound(id.clone()))?;
            if current.staff == seen.staff {
                return Ok((tx, current));
            }
        }

        Err(SchedulingError::StorageUnavailable(format!(
            "appointment {id} kept moving between staff members"
        )))
    }
}

/// Current length of every catalogue service, keyed by id.
struct ServiceLengths(HashMap<ServiceId, u32>);

impl ServiceLengths {
    /// The service's length as the catalogue has it now. An appointment whose service has
    /// been removed keeps the length it was booked with.
    fn of(&self, appointment: &Appointment) -> chrono::Duration {
        let minutes = self
            .0
            .get(&appointment.service)
            .copied()
            .unwrap_or(appointment.duration_minutes)
            .min(MAX_SERVICE_MINUTES);
        chrono::Duration::minutes(i64::from(minutes))
    }
}

/// Fails with the earliest active booking that intersects `appointment`'s slot.
fn ensure_free<R>(
    repository: &R,
    appointment: &Appointment,
    exclude: Option<&AppointmentId>,
    lengths: &ServiceLengths,
) -> Result<(), SchedulingError>
where
    R: AppointmentRepository + ?Sized,
{
    let slot = appointment.slot_lasting(lengths.of(appointment));
    let conflict = repository
        .find_overlapping(&appointment.staff, &slot, exclude, &|stored: &Appointment| {
            lengths.of(stored)
        })?
        .into_iter()
        .min_by(|a, b| {
            a.scheduled_start
                .cmp(&b.scheduled_start)
                .then_with(|| a.id.cmp(&b.id))
        });

    match conflict {
        Some(existing) => Err(SchedulingError::SchedulingConflict {
            conflicting: existing.id,
        }),
        None => Ok(()),
    }
}

fn checked_price(price: Decimal) -> Result<Decimal, SchedulingError> {
    if price < Decimal::ZERO {
        Err(SchedulingError::InvalidPrice(price))
    } else {
        Ok(price)
    }
}

fn normalize_notes(notes: Option<String>) -> Option<String> {
    notes
        .map(|notes| notes.trim().to_string())
        .filter(|notes| !notes.is_empty())
}

fn field_changes(before: &Appointment, after: &Appointment) -> Map<String, Value> {
    let mut changes = Map::new();
    let mut track = |field: &str, from: Value, to: Value| {
        if from != to {
            changes.insert(field.to_string(), json!({ "from": from, "to": to }));
        }
    };

    track("client", json!(before.client), json!(after.client));
    track("client_name", json!(before.client_name), json!(after.client_name));
    track("staff", json!(before.staff), json!(after.staff));
    track("service", json!(before.service), json!(after.service));
    track(
        "scheduled_start",
        json!(before.scheduled_start),
        json!(after.scheduled_start),
    );
    track(
        "duration_minutes",
        json!(before.duration_minutes),
        json!(after.duration_minutes),
    );
    track("notes", json!(before.notes), json!(after.notes));
    track(
        "final_price",
        json!(before.final_price.to_string()),
        json!(after.final_price.to_string()),
    );
    changes
}

/// Recoverability class of a [`SchedulingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller can fix the input and try again.
    Validation,
    /// The appointment is not in a state that permits the request.
    StateMachine,
    /// Infrastructure hiccup; the whole operation may be retried as-is.
    Transient,
    /// The operation was rolled back and must not be retried blindly.
    Fatal,
}

/// Error raised by the scheduling engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulingError {
    #[error("staff member {0} does not exist")]
    UnknownStaff(StaffId),
    #[error("service {0} does not exist")]
    UnknownService(ServiceId),
    #[error("appointment {0} does not exist")]
    AppointmentNotFound(AppointmentId),
    #[error("staff member {0} is not available for bookings")]
    StaffUnavailable(StaffId),
    #[error("service {0} is not active")]
    ServiceInactive(ServiceId),
    #[error("appointments must start in the future (requested {requested}, now {now})")]
    PastScheduling {
        requested: DateTime<Utc>,
        now: DateTime<Utc>,
    },
    #[error("appointments must start during business hours (requested hour {hour})")]
    OutsideBusinessHours { hour: u32 },
    #[error("appointments cannot be booked on {weekday:?}")]
    NonBusinessDay { weekday: Weekday },
    #[error("staff member is already booked by appointment {conflicting}")]
    SchedulingConflict { conflicting: AppointmentId },
    #[error("final price must not be negative (got {0})")]
    InvalidPrice(Decimal),
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
    #[error("storage did not respond within {0:?}")]
    StorageTimeout(Duration),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("audit write failed: {0}")]
    AuditWriteFailed(String),
}

impl SchedulingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SchedulingError::IllegalTransition { .. }
            | SchedulingError::CancellationNotAllowed { .. } => ErrorClass::StateMachine,
            SchedulingError::StorageTimeout(_) | SchedulingError::StorageUnavailable(_) => {
                ErrorClass::Transient
            }
            SchedulingError::AuditWriteFailed(_) => ErrorClass::Fatal,
            _ => ErrorClass::Validation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Stable machine-readable label.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulingError::UnknownStaff(_) => "unknown_staff",
            SchedulingError::UnknownService(_) => "unknown_service",
            SchedulingError::AppointmentNotFound(_) => "appointment_not_found",
            SchedulingError::StaffUnavailable(_) => "staff_unavailable",
            SchedulingError::ServiceInactive(_) => "service_inactive",
            SchedulingError::PastScheduling { .. } => "past_scheduling",
            SchedulingError::OutsideBusinessHours { .. } => "outside_business_hours",
            SchedulingError::NonBusinessDay { .. } => "non_business_day",
            SchedulingError::SchedulingConflict { .. } => "scheduling_conflict",
            SchedulingError::InvalidPrice(_) => "invalid_price",
            SchedulingError::IllegalTransition { .. } => "illegal_transition",
            SchedulingError::CancellationNotAllowed { .. } => "cancellation_not_allowed",
            SchedulingError::StorageTimeout(_) => "storage_timeout",
            SchedulingError::StorageUnavailable(_) => "storage_unavailable",
            SchedulingError::AuditWriteFailed(_) => "audit_write_failed",
        }
    }
}

impl From<RepositoryError> for SchedulingError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Timeout(waited) => SchedulingError::StorageTimeout(waited),
            other => SchedulingError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<AuditError> for SchedulingError {
    fn from(value: AuditError) -> Self {
        SchedulingError::AuditWriteFailed(value.to_string())
    }
}

impl From<DirectoryError> for SchedulingError {
    fn from(value: DirectoryError) -> Self {
        SchedulingError::StorageUnavailable(value.to_string())
    }
}

impl From<CalendarViolation> for SchedulingError {
    fn from(value: CalendarViolation) -> Self {
        match value {
            CalendarViolation::OutsideBusinessHours { hour } => {
                SchedulingError::OutsideBusinessHours { hour }
            }
            CalendarViolation::NonBusinessDay { weekday } => {
                SchedulingError::NonBusinessDay { weekday }
            }
        }
    }
}

impl From<LifecycleError> for SchedulingError {
    fn from(value: LifecycleError) -> Self {
        match value {
            LifecycleError::IllegalTransition { from, to } => {
                SchedulingError::IllegalTransition { from, to }
            }
            LifecycleError::CancellationNotAllowed { id, status } => {
                SchedulingError::CancellationNotAllowed { id, status }
            }
        }
    }
}
