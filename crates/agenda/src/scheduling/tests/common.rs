use std::sync::Arc;

use axum::response::Response;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal_macros::dec;
use serde_json::Value;

use crate::scheduling::audit::{AuditEntry, AuditError, AuditLog, AuditQuery, AuditRecord};
use crate::scheduling::clock::{Clock, FixedClock};
use crate::scheduling::directory::InMemoryDirectory;
use crate::scheduling::domain::{
    Actor, ActorId, Appointment, AppointmentId, BookingRequest, Capability, ClientId,
    RequestContext, Role, Service, ServiceId, Staff, StaffId, TimeSlot,
};
use crate::scheduling::engine::SchedulingEngine;
use crate::scheduling::memory::InMemoryStore;
use crate::scheduling::policy::SchedulingPolicy;
use crate::scheduling::repository::{
    AppointmentFilter, AppointmentRepository, RepositoryError, SchedulingStore,
    StoreTransaction, TransactionScope,
};

/// Instant in March 2025 (the 10th is a Monday).
pub(super) fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

/// Friday before the booking week.
pub(super) fn now() -> DateTime<Utc> {
    at(7, 12, 0)
}

pub(super) fn staff_x() -> StaffId {
    StaffId("staff-x".to_string())
}

pub(super) fn staff_y() -> StaffId {
    StaffId("staff-y".to_string())
}

pub(super) fn former_staff() -> StaffId {
    StaffId("staff-gone".to_string())
}

pub(super) fn consulta() -> ServiceId {
    ServiceId("consulta".to_string())
}

pub(super) fn limpeza() -> ServiceId {
    ServiceId("limpeza".to_string())
}

pub(super) fn retired_service() -> ServiceId {
    ServiceId("retired".to_string())
}

fn staff(id: StaffId, name: &str, code: &str) -> Staff {
    Staff {
        person: ActorId(format!("person-{}", id.0)),
        id,
        display_name: name.to_string(),
        employee_code: code.to_string(),
        hired_on: NaiveDate::from_ymd_opt(2024, 1, 15).expect("valid date"),
        terminated_on: None,
        active: true,
    }
}

pub(super) fn directory() -> Arc<InMemoryDirectory> {
    let directory = InMemoryDirectory::default();
    directory
        .put_staff(staff(staff_x(), "Xavier", "FUNC0001"))
        .expect("staff x");
    directory
        .put_staff(staff(staff_y(), "Yara", "FUNC0002"))
        .expect("staff y");
    let mut gone = staff(former_staff(), "Gabriel", "FUNC0003");
    gone.terminated_on = NaiveDate::from_ymd_opt(2025, 1, 31);
    directory.put_staff(gone).expect("former staff");

    directory
        .put_service(Service::new(consulta(), "Consulta", dec!(100.00), 60).expect("consulta"))
        .expect("consulta");
    directory
        .put_service(Service::new(limpeza(), "Limpeza", dec!(150.00), 90).expect("limpeza"))
        .expect("limpeza");
    let mut retired =
        Service::new(retired_service(), "Clareamento", dec!(300.00), 120).expect("retired");
    retired.active = false;
    directory.put_service(retired).expect("retired");

    Arc::new(directory)
}

pub(super) fn master() -> RequestContext {
    RequestContext::new(Actor::new("admin", "Admin", Role::Master))
}

pub(super) fn clerk() -> RequestContext {
    RequestContext::new(
        Actor::new("clerk", "Clerk", Role::Restricted)
            .with_capability(Capability::ScheduleAppointments)
            .with_capability(Capability::ViewAppointments),
    )
}

pub(super) fn booking(client: &str, staff: StaffId, start: DateTime<Utc>) -> BookingRequest {
    BookingRequest {
        client: ClientId(client.to_string()),
        client_name: Some(format!("Client {}", client.to_uppercase())),
        staff,
        service: consulta(),
        start,
        notes: None,
        final_price: None,
    }
}

pub(super) type MemoryEngine = SchedulingEngine<InMemoryStore, InMemoryDirectory>;

pub(super) struct Harness {
    pub(super) engine: Arc<MemoryEngine>,
    pub(super) store: Arc<InMemoryStore>,
    pub(super) clock: Arc<FixedClock>,
}

pub(super) fn harness() -> Harness {
    harness_with(SchedulingPolicy::default())
}

pub(super) fn harness_with(policy: SchedulingPolicy) -> Harness {
    let clock = Arc::new(FixedClock::new(now()));
    let store = Arc::new(
        InMemoryStore::with_clock(clock.clone())
            .lock_timeout(std::time::Duration::from_millis(50)),
    );
    let engine = Arc::new(SchedulingEngine::new(
        store.clone(),
        directory(),
        clock.clone(),
        policy,
    ));
    Harness {
        engine,
        store,
        clock,
    }
}

pub(super) fn engine_over<S>(store: Arc<S>) -> SchedulingEngine<S, InMemoryDirectory>
where
    S: SchedulingStore + 'static,
{
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(now()));
    SchedulingEngine::new(store, directory(), clock, SchedulingPolicy::default())
}

/// Committed appointment used when a test needs to seed the store directly.
pub(super) fn stored_appointment(
    id: &str,
    staff: StaffId,
    start: DateTime<Utc>,
    duration_minutes: u32,
) -> Appointment {
    Appointment {
        id: AppointmentId(id.to_string()),
        client: ClientId("client-seed".to_string()),
        staff,
        service: consulta(),
        client_name: None,
        service_name: "Consulta".to_string(),
        scheduled_start: start,
        duration_minutes,
        status: crate::scheduling::domain::AppointmentStatus::Scheduled,
        notes: None,
        final_price: dec!(100.00),
        created_by: None,
        created_at: now(),
        updated_at: now(),
    }
}

pub(super) fn seed(store: &InMemoryStore, appointment: Appointment) {
    let mut tx = store
        .begin(TransactionScope::staff([appointment.staff.clone()]))
        .expect("begin");
    tx.save(appointment).expect("save");
    tx.commit().expect("commit");
}

pub(super) fn committed(store: &InMemoryStore) -> Vec<Appointment> {
    let tx = store.begin(TransactionScope::ReadOnly).expect("begin");
    tx.list(&AppointmentFilter::default()).expect("list")
}

/// Store whose transactions refuse every audit write.
pub(super) struct FailingAuditStore {
    pub(super) inner: InMemoryStore,
}

impl FailingAuditStore {
    pub(super) fn new() -> Self {
        Self {
            inner: InMemoryStore::with_clock(Arc::new(FixedClock::new(now()))),
        }
    }
}

impl SchedulingStore for FailingAuditStore {
    fn begin(
        &self,
        scope: TransactionScope,
    ) -> Result<Box<dyn StoreTransaction + '_>, RepositoryError> {
        let inner = self.inner.begin(scope)?;
        Ok(Box::new(FailingAuditTransaction { inner }))
    }
}

struct FailingAuditTransaction<'a> {
    inner: Box<dyn StoreTransaction + 'a>,
}

impl AppointmentRepository for FailingAuditTransaction<'_> {
    fn find_overlapping(
        &self,
        staff: &StaffId,
        slot: &TimeSlot,
        exclude: Option<&AppointmentId>,
        length: &dyn Fn(&Appointment) -> chrono::Duration,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        self.inner.find_overlapping(staff, slot, exclude, length)
    }

    fn get(&self, id: &AppointmentId) -> Result<Option<Appointment>, RepositoryError> {
        self.inner.get(id)
    }

    fn list(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, RepositoryError> {
        self.inner.list(filter)
    }

    fn save(&mut self, appointment: Appointment) -> Result<Appointment, RepositoryError> {
        self.inner.save(appointment)
    }

    fn delete(&mut self, id: &AppointmentId) -> Result<Appointment, RepositoryError> {
        self.inner.delete(id)
    }
}

impl AuditLog for FailingAuditTransaction<'_> {
    fn record(&mut self, _record: AuditRecord) -> Result<AuditEntry, AuditError> {
        Err(AuditError::Unavailable("audit disk full".to_string()))
    }

    fn history(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
        self.inner.history(query)
    }
}

impl StoreTransaction for FailingAuditTransaction<'_> {
    fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        self.inner.commit()
    }
}

/// Store that never answers.
pub(super) struct UnavailableStore;

impl SchedulingStore for UnavailableStore {
    fn begin(
        &self,
        _scope: TransactionScope,
    ) -> Result<Box<dyn StoreTransaction + '_>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
