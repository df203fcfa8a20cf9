//! In-process implementation of [`SchedulingStore`].
//!
//! Writers name the staff members they touch; the store hands out those staff locks
//! all-or-nothing, so two transactions on the same staff member never interleave their
//! overlap check and their write. Writes are staged inside the transaction and applied under
//! a single state lock on commit.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::audit::{AuditEntry, AuditError, AuditLog, AuditQuery, AuditRecord};
use super::clock::{Clock, SystemClock};
use super::domain::{Appointment, AppointmentId, StaffId, TimeSlot, MAX_SERVICE_MINUTES};
use super::repository::{
    AppointmentFilter, AppointmentRepository, RepositoryError, SchedulingStore,
    StoreTransaction, TransactionScope,
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

pub struct InMemoryStore {
    state: Mutex<StoreState>,
    held: Mutex<HashSet<StaffId>>,
    released: Condvar,
    audit_sequence: AtomicU64,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

#[derive(Default)]
struct StoreState {
    appointments: HashMap<AppointmentId, Appointment>,
    /// (staff, start, id) index backing range queries.
    by_staff: BTreeSet<(StaffId, DateTime<Utc>, AppointmentId)>,
    audit: Vec<AuditEntry>,
}

impl StoreState {
    fn upsert(&mut self, appointment: Appointment) {
        self.unindex(&appointment.id);
        self.by_staff.insert((
            appointment.staff.clone(),
            appointment.scheduled_start,
            appointment.id.clone(),
        ));
        self.appointments.insert(appointment.id.clone(), appointment);
    }

    fn remove(&mut self, id: &AppointmentId) {
        self.unindex(id);
        self.appointments.remove(id);
    }

    fn unindex(&mut self, id: &AppointmentId) {
        if let Some(previous) = self.appointments.get(id) {
            self.by_staff.remove(&(
                previous.staff.clone(),
                previous.scheduled_start,
                previous.id.clone(),
            ));
        }
    }

    /// Committed appointments of `staff` starting early enough to reach into `slot`. No
    /// service runs longer than [`MAX_SERVICE_MINUTES`], which bounds the backward scan.
    fn candidates<'s>(
        &'s self,
        staff: &StaffId,
        slot: &TimeSlot,
    ) -> impl Iterator<Item = &'s Appointment> + 's {
        let reach = chrono::Duration::minutes(i64::from(MAX_SERVICE_MINUTES));
        let lower = (
            staff.clone(),
            slot.start - reach,
            AppointmentId(String::new()),
        );
        let upper = (staff.clone(), slot.end, AppointmentId(String::new()));
        self.by_staff
            .range(lower..upper)
            .filter_map(|(_, _, id)| self.appointments.get(id))
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            audit_sequence: AtomicU64::new(1),
            clock,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// How long `begin` waits for contended staff locks before giving up.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, StoreState>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Unavailable("store state lock poisoned".to_string()))
    }

    fn acquire(&self, staff: &[StaffId]) -> Result<(), RepositoryError> {
        if staff.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + self.lock_timeout;
        let mut held = self
            .held
            .lock()
            .map_err(|_| RepositoryError::Unavailable("staff lock table poisoned".to_string()))?;

        while staff.iter().any(|id| held.contains(id)) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RepositoryError::Timeout(self.lock_timeout));
            }
            let (guard, _) = self.released.wait_timeout(held, remaining).map_err(|_| {
                RepositoryError::Unavailable("staff lock table poisoned".to_string())
            })?;
            held = guard;
        }

        held.extend(staff.iter().cloned());
        Ok(())
    }

    fn release(&self, staff: &[StaffId]) {
        if staff.is_empty() {
            return;
        }

        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for id in staff {
            held.remove(id);
        }
        drop(held);
        self.released.notify_all();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulingStore for InMemoryStore {
    fn begin(
        &self,
        scope: TransactionScope,
    ) -> Result<Box<dyn StoreTransaction + '_>, RepositoryError> {
        if let TransactionScope::Exclusive(staff) = &scope {
            self.acquire(staff)?;
        }

        Ok(Box::new(MemoryTransaction {
            store: self,
            scope,
            staged: BTreeMap::new(),
            audit: Vec::new(),
        }))
    }
}

struct MemoryTransaction<'a> {
    store: &'a InMemoryStore,
    scope: TransactionScope,
    /// `None` marks a staged deletion.
    staged: BTreeMap<AppointmentId, Option<Appointment>>,
    audit: Vec<AuditEntry>,
}

impl MemoryTransaction<'_> {
    fn ensure_holds(&self, staff: &StaffId) -> Result<(), RepositoryError> {
        match &self.scope {
            TransactionScope::ReadOnly => Err(RepositoryError::ReadOnly),
            TransactionScope::Exclusive(held) if held.contains(staff) => Ok(()),
            TransactionScope::Exclusive(_) => {
                Err(RepositoryError::ScopeViolation(staff.clone()))
            }
        }
    }

    fn current(&self, id: &AppointmentId) -> Result<Option<Appointment>, RepositoryError> {
        if let Some(staged) = self.staged.get(id) {
            return Ok(staged.clone());
        }
        let state = self.store.state()?;
        Ok(state.appointments.get(id).cloned())
    }
}

impl AppointmentRepository for MemoryTransaction<'_> {
    fn find_overlapping(
        &self,
        staff: &StaffId,
        slot: &TimeSlot,
        exclude: Option<&AppointmentId>,
        length: &dyn Fn(&Appointment) -> chrono::Duration,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        let state = self.store.state()?;
        let committed = state
            .candidates(staff, slot)
            .filter(|appointment| !self.staged.contains_key(&appointment.id))
            .cloned();
        let staged = self
            .staged
            .values()
            .flatten()
            .filter(|appointment| &appointment.staff == staff)
            .cloned();

        Ok(committed
            .chain(staged)
            .filter(|appointment| Some(&appointment.id) != exclude)
            .filter(|appointment| appointment.status.occupies_slot())
            .filter(|appointment| {
                appointment
                    .slot_lasting(length(appointment))
                    .intersects(slot)
            })
            .collect())
    }

    fn get(&self, id: &AppointmentId) -> Result<Option<Appointment>, RepositoryError> {
        self.current(id)
    }

    fn list(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, RepositoryError> {
        let state = self.store.state()?;
        let mut matches: Vec<Appointment> = state
            .appointments
            .values()
            .filter(|appointment| !self.staged.contains_key(&appointment.id))
            .chain(self.staged.values().flatten())
            .filter(|appointment| filter.matches(appointment))
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            b.scheduled_start
                .cmp(&a.scheduled_start)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(matches)
    }

    fn save(&mut self, appointment: Appointment) -> Result<Appointment, RepositoryError> {
        self.ensure_holds(&appointment.staff)?;
        if let Some(previous) = self.current(&appointment.id)? {
            self.ensure_holds(&previous.staff)?;
        }

        self.staged
            .insert(appointment.id.clone(), Some(appointment.clone()));
        Ok(appointment)
    }

    fn delete(&mut self, id: &AppointmentId) -> Result<Appointment, RepositoryError> {
        let existing = self.current(id)?.ok_or(RepositoryError::NotFound)?;
        self.ensure_holds(&existing.staff)?;

        self.staged.insert(id.clone(), None);
        Ok(existing)
    }
}

impl AuditLog for MemoryTransaction<'_> {
    fn record(&mut self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        if self.scope == TransactionScope::ReadOnly {
            return Err(AuditError::Rejected(
                "read-only transaction cannot write audit entries".to_string(),
            ));
        }

        let sequence = self.store.audit_sequence.fetch_add(1, Ordering::Relaxed);
        let entry = AuditEntry::from_record(sequence, record, self.store.clock.now());
        self.audit.push(entry.clone());
        Ok(entry)
    }

    fn history(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
        let state = self.store.state()?;
        let mut entries: Vec<AuditEntry> = state
            .audit
            .iter()
            .chain(self.audit.iter())
            .filter(|entry| query.matches(entry))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.sequence);
        Ok(entries)
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn commit(mut self: Box<Self>) -> Result<(), RepositoryError> {
        let staged = std::mem::take(&mut self.staged);
        let audit = std::mem::take(&mut self.audit);

        let mut state = self.store.state()?;
        for (id, change) in staged {
            match change {
                Some(appointment) => state.upsert(appointment),
                None => state.remove(&id),
            }
        }
        state.audit.extend(audit);
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if let TransactionScope::Exclusive(staff) = &self.scope {
            self.store.release(staff);
        }
    }
}
