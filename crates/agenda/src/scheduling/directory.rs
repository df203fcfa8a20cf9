use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::NaiveDate;

use super::domain::{Service, ServiceId, Staff, StaffId};

/// Read-only view over the service catalogue and staff roster.
pub trait DirectoryStore: Send + Sync {
    fn service(&self, id: &ServiceId) -> Result<Option<Service>, DirectoryError>;
    fn staff(&self, id: &StaffId) -> Result<Option<Staff>, DirectoryError>;
    fn services(&self) -> Result<Vec<Service>, DirectoryError>;
    fn staff_members(&self) -> Result<Vec<Staff>, DirectoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Services that can be offered on a booking form.
pub fn active_services<D>(directory: &D) -> Result<Vec<Service>, DirectoryError>
where
    D: DirectoryStore + ?Sized,
{
    Ok(directory
        .services()?
        .into_iter()
        .filter(|service| service.active)
        .collect())
}

/// Staff members who can take a booking on `today`.
pub fn available_staff<D>(directory: &D, today: NaiveDate) -> Result<Vec<Staff>, DirectoryError>
where
    D: DirectoryStore + ?Sized,
{
    Ok(directory
        .staff_members()?
        .into_iter()
        .filter(|staff| staff.is_available(today))
        .collect())
}

/// Directory held in memory; populated by whatever owns the catalogue.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    services: RwLock<BTreeMap<ServiceId, Service>>,
    staff: RwLock<BTreeMap<StaffId, Staff>>,
}

impl InMemoryDirectory {
    pub fn put_service(&self, service: Service) -> Result<(), DirectoryError> {
        let mut guard = self.services.write().map_err(poisoned)?;
        guard.insert(service.id.clone(), service);
        Ok(())
    }

    pub fn put_staff(&self, staff: Staff) -> Result<(), DirectoryError> {
        let mut guard = self.staff.write().map_err(poisoned)?;
        guard.insert(staff.id.clone(), staff);
        Ok(())
    }
}

fn poisoned<T>(_: T) -> DirectoryError {
    DirectoryError::Unavailable("directory lock poisoned".to_string())
}

impl DirectoryStore for InMemoryDirectory {
    fn service(&self, id: &ServiceId) -> Result<Option<Service>, DirectoryError> {
        let guard = self.services.read().map_err(poisoned)?;
        Ok(guard.get(id).cloned())
    }

    fn staff(&self, id: &StaffId) -> Result<Option<Staff>, DirectoryError> {
        let guard = self.staff.read().map_err(poisoned)?;
        Ok(guard.get(id).cloned())
    }

    fn services(&self) -> Result<Vec<Service>, DirectoryError> {
        let guard = self.services.read().map_err(poisoned)?;
        Ok(guard.values().cloned().collect())
    }

    fn staff_members(&self) -> Result<Vec<Staff>, DirectoryError> {
        let guard = self.staff.read().map_err(poisoned)?;
        Ok(guard.values().cloned().collect())
    }
}
