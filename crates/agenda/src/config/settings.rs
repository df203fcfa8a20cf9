//! Company-wide settings held as a single named record.
//!
//! The registry loads the record once, hands out shared snapshots to readers, and applies
//! changes by writing through the backing [`SettingsSource`] and then reloading from it, so
//! readers never observe a value the source did not accept. Writers are serialized; a change
//! whose confirmation step fails is written back to the previous record.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::scheduling::clock::{Clock, SystemClock};

/// Branding and contact details shown to clients, plus the opening-hours blurb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanySettings {
    pub company_name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub whatsapp_number: Option<String>,
    #[serde(default)]
    pub whatsapp_enabled: bool,
    #[serde(default)]
    pub welcome_message: Option<String>,
    #[serde(default)]
    pub business_hours: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for CompanySettings {
    fn default() -> Self {
        Self {
            company_name: "My Company".to_string(),
            address: None,
            phone: None,
            email: None,
            website: None,
            whatsapp_number: None,
            whatsapp_enabled: false,
            welcome_message: Some("Welcome to our booking system!".to_string()),
            business_hours: Some("Monday to Friday: 08:00 - 18:00".to_string()),
            updated_at: None,
        }
    }
}

/// Errors surfaced while loading or persisting company settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("company name must not be empty")]
    MissingCompanyName,
    #[error("settings registry lock poisoned")]
    Poisoned,
    #[error("company settings were already installed for this process")]
    AlreadyInstalled,
}

/// Backing storage for the settings record.
pub trait SettingsSource: Send + Sync {
    fn load(&self) -> Result<CompanySettings, SettingsError>;
    fn store(&self, settings: &CompanySettings) -> Result<(), SettingsError>;
}

impl<T: SettingsSource + ?Sized> SettingsSource for Arc<T> {
    fn load(&self) -> Result<CompanySettings, SettingsError> {
        (**self).load()
    }

    fn store(&self, settings: &CompanySettings) -> Result<(), SettingsError> {
        (**self).store(settings)
    }
}

/// Settings persisted as a JSON document. A missing file yields the defaults.
#[derive(Debug, Clone)]
pub struct JsonFileSettingsSource {
    path: PathBuf,
}

impl JsonFileSettingsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsSource for JsonFileSettingsSource {
    fn load(&self) -> Result<CompanySettings, SettingsError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CompanySettings::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&raw).map_err(|source| SettingsError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, settings: &CompanySettings) -> Result<(), SettingsError> {
        let payload =
            serde_json::to_vec_pretty(settings).map_err(|source| SettingsError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        fs::write(&self.path, payload).map_err(|source| SettingsError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Process-local source, used by tests and the demo binary.
#[derive(Debug, Default)]
pub struct InMemorySettingsSource {
    record: Mutex<Option<CompanySettings>>,
}

impl InMemorySettingsSource {
    pub fn with(settings: CompanySettings) -> Self {
        Self {
            record: Mutex::new(Some(settings)),
        }
    }
}

impl SettingsSource for InMemorySettingsSource {
    fn load(&self) -> Result<CompanySettings, SettingsError> {
        let guard = self.record.lock().map_err(|_| SettingsError::Poisoned)?;
        Ok(guard.clone().unwrap_or_default())
    }

    fn store(&self, settings: &CompanySettings) -> Result<(), SettingsError> {
        let mut guard = self.record.lock().map_err(|_| SettingsError::Poisoned)?;
        *guard = Some(settings.clone());
        Ok(())
    }
}

/// Read-mostly holder of the current settings snapshot.
pub struct SettingsRegistry {
    source: Box<dyn SettingsSource>,
    current: RwLock<Arc<CompanySettings>>,
    writer: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl SettingsRegistry {
    pub fn load(source: Box<dyn SettingsSource>) -> Result<Self, SettingsError> {
        let settings = source.load()?;
        Ok(Self {
            source,
            current: RwLock::new(Arc::new(settings)),
            writer: Mutex::new(()),
            clock: Arc::new(SystemClock),
        })
    }

    /// Clock used to stamp `updated_at`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn current(&self) -> Result<Arc<CompanySettings>, SettingsError> {
        let guard = self.current.read().map_err(|_| SettingsError::Poisoned)?;
        Ok(Arc::clone(&guard))
    }

    /// Apply `mutation` to a copy of the current record, persist it, then reload.
    pub fn update<F>(&self, mutation: F) -> Result<Arc<CompanySettings>, SettingsError>
    where
        F: FnOnce(&mut CompanySettings),
    {
        self.update_confirmed(mutation, |_, _| Ok(()))
    }

    /// Like [`update`](Self::update), with `confirm` run against the previous and the new
    /// record once the source holds the new one. If `confirm` fails the previous record is
    /// stored again and the shared snapshot never changes.
    pub fn update_confirmed<F, C, E>(
        &self,
        mutation: F,
        confirm: C,
    ) -> Result<Arc<CompanySettings>, E>
    where
        F: FnOnce(&mut CompanySettings),
        C: FnOnce(&CompanySettings, &CompanySettings) -> Result<(), E>,
        E: From<SettingsError>,
    {
        let _writer = self.writer.lock().map_err(|_| SettingsError::Poisoned)?;
        let previous = self.current()?;
        let mut draft = (*previous).clone();
        mutation(&mut draft);
        if draft.company_name.trim().is_empty() {
            return Err(SettingsError::MissingCompanyName.into());
        }
        draft.updated_at = Some(self.clock.now());

        self.source.store(&draft)?;
        if let Err(err) = confirm(previous.as_ref(), &draft) {
            if let Err(restore) = self.source.store(previous.as_ref()) {
                error!(error = %restore, "could not restore company settings");
            }
            return Err(err);
        }
        Ok(self.reload()?)
    }

    /// Re-read the record from the source, replacing the shared snapshot.
    pub fn reload(&self) -> Result<Arc<CompanySettings>, SettingsError> {
        let fresh = Arc::new(self.source.load()?);
        let mut guard = self.current.write().map_err(|_| SettingsError::Poisoned)?;
        *guard = Arc::clone(&fresh);
        Ok(fresh)
    }
}

static GLOBAL: OnceLock<SettingsRegistry> = OnceLock::new();

/// Install the process-wide registry. Only the first call succeeds.
pub fn install(registry: SettingsRegistry) -> Result<&'static SettingsRegistry, SettingsError> {
    GLOBAL
        .set(registry)
        .map_err(|_| SettingsError::AlreadyInstalled)?;
    GLOBAL.get().ok_or(SettingsError::AlreadyInstalled)
}

pub fn global() -> Option<&'static SettingsRegistry> {
    GLOBAL.get()
}
