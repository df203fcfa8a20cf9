//! Append-only audit trail.
//!
//! Entries are written through a [`StoreTransaction`](super::repository::StoreTransaction) so
//! they commit or roll back together with the change they describe. The [`AuditTrail`] facade
//! is the entry point for collaborators outside the engine (login/logout, admin screens).

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::domain::{Actor, ActorId, RequestOrigin};
use super::repository::{RepositoryError, SchedulingStore, TransactionScope};

/// Kind of action an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Login,
    Logout,
    View,
}

impl AuditAction {
    pub const fn label(self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Login => "login",
            AuditAction::Logout => "logout",
            AuditAction::View => "view",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Structured detail payload.
pub type AuditDetail = BTreeMap<String, Value>;

/// Everything a caller supplies for a new entry; the log assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// `None` marks a system-initiated action.
    pub actor: Option<ActorId>,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub snapshot: String,
    #[serde(default)]
    pub detail: AuditDetail,
    #[serde(default)]
    pub source_address: Option<IpAddr>,
    #[serde(default)]
    pub client_agent: Option<String>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, entity_type: impl Into<String>) -> Self {
        Self {
            actor: None,
            action,
            entity_type: entity_type.into(),
            entity_id: None,
            snapshot: String::new(),
            detail: AuditDetail::new(),
            source_address: None,
            client_agent: None,
        }
    }

    pub fn by(mut self, actor: &Actor) -> Self {
        self.actor = Some(actor.id.clone());
        self
    }

    pub fn target(mut self, entity_id: impl Into<String>, snapshot: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self.snapshot = snapshot.into();
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }

    pub fn from_origin(mut self, origin: &RequestOrigin) -> Self {
        self.source_address = origin.address;
        self.client_agent = origin.client_agent.clone();
        self
    }
}

/// Immutable, persisted audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic sequence number; insertion order.
    pub sequence: u64,
    pub actor: Option<ActorId>,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub snapshot: String,
    pub detail: AuditDetail,
    pub source_address: Option<IpAddr>,
    pub client_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn from_record(sequence: u64, record: AuditRecord, timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence,
            actor: record.actor,
            action: record.action,
            entity_type: record.entity_type,
            entity_id: record.entity_id,
            snapshot: record.snapshot,
            detail: record.detail,
            source_address: record.source_address,
            client_agent: record.client_agent,
            timestamp,
        }
    }

    pub fn summary(&self) -> String {
        let actor = self
            .actor
            .as_ref()
            .map_or("system", |actor| actor.0.as_str());
        format!(
            "{} - {} - {} - {}",
            actor,
            self.action,
            self.entity_type,
            self.timestamp.format("%d/%m/%Y %H:%M")
        )
    }
}

/// Filter over the audit trail. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub actor: Option<ActorId>,
    #[serde(default)]
    pub action: Option<AuditAction>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

impl AuditQuery {
    pub fn for_entity(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.actor
            .as_ref()
            .map_or(true, |actor| entry.actor.as_ref() == Some(actor))
            && self.action.map_or(true, |action| entry.action == action)
            && self
                .entity_type
                .as_ref()
                .map_or(true, |kind| &entry.entity_type == kind)
            && self
                .entity_id
                .as_ref()
                .map_or(true, |id| entry.entity_id.as_ref() == Some(id))
            && self.since.map_or(true, |since| entry.timestamp >= since)
    }
}

/// Write side and history queries of the audit trail.
pub trait AuditLog {
    fn record(&mut self, record: AuditRecord) -> Result<AuditEntry, AuditError>;
    /// Matching entries in insertion order.
    fn history(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit record rejected: {0}")]
    Rejected(String),
    #[error("audit log unavailable: {0}")]
    Unavailable(String),
}

impl From<RepositoryError> for AuditError {
    fn from(value: RepositoryError) -> Self {
        AuditError::Unavailable(value.to_string())
    }
}

/// Entry point for collaborators that log events outside a scheduling operation.
pub struct AuditTrail<S> {
    store: Arc<S>,
}

impl<S> AuditTrail<S>
where
    S: SchedulingStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Write a single entry in its own transaction.
    pub fn record(&self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        if record.entity_type.trim().is_empty() {
            return Err(AuditError::Rejected("entity type is required".to_string()));
        }

        let mut tx = self.store.begin(TransactionScope::Exclusive(Vec::new()))?;
        let entry = tx.record(record)?;
        tx.commit()?;

        tracing::debug!(
            sequence = entry.sequence,
            action = %entry.action,
            entity = %entry.entity_type,
            "audit entry recorded"
        );
        Ok(entry)
    }

    pub fn history(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
        let tx = self.store.begin(TransactionScope::ReadOnly)?;
        tx.history(query)
    }
}
