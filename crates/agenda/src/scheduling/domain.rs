use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Longest service a business may offer, in minutes.
pub const MAX_SERVICE_MINUTES: u32 = 1440;

/// Identifier wrapper for offered services.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub String);

/// Identifier wrapper for staff members.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StaffId(pub String);

/// Identifier wrapper for the client an appointment is booked for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

/// Identifier wrapper for persisted appointments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppointmentId(pub String);

/// Identifier of an authenticated person acting on the system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(pub String);

macro_rules! display_id {
    ($($ty:ty),+) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        })+
    };
}

display_id!(ServiceId, StaffId, ClientId, AppointmentId, ActorId);

/// A bookable service with its list price and length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: Decimal,
    pub duration_minutes: u32,
    pub active: bool,
}

impl Service {
    pub fn new(
        id: ServiceId,
        name: impl Into<String>,
        price: Decimal,
        duration_minutes: u32,
    ) -> Result<Self, InvalidService> {
        if price < Decimal::ZERO {
            return Err(InvalidService::NegativePrice(price));
        }
        if !(1..=MAX_SERVICE_MINUTES).contains(&duration_minutes) {
            return Err(InvalidService::Duration(duration_minutes));
        }

        Ok(Self {
            id,
            name: name.into(),
            description: None,
            price,
            duration_minutes,
            active: true,
        })
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.duration_minutes))
    }

    /// Renders the duration as `1h 30min`, `2h` or `45min`.
    pub fn formatted_duration(&self) -> String {
        let hours = self.duration_minutes / 60;
        let minutes = self.duration_minutes % 60;
        match (hours, minutes) {
            (0, minutes) => format!("{minutes}min"),
            (hours, 0) => format!("{hours}h"),
            (hours, minutes) => format!("{hours}h {minutes}min"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidService {
    #[error("service price must not be negative (got {0})")]
    NegativePrice(Decimal),
    #[error("service duration must be between 1 and 1440 minutes (got {0})")]
    Duration(u32),
}

/// Staff member who can be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staff {
    pub id: StaffId,
    /// The person record behind this staff member.
    pub person: ActorId,
    pub display_name: String,
    pub employee_code: String,
    pub hired_on: NaiveDate,
    #[serde(default)]
    pub terminated_on: Option<NaiveDate>,
    pub active: bool,
}

impl Staff {
    /// Active, already hired, and not yet past their termination date.
    pub fn is_available(&self, today: NaiveDate) -> bool {
        self.active
            && self.hired_on <= today
            && self.terminated_on.map_or(true, |end| end > today)
    }
}

/// Lifecycle state of an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 4] = [
        AppointmentStatus::Scheduled,
        AppointmentStatus::InProgress,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.label().eq_ignore_ascii_case(label.trim()))
    }

    /// Statuses that hold the staff member's time.
    pub const fn occupies_slot(self) -> bool {
        matches!(
            self,
            AppointmentStatus::Scheduled | AppointmentStatus::InProgress
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeSlot {
    pub fn new(start: DateTime<Utc>, length: Duration) -> Self {
        Self {
            start,
            end: start + length,
        }
    }

    /// Back-to-back slots (one ending exactly where the other starts) do not intersect.
    pub fn intersects(&self, other: &TimeSlot) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A booked time slot for one client, one staff member and one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub client: ClientId,
    pub staff: StaffId,
    pub service: ServiceId,
    /// Display names captured at booking time for audit snapshots.
    pub client_name: Option<String>,
    pub service_name: String,
    pub scheduled_start: DateTime<Utc>,
    /// Service length captured when the slot was last validated. Overlap checks use the
    /// service's current length and only fall back to this once the service is gone.
    pub duration_minutes: u32,
    pub status: AppointmentStatus,
    #[serde(default)]
    pub notes: Option<String>,
    pub final_price: Decimal,
    pub created_by: Option<ActorId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn end(&self) -> DateTime<Utc> {
        self.slot().end
    }

    /// Slot as booked, using the duration captured when the appointment was saved.
    pub fn slot(&self) -> TimeSlot {
        self.slot_lasting(Duration::minutes(i64::from(self.duration_minutes)))
    }

    pub fn slot_lasting(&self, length: Duration) -> TimeSlot {
        TimeSlot::new(self.scheduled_start, length)
    }

    /// True once the start is no longer in the future; a start equal to `now` counts.
    pub fn is_in_past(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_start <= now
    }

    pub fn can_cancel(&self, now: DateTime<Utc>) -> bool {
        self.status == AppointmentStatus::Scheduled && !self.is_in_past(now)
    }

    /// Human-readable line used as the audit snapshot.
    pub fn summary(&self) -> String {
        let client = self
            .client_name
            .as_deref()
            .unwrap_or_else(|| self.client.0.as_str());
        format!(
            "{} - {} - {}",
            client,
            self.service_name,
            self.scheduled_start.format("%d/%m/%Y %H:%M")
        )
    }
}

/// Coarse role assigned by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Restricted,
    Client,
}

impl Role {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "master" => Some(Role::Master),
            "restricted" => Some(Role::Restricted),
            "client" => Some(Role::Client),
            _ => None,
        }
    }
}

/// Individually grantable permissions for restricted users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    RegisterClients,
    RegisterStaff,
    RegisterPositions,
    ScheduleAppointments,
    ViewAppointments,
    ViewReports,
}

impl Capability {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "register_clients" => Some(Capability::RegisterClients),
            "register_staff" => Some(Capability::RegisterStaff),
            "register_positions" => Some(Capability::RegisterPositions),
            "schedule_appointments" => Some(Capability::ScheduleAppointments),
            "view_appointments" => Some(Capability::ViewAppointments),
            "view_reports" => Some(Capability::ViewReports),
            _ => None,
        }
    }
}

/// Authenticated identity resolved upstream, with the capabilities it was granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub display_name: String,
    pub role: Role,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
}

impl Actor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: ActorId(id.into()),
            display_name: display_name.into(),
            role,
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// Masters hold every capability implicitly.
    pub fn can(&self, capability: Capability) -> bool {
        self.is_master() || self.capabilities.contains(&capability)
    }
}

/// Where a request came from, recorded on audit entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOrigin {
    pub address: Option<IpAddr>,
    pub client_agent: Option<String>,
}

impl RequestOrigin {
    /// Prefers the first hop of `X-Forwarded-For`, falling back to the peer address.
    pub fn from_forwarded(
        forwarded_for: Option<&str>,
        peer: Option<IpAddr>,
        client_agent: Option<&str>,
    ) -> Self {
        let forwarded = forwarded_for
            .and_then(|raw| raw.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());

        Self {
            address: forwarded.or(peer),
            client_agent: client_agent
                .map(str::trim)
                .filter(|agent| !agent.is_empty())
                .map(str::to_string),
        }
    }
}

/// The resolved actor plus request origin passed into every mutating operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub actor: Actor,
    pub origin: RequestOrigin,
}

impl RequestContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            origin: RequestOrigin::default(),
        }
    }

    pub fn with_origin(mut self, origin: RequestOrigin) -> Self {
        self.origin = origin;
        self
    }
}

/// Booking request accepted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub client: ClientId,
    #[serde(default)]
    pub client_name: Option<String>,
    pub staff: StaffId,
    pub service: ServiceId,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Overrides the service's list price when present.
    #[serde(default)]
    pub final_price: Option<Decimal>,
}

/// Field changes for an existing appointment; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentChanges {
    #[serde(default)]
    pub client: Option<ClientId>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub staff: Option<StaffId>,
    #[serde(default)]
    pub service: Option<ServiceId>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub final_price: Option<Decimal>,
}
