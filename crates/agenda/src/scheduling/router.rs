use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::audit::{AuditAction, AuditRecord};
use super::directory::DirectoryStore;
use super::domain::{
    Actor, AppointmentChanges, AppointmentId, AppointmentStatus, BookingRequest, Capability,
    ClientId, RequestContext, RequestOrigin, Role, ServiceId, StaffId,
};
use super::engine::{ErrorClass, SchedulingEngine, SchedulingError};
use super::repository::{AppointmentFilter, SchedulingStore};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_NAME_HEADER: &str = "x-actor-name";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
pub const ACTOR_CAPABILITIES_HEADER: &str = "x-actor-capabilities";

/// Router builder exposing the scheduling engine and audit trail over HTTP.
///
/// Identity is resolved by the proxy in front of this service and forwarded in `x-actor-*`
/// headers; requests without them are rejected.
pub fn scheduling_router<S, D>(engine: Arc<SchedulingEngine<S, D>>) -> Router
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    Router::new()
        .route(
            "/api/v1/appointments",
            post(propose_handler::<S, D>).get(list_handler::<S, D>),
        )
        .route(
            "/api/v1/appointments/:appointment_id",
            get(get_handler::<S, D>)
                .patch(edit_handler::<S, D>)
                .delete(delete_handler::<S, D>),
        )
        .route(
            "/api/v1/appointments/:appointment_id/cancel",
            post(cancel_handler::<S, D>),
        )
        .route(
            "/api/v1/appointments/:appointment_id/status",
            post(status_handler::<S, D>),
        )
        .route(
            "/api/v1/appointments/:appointment_id/history",
            get(history_handler::<S, D>),
        )
        .route("/api/v1/audit/events", post(audit_event_handler::<S, D>))
        .with_state(engine)
}

type Engine<S, D> = Arc<SchedulingEngine<S, D>>;

pub(crate) async fn propose_handler<S, D>(
    State(engine): State<Engine<S, D>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    axum::Json(request): axum::Json<BookingRequest>,
) -> Response
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    let ctx = match request_context(&headers, peer) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    if !may_book_for(&ctx.actor, &request.client) {
        return forbidden(Capability::ScheduleAppointments);
    }

    match blocking(move || engine.propose(&ctx, request)).await {
        Ok(appointment) => (StatusCode::CREATED, axum::Json(appointment)).into_response(),
        Err(error) => error_response(error),
    }
}

/// Query string for appointment listings; `status` is a comma-separated list.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListParams {
    client: Option<String>,
    staff: Option<String>,
    service: Option<String>,
    status: Option<String>,
    from: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
}

impl ListParams {
    fn into_filter(self) -> Result<AppointmentFilter, String> {
        let statuses = match self.status.as_deref() {
            Some(raw) => raw
                .split(',')
                .filter(|label| !label.trim().is_empty())
                .map(|label| {
                    AppointmentStatus::from_label(label)
                        .ok_or_else(|| format!("unknown status `{}`", label.trim()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(AppointmentFilter {
            client: self.client.map(ClientId),
            staff: self.staff.map(StaffId),
            service: self.service.map(ServiceId),
            statuses,
            from: self.from,
            until: self.until,
        })
    }
}

pub(crate) async fn list_handler<S, D>(
    State(engine): State<Engine<S, D>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Response
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    let ctx = match request_context(&headers, peer) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    let mut filter = match params.into_filter() {
        Ok(filter) => filter,
        Err(message) => return unprocessable(message),
    };

    if !ctx.actor.can(Capability::ViewAppointments) {
        if ctx.actor.role != Role::Client {
            return forbidden(Capability::ViewAppointments);
        }
        // clients only ever see their own bookings
        filter.client = Some(own_client(&ctx.actor));
    }

    match blocking(move || engine.list(&filter)).await {
        Ok(appointments) => (StatusCode::OK, axum::Json(appointments)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn get_handler<S, D>(
    State(engine): State<Engine<S, D>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
) -> Response
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    let ctx = match request_context(&headers, peer) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    let id = AppointmentId(appointment_id);

    match blocking(move || engine.get(&id)).await {
        Ok(appointment)
            if ctx.actor.can(Capability::ViewAppointments)
                || appointment.client == own_client(&ctx.actor) =>
        {
            (StatusCode::OK, axum::Json(appointment)).into_response()
        }
        Ok(_) => forbidden(Capability::ViewAppointments),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn edit_handler<S, D>(
    State(engine): State<Engine<S, D>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
    axum::Json(changes): axum::Json<AppointmentChanges>,
) -> Response
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    let ctx = match request_context(&headers, peer) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    if !ctx.actor.can(Capability::ScheduleAppointments) {
        return forbidden(Capability::ScheduleAppointments);
    }
    let id = AppointmentId(appointment_id);

    match blocking(move || engine.edit(&ctx, &id, changes)).await {
        Ok(appointment) => (StatusCode::OK, axum::Json(appointment)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn delete_handler<S, D>(
    State(engine): State<Engine<S, D>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
) -> Response
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    let ctx = match request_context(&headers, peer) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    if !ctx.actor.is_master() {
        let payload = json!({
            "error": "only master users may delete appointments",
        });
        return (StatusCode::FORBIDDEN, axum::Json(payload)).into_response();
    }
    let id = AppointmentId(appointment_id);

    match blocking(move || engine.delete(&ctx, &id)).await {
        Ok(appointment) => (StatusCode::OK, axum::Json(appointment)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn cancel_handler<S, D>(
    State(engine): State<Engine<S, D>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
) -> Response
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    let ctx = match request_context(&headers, peer) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    let id = AppointmentId(appointment_id);

    let outcome = blocking(move || {
        let appointment = engine.get(&id)?;
        if !may_book_for(&ctx.actor, &appointment.client) {
            return Ok(None);
        }
        engine.cancel(&ctx, &id).map(Some)
    })
    .await;

    match outcome {
        Ok(Some(appointment)) => (StatusCode::OK, axum::Json(appointment)).into_response(),
        Ok(None) => forbidden(Capability::ScheduleAppointments),
        Err(error) => error_response(error),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusChange {
    status: AppointmentStatus,
}

pub(crate) async fn status_handler<S, D>(
    State(engine): State<Engine<S, D>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
    axum::Json(change): axum::Json<StatusChange>,
) -> Response
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    let ctx = match request_context(&headers, peer) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    if !ctx.actor.can(Capability::ScheduleAppointments) {
        return forbidden(Capability::ScheduleAppointments);
    }
    let id = AppointmentId(appointment_id);

    match blocking(move || engine.transition(&ctx, &id, change.status)).await {
        Ok(appointment) => (StatusCode::OK, axum::Json(appointment)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn history_handler<S, D>(
    State(engine): State<Engine<S, D>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(appointment_id): Path<String>,
) -> Response
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    let ctx = match request_context(&headers, peer) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    if !ctx.actor.can(Capability::ViewAppointments) {
        return forbidden(Capability::ViewAppointments);
    }
    let id = AppointmentId(appointment_id);

    match blocking(move || engine.history(&id)).await {
        Ok(entries) => (StatusCode::OK, axum::Json(entries)).into_response(),
        Err(error) => error_response(error),
    }
}

/// Event forwarded by the identity provider or admin screens.
#[derive(Debug, Deserialize)]
pub(crate) struct AuditEvent {
    action: AuditAction,
    entity_type: String,
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    snapshot: Option<String>,
    #[serde(default)]
    detail: BTreeMap<String, Value>,
}

pub(crate) async fn audit_event_handler<S, D>(
    State(engine): State<Engine<S, D>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    axum::Json(event): axum::Json<AuditEvent>,
) -> Response
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    let ctx = match request_context(&headers, peer) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    if event.entity_type.trim().is_empty() {
        return unprocessable("entity_type is required".to_string());
    }
    if !matches!(
        event.action,
        AuditAction::Login | AuditAction::Logout | AuditAction::View
    ) {
        return unprocessable(format!(
            "`{}` entries are written by the operation that performs the change",
            event.action
        ));
    }

    let mut record = AuditRecord::new(event.action, event.entity_type)
        .by(&ctx.actor)
        .from_origin(&ctx.origin);
    if let Some(entity_id) = event.entity_id {
        record = record.target(entity_id, event.snapshot.unwrap_or_default());
    } else if let Some(snapshot) = event.snapshot {
        record.snapshot = snapshot;
    }
    record.detail = event.detail;

    let trail = engine.audit_trail();
    match blocking(move || trail.record(record).map_err(SchedulingError::from)).await {
        Ok(entry) => (StatusCode::CREATED, axum::Json(entry)).into_response(),
        Err(error) => error_response(error),
    }
}

/// Runs an engine call off the async workers; store calls may wait on staff locks.
async fn blocking<T, F>(call: F) -> Result<T, SchedulingError>
where
    F: FnOnce() -> Result<T, SchedulingError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|error| SchedulingError::StorageUnavailable(error.to_string()))?
}

/// Resolves the forwarded identity and request origin.
pub fn request_context(
    headers: &HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<RequestContext, Response> {
    let header = |name: &'static str| header_value(headers, name);

    let id = header(ACTOR_ID_HEADER).ok_or_else(|| unauthorized("missing actor identity"))?;
    let role = header(ACTOR_ROLE_HEADER)
        .and_then(Role::from_label)
        .ok_or_else(|| unauthorized("missing or unknown actor role"))?;
    let name = header(ACTOR_NAME_HEADER).unwrap_or(id);

    let mut actor = Actor::new(id, name, role);
    if let Some(raw) = header(ACTOR_CAPABILITIES_HEADER) {
        for label in raw.split(',').filter(|label| !label.trim().is_empty()) {
            if let Some(capability) = Capability::from_label(label) {
                actor.capabilities.insert(capability);
            } else {
                tracing::warn!(capability = label.trim(), "ignoring unknown capability");
            }
        }
    }

    let origin = RequestOrigin::from_forwarded(
        header("x-forwarded-for"),
        peer.map(|ConnectInfo(addr)| addr.ip()),
        header("user-agent"),
    );
    Ok(RequestContext::new(actor).with_origin(origin))
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Client accounts book under their own id.
fn own_client(actor: &Actor) -> ClientId {
    ClientId(actor.id.0.clone())
}

fn may_book_for(actor: &Actor, client: &ClientId) -> bool {
    actor.can(Capability::ScheduleAppointments)
        || (actor.role == Role::Client && *client == own_client(actor))
}

pub(crate) fn error_response(error: SchedulingError) -> Response {
    let status = match (&error, error.class()) {
        (SchedulingError::AppointmentNotFound(_), _) => StatusCode::NOT_FOUND,
        (SchedulingError::SchedulingConflict { .. }, _) => StatusCode::CONFLICT,
        (_, ErrorClass::Validation) => StatusCode::UNPROCESSABLE_ENTITY,
        (_, ErrorClass::StateMachine) => StatusCode::CONFLICT,
        (_, ErrorClass::Transient) => StatusCode::SERVICE_UNAVAILABLE,
        (_, ErrorClass::Fatal) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut payload = json!({
        "error": error.to_string(),
        "kind": error.kind(),
        "retryable": error.is_retryable(),
    });
    if let SchedulingError::SchedulingConflict { conflicting } = &error {
        payload["conflicting_appointment"] = json!(conflicting);
    }

    (status, axum::Json(payload)).into_response()
}

fn unauthorized(message: &str) -> Response {
    let payload = json!({
        "error": message,
    });
    (StatusCode::UNAUTHORIZED, axum::Json(payload)).into_response()
}

fn forbidden(capability: Capability) -> Response {
    let payload = json!({
        "error": "missing capability",
        "capability": capability,
    });
    (StatusCode::FORBIDDEN, axum::Json(payload)).into_response()
}

fn unprocessable(message: String) -> Response {
    let payload = json!({
        "error": message,
    });
    (StatusCode::UNPROCESSABLE_ENTITY, axum::Json(payload)).into_response()
}
