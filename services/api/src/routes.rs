use crate::infra::AppState;
use agenda::config::CompanySettings;
use agenda::error::AppError;
use agenda::scheduling::{
    request_context, scheduling_router, AuditAction, AuditRecord, AuditTrail, DirectoryStore,
    SchedulingEngine, SchedulingError, SchedulingStore,
};
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Partial update of the company settings; absent fields stay as they are.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct SettingsUpdate {
    #[serde(default)]
    pub(crate) company_name: Option<String>,
    #[serde(default)]
    pub(crate) address: Option<String>,
    #[serde(default)]
    pub(crate) phone: Option<String>,
    #[serde(default)]
    pub(crate) email: Option<String>,
    #[serde(default)]
    pub(crate) website: Option<String>,
    #[serde(default)]
    pub(crate) whatsapp_number: Option<String>,
    #[serde(default)]
    pub(crate) whatsapp_enabled: Option<bool>,
    #[serde(default)]
    pub(crate) welcome_message: Option<String>,
    #[serde(default)]
    pub(crate) business_hours: Option<String>,
}

impl SettingsUpdate {
    fn apply(self, settings: &mut CompanySettings) {
        if let Some(name) = self.company_name {
            settings.company_name = name.trim().to_string();
        }
        if let Some(enabled) = self.whatsapp_enabled {
            settings.whatsapp_enabled = enabled;
        }

        // blank text clears the field
        for (value, slot) in [
            (self.address, &mut settings.address),
            (self.phone, &mut settings.phone),
            (self.email, &mut settings.email),
            (self.website, &mut settings.website),
            (self.whatsapp_number, &mut settings.whatsapp_number),
            (self.welcome_message, &mut settings.welcome_message),
            (self.business_hours, &mut settings.business_hours),
        ] {
            if let Some(value) = value {
                *slot = Some(value.trim().to_string()).filter(|value| !value.is_empty());
            }
        }
    }
}

/// Names of the fields that differ between two records, `updated_at` aside.
fn changed_fields(before: &CompanySettings, after: &CompanySettings) -> Vec<&'static str> {
    [
        ("company_name", before.company_name != after.company_name),
        ("address", before.address != after.address),
        ("phone", before.phone != after.phone),
        ("email", before.email != after.email),
        ("website", before.website != after.website),
        ("whatsapp_number", before.whatsapp_number != after.whatsapp_number),
        ("whatsapp_enabled", before.whatsapp_enabled != after.whatsapp_enabled),
        ("welcome_message", before.welcome_message != after.welcome_message),
        ("business_hours", before.business_hours != after.business_hours),
    ]
    .into_iter()
    .filter_map(|(name, differs)| differs.then_some(name))
    .collect()
}

pub(crate) fn with_service_routes<S, D>(engine: Arc<SchedulingEngine<S, D>>) -> Router
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    let trail = Arc::new(engine.audit_trail());

    scheduling_router(Arc::clone(&engine))
        .route("/health", get(healthcheck))
        .route("/ready", get(readiness_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .route(
            "/api/v1/settings",
            get(settings_endpoint).put(update_settings_endpoint::<S>),
        )
        .route("/api/v1/booking-options", get(booking_options_endpoint::<S, D>))
        .layer(Extension(trail))
        .layer(Extension(engine))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub(crate) async fn settings_endpoint(
    Extension(state): Extension<AppState>,
) -> Result<Json<CompanySettings>, AppError> {
    let current = state.settings.current()?;
    Ok(Json((*current).clone()))
}

/// Master-only. The change is audited as a `settings` update; if the audit entry cannot be
/// written the previous record is put back and the caller gets a 500.
pub(crate) async fn update_settings_endpoint<S>(
    Extension(state): Extension<AppState>,
    Extension(trail): Extension<Arc<AuditTrail<S>>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(update): Json<SettingsUpdate>,
) -> Response
where
    S: SchedulingStore + 'static,
{
    let ctx = match request_context(&headers, peer) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    if !ctx.actor.is_master() {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "only a master account may change company settings" })),
        )
            .into_response();
    }

    let mut changed = Vec::new();
    let outcome = state.settings.update_confirmed(
        |settings| update.apply(settings),
        |before, after| {
            changed = changed_fields(before, after);
            let record = AuditRecord::new(AuditAction::Update, "settings")
                .by(&ctx.actor)
                .target("company", after.company_name.clone())
                .from_origin(&ctx.origin)
                .detail("fields", json!(changed));
            trail
                .record(record)
                .map(|_| ())
                .map_err(|err| AppError::from(SchedulingError::from(err)))
        },
    );
    let updated = match outcome {
        Ok(updated) => updated,
        Err(err) => return err.into_response(),
    };

    info!(actor = %ctx.actor.id, fields = ?changed, "company settings updated");
    Json((*updated).clone()).into_response()
}

pub(crate) async fn booking_options_endpoint<S, D>(
    Extension(engine): Extension<Arc<SchedulingEngine<S, D>>>,
) -> Response
where
    S: SchedulingStore + 'static,
    D: DirectoryStore + 'static,
{
    match engine.booking_options() {
        Ok(options) => Json(options).into_response(),
        Err(err) => AppError::from(err).into_response(),
    }
}
