use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use super::common::*;
use crate::scheduling::router::{
    error_response, scheduling_router, ACTOR_CAPABILITIES_HEADER, ACTOR_ID_HEADER,
    ACTOR_ROLE_HEADER,
};
use crate::scheduling::engine::SchedulingError;
use crate::scheduling::domain::AppointmentId;

struct As<'a> {
    id: &'a str,
    role: &'a str,
    capabilities: &'a str,
}

const MASTER: As<'static> = As {
    id: "admin",
    role: "master",
    capabilities: "",
};

const CLERK: As<'static> = As {
    id: "clerk",
    role: "restricted",
    capabilities: "schedule_appointments,view_appointments",
};

const VIEWER: As<'static> = As {
    id: "viewer",
    role: "restricted",
    capabilities: "view_appointments",
};

fn request(method: Method, uri: &str, actor: Option<&As<'_>>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(actor) = actor {
        builder = builder
            .header(ACTOR_ID_HEADER, actor.id)
            .header(ACTOR_ROLE_HEADER, actor.role)
            .header(ACTOR_CAPABILITIES_HEADER, actor.capabilities)
            .header("x-forwarded-for", "203.0.113.9")
            .header(header::USER_AGENT, "agenda-tests");
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).expect("json")))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

fn booking_body(client: &str, start: &str) -> Value {
    json!({
        "client": client,
        "client_name": format!("Client {client}"),
        "staff": "staff-x",
        "service": "consulta",
        "start": start,
    })
}

async fn book(router: &axum::Router, actor: &As<'_>, client: &str, start: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(request(
            Method::POST,
            "/api/v1/appointments",
            Some(actor),
            Some(booking_body(client, start)),
        ))
        .await
        .expect("response");
    let status = response.status();
    (status, read_json_body(response).await)
}

#[tokio::test]
async fn booking_requires_an_actor() {
    let router = scheduling_router(harness().engine);

    let response = router
        .oneshot(request(
            Method::POST,
            "/api/v1/appointments",
            None,
            Some(booking_body("a", "2025-03-10T09:00:00Z")),
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn booking_requires_the_schedule_capability() {
    let router = scheduling_router(harness().engine);

    let (status, body) = book(&router, &VIEWER, "a", "2025-03-10T09:00:00Z").await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["capability"], "schedule_appointments");
}

#[tokio::test]
async fn clients_may_book_for_themselves_only() {
    let router = scheduling_router(harness().engine);
    let client = As {
        id: "client-a",
        role: "client",
        capabilities: "",
    };

    let (status, _) = book(&router, &client, "client-a", "2025-03-10T09:00:00Z").await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = book(&router, &client, "client-b", "2025-03-10T11:00:00Z").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn overlapping_booking_returns_conflict_with_existing_id() {
    let harness = harness();
    let store = harness.store.clone();
    let router = scheduling_router(harness.engine);

    let (status, first) = book(&router, &CLERK, "a", "2025-03-10T09:00:00Z").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["final_price"], "100.00");
    assert_eq!(first["status"], "scheduled");

    let (status, body) = book(&router, &CLERK, "b", "2025-03-10T09:30:00Z").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "scheduling_conflict");
    assert_eq!(body["conflicting_appointment"], first["id"]);

    let (status, _) = book(&router, &CLERK, "b", "2025-03-10T10:00:00Z").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(committed(&store).len(), 2);
}

#[tokio::test]
async fn calendar_violations_are_unprocessable() {
    let router = scheduling_router(harness().engine);

    let (status, body) = book(&router, &MASTER, "a", "2025-03-15T09:00:00Z").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "non_business_day");
    assert_eq!(body["retryable"], false);

    let (status, body) = book(&router, &MASTER, "a", "2025-03-10T07:59:00Z").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "outside_business_hours");
}

#[tokio::test]
async fn booking_records_request_origin() {
    let harness = harness();
    let engine = harness.engine.clone();
    let router = scheduling_router(harness.engine);

    let (_, created) = book(&router, &CLERK, "a", "2025-03-10T09:00:00Z").await;
    let id = AppointmentId(created["id"].as_str().expect("id").to_string());

    let history = engine.history(&id).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0].source_address,
        Some("203.0.113.9".parse().expect("ip"))
    );
    assert_eq!(history[0].client_agent.as_deref(), Some("agenda-tests"));
}

#[tokio::test]
async fn lifecycle_endpoints_drive_the_state_machine() {
    let harness = harness();
    let router = scheduling_router(harness.engine.clone());

    let (_, created) = book(&router, &CLERK, "a", "2025-03-10T09:00:00Z").await;
    let id = created["id"].as_str().expect("id").to_string();

    let response = router
        .clone()
        .oneshot(request(
            Method::POST,
            &format!("/api/v1/appointments/{id}/status"),
            Some(&CLERK),
            Some(json!({ "status": "completed" })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = read_json_body(response).await;
    assert_eq!(body["kind"], "illegal_transition");

    let response = router
        .clone()
        .oneshot(request(
            Method::POST,
            &format!("/api/v1/appointments/{id}/cancel"),
            Some(&CLERK),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json_body(response).await;
    assert_eq!(body["status"], "cancelled");

    let response = router
        .clone()
        .oneshot(request(
            Method::GET,
            &format!("/api/v1/appointments/{id}/history"),
            Some(&VIEWER),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let entries = read_json_body(response).await;
    let entries = entries.as_array().expect("array");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1]["detail"]["action"], "status_change");
}

#[tokio::test]
async fn edit_endpoint_applies_changes() {
    let router = scheduling_router(harness().engine);
    let (_, created) = book(&router, &CLERK, "a", "2025-03-10T09:00:00Z").await;
    let id = created["id"].as_str().expect("id").to_string();

    let response = router
        .clone()
        .oneshot(request(
            Method::PATCH,
            &format!("/api/v1/appointments/{id}"),
            Some(&CLERK),
            Some(json!({ "start": "2025-03-10T14:00:00Z", "final_price": "90.00" })),
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json_body(response).await;
    assert_eq!(body["scheduled_start"], "2025-03-10T14:00:00Z");
    assert_eq!(body["final_price"], "90.00");
}

#[tokio::test]
async fn only_masters_delete() {
    let router = scheduling_router(harness().engine);
    let (_, created) = book(&router, &CLERK, "a", "2025-03-10T09:00:00Z").await;
    let id = created["id"].as_str().expect("id").to_string();
    let uri = format!("/api/v1/appointments/{id}");

    let response = router
        .clone()
        .oneshot(request(Method::DELETE, &uri, Some(&CLERK), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = router
        .clone()
        .oneshot(request(Method::DELETE, &uri, Some(&MASTER), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(request(Method::GET, &uri, Some(&MASTER), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn listing_filters_by_status_and_scopes_clients() {
    let router = scheduling_router(harness().engine);
    let client = As {
        id: "client-a",
        role: "client",
        capabilities: "",
    };
    book(&router, &client, "client-a", "2025-03-10T09:00:00Z").await;
    book(&router, &CLERK, "client-b", "2025-03-10T11:00:00Z").await;

    let response = router
        .clone()
        .oneshot(request(
            Method::GET,
            "/api/v1/appointments?status=scheduled",
            Some(&VIEWER),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json_body(response).await;
    assert_eq!(body.as_array().expect("array").len(), 2);

    let response = router
        .clone()
        .oneshot(request(Method::GET, "/api/v1/appointments", Some(&client), None))
        .await
        .expect("response");
    let body = read_json_body(response).await;
    let listed = body.as_array().expect("array");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["client"], "client-a");

    let response = router
        .clone()
        .oneshot(request(
            Method::GET,
            "/api/v1/appointments?status=pending",
            Some(&VIEWER),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn identity_provider_events_are_audited() {
    let harness = harness();
    let trail = harness.engine.audit_trail();
    let router = scheduling_router(harness.engine);

    let response = router
        .clone()
        .oneshot(request(
            Method::POST,
            "/api/v1/audit/events",
            Some(&CLERK),
            Some(json!({ "action": "login", "entity_type": "user", "entity_id": "clerk" })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = router
        .clone()
        .oneshot(request(
            Method::POST,
            "/api/v1/audit/events",
            Some(&CLERK),
            Some(json!({ "action": "create", "entity_type": "appointment" })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let logins = trail
        .history(&crate::scheduling::audit::AuditQuery::for_entity("user", "clerk"))
        .expect("history");
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].actor.as_ref().map(|a| a.0.as_str()), Some("clerk"));
}

#[tokio::test]
async fn storage_and_audit_failures_map_to_server_statuses() {
    let response = error_response(SchedulingError::StorageTimeout(
        std::time::Duration::from_secs(2),
    ));
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(read_json_body(response).await["retryable"], true);

    let router = scheduling_router(Arc::new(engine_over(Arc::new(FailingAuditStore::new()))));
    let (status, body) = book(&router, &MASTER, "a", "2025-03-10T09:00:00Z").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "audit_write_failed");
}
