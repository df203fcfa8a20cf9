use crate::cli::ServeArgs;
use crate::infra::{seeded_directory, settings_source, AppState};
use crate::routes::with_service_routes;
use agenda::config::{settings, AppConfig, SettingsRegistry};
use agenda::error::AppError;
use agenda::scheduling::{
    InMemoryStore, SchedulingEngine, SchedulingError, SchedulingPolicy, SystemClock,
};
use agenda::telemetry;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }
    if let Some(path) = args.settings.take() {
        config.settings_path = Some(path);
    }

    telemetry::init(&config.telemetry, config.environment)?;

    let registry = settings::install(SettingsRegistry::load(settings_source(&config))?)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
        settings: registry,
    };

    let clock = Arc::new(SystemClock);
    let store = Arc::new(
        InMemoryStore::with_clock(clock.clone()).lock_timeout(config.scheduling.storage_timeout),
    );
    let directory = Arc::new(seeded_directory().map_err(SchedulingError::from)?);
    let policy = SchedulingPolicy::from_config(&config.scheduling);
    let hours = policy.describe();
    let engine = Arc::new(SchedulingEngine::new(store, directory, clock, policy));

    let app = with_service_routes(engine)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, %hours, "appointment scheduling service ready");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
