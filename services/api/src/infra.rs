use agenda::config::{
    AppConfig, InMemorySettingsSource, JsonFileSettingsSource, SettingsRegistry, SettingsSource,
};
use agenda::scheduling::{
    ActorId, DirectoryError, InMemoryDirectory, Service, ServiceId, Staff, StaffId,
};
use chrono::{Datelike, NaiveDate};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
    pub(crate) settings: &'static SettingsRegistry,
}

/// Catalogue the binary starts with until an external directory is wired in.
pub(crate) fn seeded_directory() -> Result<InMemoryDirectory, DirectoryError> {
    let directory = InMemoryDirectory::default();

    for (id, name, code, hired) in [
        ("staff-ana", "Ana Souza", "FUNC0001", (2023, 2, 1)),
        ("staff-bruno", "Bruno Lima", "FUNC0002", (2024, 8, 15)),
    ] {
        let (year, month, day) = hired;
        directory.put_staff(Staff {
            id: StaffId(id.to_string()),
            person: ActorId(format!("person-{id}")),
            display_name: name.to_string(),
            employee_code: code.to_string(),
            hired_on: NaiveDate::from_ymd_opt(year, month, day)
                .ok_or_else(|| DirectoryError::Unavailable(format!("bad hire date for {id}")))?,
            terminated_on: None,
            active: true,
        })?;
    }

    for (id, name, cents, minutes) in [
        ("consulta", "Consulta", 10_000, 60),
        ("limpeza", "Limpeza", 15_000, 90),
        ("retorno", "Retorno", 5_000, 30),
    ] {
        let service = Service::new(ServiceId(id.to_string()), name, Decimal::new(cents, 2), minutes)
            .map_err(|err| DirectoryError::Unavailable(err.to_string()))?;
        directory.put_service(service)?;
    }

    Ok(directory)
}

/// JSON file when `APP_SETTINGS_PATH` is set, otherwise process memory.
pub(crate) fn settings_source(config: &AppConfig) -> Box<dyn SettingsSource> {
    match &config.settings_path {
        Some(path) => Box::new(JsonFileSettingsSource::new(path)),
        None => Box::new(InMemorySettingsSource::default()),
    }
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

/// The Monday after `today`; a Monday maps to the following week.
pub(crate) fn next_monday(today: NaiveDate) -> NaiveDate {
    let ahead = 7 - i64::from(today.weekday().num_days_from_monday());
    today + chrono::Duration::days(ahead)
}
