pub mod settings;

use chrono::{FixedOffset, Offset, Utc};
use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub use settings::{
    CompanySettings, InMemorySettingsSource, JsonFileSettingsSource, SettingsError,
    SettingsRegistry, SettingsSource,
};

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub scheduling: SchedulingConfig,
    pub settings_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let settings_path = env::var("APP_SETTINGS_PATH").ok().map(PathBuf::from);

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            scheduling: SchedulingConfig::from_env()?,
            settings_path,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Business rules the scheduling engine is parameterised with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingConfig {
    /// First hour (inclusive) a booking may start at.
    pub opening_hour: u32,
    /// Hour (exclusive) after which no booking may start.
    pub closing_hour: u32,
    /// Offset in which business hours and weekdays are evaluated.
    pub utc_offset: FixedOffset,
    pub allow_cancel_in_progress: bool,
    pub storage_timeout: Duration,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            opening_hour: 8,
            closing_hour: 18,
            utc_offset: Utc.fix(),
            allow_cancel_in_progress: false,
            storage_timeout: Duration::from_millis(2000),
        }
    }
}

impl SchedulingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let opening_hour = parse_hour("APP_OPENING_HOUR", defaults.opening_hour)?;
        let closing_hour = parse_hour("APP_CLOSING_HOUR", defaults.closing_hour)?;
        if opening_hour >= closing_hour {
            return Err(ConfigError::InvalidHour {
                key: "APP_CLOSING_HOUR",
            });
        }

        let utc_offset = match env::var("APP_UTC_OFFSET") {
            Ok(raw) => parse_utc_offset(&raw).ok_or(ConfigError::InvalidOffset(raw))?,
            Err(_) => defaults.utc_offset,
        };

        let allow_cancel_in_progress = match env::var("APP_CANCEL_IN_PROGRESS") {
            Ok(raw) => parse_flag(&raw).ok_or(ConfigError::InvalidFlag {
                key: "APP_CANCEL_IN_PROGRESS",
            })?,
            Err(_) => defaults.allow_cancel_in_progress,
        };

        let storage_timeout = match env::var("APP_STORAGE_TIMEOUT_MS") {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|millis| *millis > 0)
                .map(Duration::from_millis)
                .ok_or(ConfigError::InvalidTimeout)?,
            Err(_) => defaults.storage_timeout,
        };

        Ok(Self {
            opening_hour,
            closing_hour,
            utc_offset,
            allow_cancel_in_progress,
            storage_timeout,
        })
    }
}

fn parse_hour(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|hour| *hour <= 24)
            .ok_or(ConfigError::InvalidHour { key }),
        Err(_) => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses offsets written as `+HH:MM`, `-HH:MM` or `Z`.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Some(Utc.fix());
    }

    let (sign, rest) = if let Some(rest) = raw.strip_prefix('+') {
        (1, rest)
    } else {
        (-1, raw.strip_prefix('-')?)
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes >= 60 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidHour { key: &'static str },
    InvalidOffset(String),
    InvalidFlag { key: &'static str },
    InvalidTimeout,
    Settings(SettingsError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidHour { key } => {
                write!(f, "{key} must be an hour between 0 and 24 and opening must precede closing")
            }
            ConfigError::InvalidOffset(raw) => {
                write!(f, "APP_UTC_OFFSET '{raw}' must look like +HH:MM or -HH:MM")
            }
            ConfigError::InvalidFlag { key } => write!(f, "{key} must be true or false"),
            ConfigError::InvalidTimeout => {
                write!(f, "APP_STORAGE_TIMEOUT_MS must be a positive number of milliseconds")
            }
            ConfigError::Settings(err) => write!(f, "company settings: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::Settings(err) => Some(err),
            ConfigError::InvalidPort
            | ConfigError::InvalidHour { .. }
            | ConfigError::InvalidOffset(_)
            | ConfigError::InvalidFlag { .. }
            | ConfigError::InvalidTimeout => None,
        }
    }
}

impl From<SettingsError> for ConfigError {
    fn from(value: SettingsError) -> Self {
        Self::Settings(value)
    }
}
