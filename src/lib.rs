use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub mod agenda;
pub mod auth;
pub mod calendar;
pub mod output;
pub mod pipeline;
pub mod scheduler;
pub mod signals;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by all fallible operations within this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("calendar client error: {0}")]
    Calendar(#[from] calendar::google::ClientError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("client identity file contains neither an `installed` nor a `web` section")]
    MissingClientIdentity,
    #[error("invalid authorization endpoint: {0}")]
    AuthorizationEndpoint(#[from] url::ParseError),
    #[error("token exchange failed: {0}")]
    Exchange(#[source] auth::google::TokenRequestError),
    #[error("token refresh failed: {0}")]
    Refresh(#[source] auth::google::TokenRequestError),
    #[error("provider did not issue a refresh token")]
    MissingRefreshToken,
    #[error("an authorization is already in progress (callback on {0})")]
    AuthorizationPending(SocketAddr),
    #[error("callback port {0} is busy, another process is listening on it")]
    CallbackPortBusy(SocketAddr),
    #[error("callback listener stopped before an authorization code arrived")]
    ListenerClosed,
    #[error("invalid schedule: {0}")]
    Schedule(String),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
    #[error("local day {0} has no start time in this timezone")]
    InvalidDay(chrono::NaiveDate),
}

/// Authorization configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AuthConfig {
    /// Where the authorized user credential is persisted.
    pub token_path: PathBuf,
    /// The app-provisioned client identity file (`installed` or `web` key).
    pub credentials_path: PathBuf,
    /// Address the callback listener binds to. Also used in the redirect URI.
    pub listen_addr: SocketAddr,
    /// Path component of the redirect URI.
    pub redirect_path: String,
    /// OAuth scopes requested during the grant.
    pub scopes: Vec<String>,
}

impl AuthConfig {
    /// The redirect URI registered with the provider.
    pub fn redirect_uri(&self) -> String {
        format!("http://{}{}", self.listen_addr, self.redirect_path)
    }
}

/// Calendar configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct CalendarConfig {
    /// The calendar that is queried, `primary` for the user's main calendar.
    pub calendar_id: String,
    /// Timezone the agenda is rendered in.
    pub timezone: chrono_tz::Tz,
    /// Timeout applied to every calendar API request.
    pub request_timeout_secs: u64,
}

/// Recurrence of the scheduled agenda job.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ScheduleConfig {
    pub minute: u32,
    pub hour: u32,
    /// Cron day-of-week field, e.g. `*` or `Mon-Fri`.
    pub days_of_week: String,
    /// The trigger fires in this timezone regardless of the host's local timezone.
    pub timezone: chrono_tz::Tz,
}

/// Thermal printer configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct PrinterConfig {
    pub mode: output::printer::PrinterMode,
    /// Serial device the printer is attached to.
    pub device_path: PathBuf,
    pub baud_rate: u32,
    /// Program used to configure the serial line speed.
    pub stty_program: PathBuf,
}

/// Global application configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AppConfig {
    /// Authorization configuration section.
    pub auth: AuthConfig,
    /// Calendar configuration section.
    pub calendar: CalendarConfig,
    /// Schedule configuration section.
    pub schedule: ScheduleConfig,
    /// Printer configuration section.
    pub printer: PrinterConfig,
}

impl AppConfig {
    /// Loads the application configuration from files in the `config/` directory and environment
    /// variables.
    pub fn load() -> Result<AppConfig> {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".into());

        log::info!("loading configuration using {} environment", app_env);

        let config = Config::builder()
            // Configuration defaults from `config/default.toml`.
            .add_source(File::with_name("config/default"))
            // Optional environment specific config overrides, e.g. `config/production.toml`.
            .add_source(File::with_name(&format!("config/{}", app_env)).required(false))
            // Optional local config overrides from `config/local.toml` (on .gitignore).
            .add_source(File::with_name("config/local").required(false))
            // Config from environment variables, e.g. `PRINTER__MODE=emulated`.
            .add_source(Environment::default().separator("__"))
            // Config from environment variables prefixed with `AGENDA_`.
            .add_source(
                Environment::with_prefix("AGENDA")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        log::debug!("loaded configuration: {:?}", config);

        Ok(config)
    }
}
