use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn parse(value: &str) -> Self {
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
    pub processes: ProcessConfig,
    pub dispatcher: DispatcherConfig,
    pub gateway: GatewayConfig,
    pub reconciliation: ReconciliationConfig,
    pub notifications: NotificationConfig,
    pub auth: AuthConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::parse(&string_var("APP_ENV", "development"));

        let server = ServerConfig {
            host: string_var("APP_HOST", "127.0.0.1"),
            port: parsed_var("APP_PORT", 3000u16)?,
        };

        let telemetry = TelemetryConfig {
            log_level: string_var("APP_LOG_LEVEL", "info"),
            format: LogFormat::parse(&string_var("APP_LOG_FORMAT", "compact")),
        };

        let processes = ProcessConfig {
            running_threshold: Duration::from_secs(
                parsed_var::<u64>("RUNNING_PROCESS_TIME_THRESHOLD_IN_MINUTES", 5)? * 60,
            ),
            sweep_interval: Duration::from_secs(parsed_var("SWEEP_INTERVAL_SECS", 300u64)?),
        };

        let dispatcher = DispatcherConfig {
            countdown: Duration::from_secs(
                parsed_var("TASK_COUNTDOWN_SECS", MIN_COUNTDOWN_SECS)?.max(MIN_COUNTDOWN_SECS),
            ),
            max_attempts: parsed_var("TASK_MAX_ATTEMPTS", 3u32)?.max(1),
            retry_backoff: Duration::from_secs(parsed_var("TASK_RETRY_BACKOFF_SECS", 5u64)?),
            worker_concurrency: parsed_var("WORKER_CONCURRENCY", 2usize)?.max(1),
        };

        let gateway = GatewayConfig {
            base_url: optional_var("GATEWAY_BASE_URL"),
            account_code: optional_var("GATEWAY_ACCOUNT_CODE"),
            account_token: optional_var("GATEWAY_ACCOUNT_TOKEN"),
            timeout: Duration::from_secs(parsed_var("GATEWAY_TIMEOUT_SECS", 30u64)?),
        };

        let reconciliation = ReconciliationConfig {
            window: chrono::Duration::hours(parsed_var("RECON_WINDOW_HOURS", 24i64)?),
            interval: Duration::from_secs(parsed_var("RECON_INTERVAL_SECS", 3600u64)?),
        };

        let notifications = NotificationConfig {
            interval: Duration::from_secs(parsed_var("NOTIFICATION_INTERVAL_SECS", 60u64)?),
            max_attempts: parsed_var("NOTIFICATION_MAX_ATTEMPTS", 5u32)?.max(1),
            backoff_base: chrono::Duration::seconds(parsed_var("NOTIFICATION_BACKOFF_SECS", 30i64)?),
            batch_size: parsed_var("NOTIFICATION_BATCH_SIZE", 100usize)?,
            claim_lease: chrono::Duration::seconds(parsed_var("NOTIFICATION_CLAIM_LEASE_SECS", 300i64)?),
        };

        let auth = AuthConfig {
            access_token_ttl: chrono::Duration::seconds(parsed_var(
                "ACCESS_TOKEN_TTL_SECS",
                3600i64,
            )?),
            introspection_url: optional_var("IDP_INTROSPECTION_URL"),
            client_id: optional_var("IDP_CLIENT_ID"),
            client_secret: optional_var("IDP_CLIENT_SECRET"),
        };

        Ok(Self {
            environment,
            server,
            telemetry,
            processes,
            dispatcher,
            gateway,
            reconciliation,
            notifications,
            auth,
        })
    }
}

const MIN_COUNTDOWN_SECS: u64 = 3;

fn string_var(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parsed_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
            key,
            value: raw,
        }),
        Err(_) => Ok(default),
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Compact
        }
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Running processes not touched within this window are swept as failed.
    pub running_threshold: Duration,
    pub sweep_interval: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            running_threshold: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Delay before a freshly enqueued task becomes visible to workers.
    pub countdown: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub worker_concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            countdown: Duration::from_secs(MIN_COUNTDOWN_SECS),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            worker_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: Option<String>,
    pub account_code: Option<String>,
    pub account_token: Option<String>,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            account_code: None,
            account_token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// Transactions reconciled longer ago than this are queried again.
    pub window: chrono::Duration,
    pub interval: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            window: chrono::Duration::hours(24),
            interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub backoff_base: chrono::Duration,
    pub batch_size: usize,
    /// How long a claimed row may stay Queued before another drain takes it back.
    pub claim_lease: chrono::Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_attempts: 5,
            backoff_base: chrono::Duration::seconds(30),
            batch_size: 100,
            claim_lease: chrono::Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub access_token_ttl: chrono::Duration,
    pub introspection_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_token_ttl: chrono::Duration::hours(1),
            introspection_url: None,
            client_id: None,
            client_secret: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("APP_HOST must parse to an IPv4 or IPv6 address")]
    InvalidHost { source: std::net::AddrParseError },
}
