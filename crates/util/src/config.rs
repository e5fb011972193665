use std::{env, fmt, net::SocketAddr};

use super::server_bind_address;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Connection settings for the invoice e-mail provider. Absent in
/// environments where outgoing mail is disabled.
#[derive(Debug, Clone)]
pub struct MailerSettings {
    pub base_url: String,
    pub api_key: String,
    pub from: String,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    /// Minutes a stock reservation holds inventory for an unpaid order.
    pub reservation_ttl_minutes: i64,
    /// Cadence of the background reservation sweep, in seconds.
    pub sweep_interval_seconds: u64,
    /// How long past expiry an unconfirmed reservation is kept before the
    /// sweeper deletes it, in minutes.
    pub sweep_grace_minutes: i64,
    /// SHA-256 digest of the back-office bearer token. `None` disables the
    /// admin surface.
    pub admin_token_digest: Option<[u8; 32]>,
    pub mailer: Option<MailerSettings>,
}

const DEFAULT_DATABASE_URL: &str = "sqlite://cardstall.db";
const DEFAULT_RESERVATION_TTL_MINUTES: i64 = 30;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 300;
const DEFAULT_SWEEP_GRACE_MINUTES: i64 = 60;

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let reservation_ttl_minutes = positive_int(
            "RESERVATION_TTL_MINUTES",
            DEFAULT_RESERVATION_TTL_MINUTES,
        )?;
        let sweep_interval_seconds = positive_int(
            "SWEEP_INTERVAL_SECONDS",
            DEFAULT_SWEEP_INTERVAL_SECONDS as i64,
        )? as u64;
        let sweep_grace_minutes =
            positive_int("SWEEP_GRACE_MINUTES", DEFAULT_SWEEP_GRACE_MINUTES)?;

        let admin_token_digest = match env::var("ADMIN_TOKEN_SHA256") {
            Ok(value) => Some(decode_digest(&value)?),
            Err(_) => None,
        };

        let mailer = match env::var("MAILER_BASE_URL") {
            Ok(base_url) => Some(MailerSettings {
                base_url,
                api_key: require_env("MAILER_API_KEY")?,
                from: require_env("MAILER_FROM")?,
            }),
            Err(_) => None,
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            reservation_ttl_minutes,
            sweep_interval_seconds,
            sweep_grace_minutes,
            admin_token_digest,
            mailer,
        })
    }
}

fn positive_int(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(default);
    };
    match raw.parse::<i64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::InvalidInteger { name, value: raw }),
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVariable(name))
}

fn decode_digest(value: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(value)
        .map_err(|_| ConfigError::InvalidAdminDigest(value.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ConfigError::InvalidAdminDigest(value.to_string()))
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidInteger { name: &'static str, value: String },
    InvalidAdminDigest(String),
    MissingVariable(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidInteger { name, value } => {
                write!(f, "{name} must be a positive integer (got {value})")
            }
            Self::InvalidAdminDigest(value) => write!(
                f,
                "ADMIN_TOKEN_SHA256 must be 64 hex characters (got {value})"
            ),
            Self::MissingVariable(name) => write!(f, "{name} must be set"),
        }
    }
}

impl std::error::Error for ConfigError {}
