//! Process configuration from `STUDIOBOOK_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::payment::GatewayConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("failed to parse {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Embedded,
    Postgres,
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "embedded" => Ok(StorageKind::Embedded),
            "postgres" => Ok(StorageKind::Postgres),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub metrics_port: Option<u16>,
    pub storage: StorageKind,
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub catalog_path: Option<PathBuf>,
    pub lock_timeout: Duration,
    pub storage_timeout: Duration,
    pub request_timeout: Duration,
    pub gateway: GatewayConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset variables take their defaults;
    /// set but malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());
        let millis = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            Ok(Duration::from_millis(parse(name, get(name))?.unwrap_or(default)))
        };
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let storage = parse("STUDIOBOOK_STORAGE", get("STUDIOBOOK_STORAGE"))?
            .unwrap_or(StorageKind::Embedded);
        let database_url = get("DATABASE_URL");
        if storage == StorageKind::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let test_mode = match get("STUDIOBOOK_PAYMENT_TEST_MODE") {
            None => false,
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "STUDIOBOOK_PAYMENT_TEST_MODE",
                        value: v,
                    });
                }
            },
        };

        Ok(Self {
            bind: get("STUDIOBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse("STUDIOBOOK_PORT", get("STUDIOBOOK_PORT"))?.unwrap_or(8080),
            metrics_port: parse("STUDIOBOOK_METRICS_PORT", get("STUDIOBOOK_METRICS_PORT"))?,
            storage,
            data_dir: get("STUDIOBOOK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            compact_threshold: parse(
                "STUDIOBOOK_COMPACT_THRESHOLD",
                get("STUDIOBOOK_COMPACT_THRESHOLD"),
            )?
            .unwrap_or(1000),
            database_url,
            db_max_connections: parse(
                "STUDIOBOOK_DB_MAX_CONNECTIONS",
                get("STUDIOBOOK_DB_MAX_CONNECTIONS"),
            )?
            .unwrap_or(10),
            catalog_path: get("STUDIOBOOK_CATALOG").map(PathBuf::from),
            lock_timeout: millis("STUDIOBOOK_LOCK_TIMEOUT_MS", 2_000)?,
            storage_timeout: millis("STUDIOBOOK_STORAGE_TIMEOUT_MS", 5_000)?,
            request_timeout: millis("STUDIOBOOK_REQUEST_TIMEOUT_MS", 15_000)?,
            gateway: GatewayConfig {
                merchant_login: required("STUDIOBOOK_MERCHANT_LOGIN")?,
                password1: required("STUDIOBOOK_PAYMENT_PASSWORD1")?,
                password2: required("STUDIOBOOK_PAYMENT_PASSWORD2")?,
                payment_url: get("STUDIOBOOK_PAYMENT_URL")
                    .unwrap_or_else(|| "https://auth.robokassa.ru/Merchant/Index.aspx".into()),
                test_mode,
            },
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("studiobook.wal")
    }
}

fn parse<T: FromStr>(name: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    value
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value: v.clone() })
        })
        .transpose()
}
