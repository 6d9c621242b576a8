use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

const PREFIX: &str = "CLICKHOUSE_BULK_";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Compression {
    Gzip,
    None,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("CLICKHOUSE_BULK_SERVERS is required but not set")]
    ServersMissing,

    #[error("CLICKHOUSE_BULK_SERVERS contains an invalid URL: {0}")]
    InvalidServerUrl(String),

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("CLICKHOUSE_BULK_COMPRESSION has invalid value: {0} (expected \"gzip\" or \"none\")")]
    InvalidCompression(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Backend addresses in failover order.
    pub servers: Vec<Url>,
    pub down_timeout: Duration,
    pub flush_count: usize,
    pub flush_interval: Duration,
    pub dump_dir: PathBuf,
    /// `None` disables background replay of dump files.
    pub dump_check_interval: Option<Duration>,
    pub listener_port: u16,
    pub send_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_in_flight: usize,
    pub compression: Compression,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> =
            env::vars().filter(|(k, _)| k.starts_with(PREFIX)).collect();
        Self::parse(&vars)
    }

    fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let servers = parse_servers(vars)?;
        let down_timeout = parse_duration_s(vars, "CLICKHOUSE_BULK_DOWN_TIMEOUT_S", 300)?;
        let flush_count = parse_positive(vars, "CLICKHOUSE_BULK_FLUSH_COUNT", 10_000)?;
        let flush_interval = parse_duration_ms(vars, "CLICKHOUSE_BULK_FLUSH_INTERVAL_MS", 1000)?;
        if flush_interval.is_zero() {
            return Err(invalid(vars, "CLICKHOUSE_BULK_FLUSH_INTERVAL_MS"));
        }
        let dump_dir = vars
            .get("CLICKHOUSE_BULK_DUMP_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("dumps"));
        let dump_check_interval =
            parse_duration_ms(vars, "CLICKHOUSE_BULK_DUMP_CHECK_INTERVAL_MS", 0)?;
        let listener_port = parse_port(vars, "CLICKHOUSE_BULK_LISTENER_PORT", 8124)?;
        let send_timeout = parse_duration_ms(vars, "CLICKHOUSE_BULK_SEND_TIMEOUT_MS", 30_000)?;
        let shutdown_timeout =
            parse_duration_ms(vars, "CLICKHOUSE_BULK_SHUTDOWN_TIMEOUT_MS", 5000)?;
        let max_in_flight = parse_positive(vars, "CLICKHOUSE_BULK_MAX_INFLIGHT", 32)?;
        let compression = parse_compression(vars)?;

        Ok(Self {
            servers,
            down_timeout,
            flush_count,
            flush_interval,
            dump_dir,
            dump_check_interval: (!dump_check_interval.is_zero()).then_some(dump_check_interval),
            listener_port,
            send_timeout,
            shutdown_timeout,
            max_in_flight,
            compression,
        })
    }
}

fn invalid(vars: &HashMap<String, String>, name: &str) -> ConfigError {
    ConfigError::InvalidNumeric(name.to_owned(), vars.get(name).cloned().unwrap_or_default())
}

fn parse_servers(vars: &HashMap<String, String>) -> Result<Vec<Url>, ConfigError> {
    let raw = vars
        .get("CLICKHOUSE_BULK_SERVERS")
        .filter(|s| !s.trim().is_empty())
        .ok_or(ConfigError::ServersMissing)?;

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Url::parse(s).map_err(|_| ConfigError::InvalidServerUrl(s.to_owned())))
        .collect()
}

fn parse_port(
    vars: &HashMap<String, String>,
    name: &str,
    default: u16,
) -> Result<u16, ConfigError> {
    match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(default),
    }
}

fn parse_positive(
    vars: &HashMap<String, String>,
    name: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    match vars.get(name) {
        Some(val) => match val.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        },
        None => Ok(default),
    }
}

fn parse_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    match vars.get(name) {
        Some(val) => {
            let ms: u64 = val
                .parse()
                .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone()))?;
            Ok(Duration::from_millis(ms))
        }
        None => Ok(Duration::from_millis(default_ms)),
    }
}

fn parse_duration_s(
    vars: &HashMap<String, String>,
    name: &str,
    default_s: u64,
) -> Result<Duration, ConfigError> {
    match vars.get(name) {
        Some(val) => {
            let secs: u64 = val
                .parse()
                .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone()))?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(Duration::from_secs(default_s)),
    }
}

fn parse_compression(vars: &HashMap<String, String>) -> Result<Compression, ConfigError> {
    match vars.get("CLICKHOUSE_BULK_COMPRESSION").map(|s| s.as_str()) {
        Some("none") | Some("") | None => Ok(Compression::None),
        Some("gzip") => Ok(Compression::Gzip),
        Some(other) => Err(ConfigError::InvalidCompression(other.to_owned())),
    }
}
