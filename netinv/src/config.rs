use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "netinv.yaml";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8000";
pub const DEFAULT_DB_PATH: &str = "netinv.db";
pub const DEFAULT_SCANNER_URL: &str = "http://scanner:8081";
pub const DEFAULT_SCANNER_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_WRITE_WAIT_MS: u64 = 600_000;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
    /// How long a snapshot waits for another writer's lock.
    pub write_wait_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ScannerConfig {
    pub url: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct LogConfig {
    pub level: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub server: Option<ServerConfig>,
    pub database: Option<DatabaseConfig>,
    pub scanner: Option<ScannerConfig>,
    pub log: Option<LogConfig>,
}

/// Loads `path`, or `./netinv.yaml` when no path is given and that file exists.
/// An explicitly named file that is missing or invalid is an error.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading config {}", path.display()))?;
    let cfg = serde_yaml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(Some(cfg))
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub listen: Option<String>,
    pub db: Option<PathBuf>,
    pub scanner_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub listen: SocketAddr,
    pub db_path: PathBuf,
    pub db_write_wait: Duration,
    pub scanner_url: String,
    pub scanner_timeout: Duration,
    pub log_level: String,
    pub log_format: String,
}

impl Settings {
    /// Flag > environment (`NETINV_DB`, `SCANNER_URL`) > file > default.
    pub fn resolve(cfg: Option<&Config>, env: impl Fn(&str) -> Option<String>, cli: &Overrides) -> Result<Self> {
        let file = cfg.cloned().unwrap_or_default();
        let server = file.server.unwrap_or_default();
        let database = file.database.unwrap_or_default();
        let scanner = file.scanner.unwrap_or_default();
        let log = file.log.unwrap_or_default();

        let listen = cli.listen.clone().or(server.listen).unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen = listen.parse().with_context(|| format!("invalid listen address '{listen}'"))?;
        let db_write_wait = Duration::from_millis(database.write_wait_ms.unwrap_or(DEFAULT_WRITE_WAIT_MS));
        let db_path = cli
            .db
            .clone()
            .or_else(|| env("NETINV_DB").map(PathBuf::from))
            .or(database.path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
        let scanner_url = cli
            .scanner_url
            .clone()
            .or_else(|| env("SCANNER_URL"))
            .or(scanner.url)
            .unwrap_or_else(|| DEFAULT_SCANNER_URL.to_string());
        Ok(Settings {
            listen,
            db_path,
            db_write_wait,
            scanner_url,
            scanner_timeout: Duration::from_millis(scanner.timeout_ms.unwrap_or(DEFAULT_SCANNER_TIMEOUT_MS)),
            log_level: log.level.unwrap_or_else(|| "info".to_string()),
            log_format: log.format.unwrap_or_else(|| "pretty".to_string()),
        })
    }
}
