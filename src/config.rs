//! Binlens Configuration
//!
//! This module provides configuration structures for a binlog analysis job:
//! the source server connection, the job filters and outputs, and logging.

use chrono::{Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Datetime format accepted for start/stop bounds
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Offset of the first event in a binlog file (right after the magic header)
pub const BINLOG_START_POS: u32 = 4;

/// Main Binlens configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlensConfig {
    /// Source server connection
    pub database: DatabaseConfig,

    /// Job parameters
    #[serde(default)]
    pub job: JobConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Source server connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// MySQL host
    pub host: String,

    /// MySQL port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Replication user (needs REPLICATION SLAVE and REPLICATION CLIENT)
    pub user: String,

    /// Password
    #[serde(default)]
    pub password: String,

    /// Server id announced when registering as a replica
    #[serde(default = "default_server_id")]
    pub server_id: u32,

    /// Connection pool size for catalog/schema queries
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// What a job produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkType {
    /// Forward SQL
    #[serde(rename = "2sql")]
    ToSql,
    /// Rollback SQL
    Rollback,
    /// Statistics only, no SQL generation
    Stats,
}

/// Where events are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Live replication session against the server
    Repl,
    /// Local binlog files
    File,
}

/// Job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Event source
    #[serde(default = "default_mode")]
    pub mode: SourceMode,

    /// Work type
    #[serde(default = "default_work_type")]
    pub work_type: WorkType,

    /// Databases to include (empty = all)
    #[serde(default)]
    pub databases: Vec<String>,

    /// Tables to include (empty = all)
    #[serde(default)]
    pub tables: Vec<String>,

    /// Emit DDL statements only (row events are not rendered)
    #[serde(default)]
    pub include_ddl: bool,

    #[serde(default = "default_true")]
    pub include_insert: bool,

    #[serde(default = "default_true")]
    pub include_update: bool,

    #[serde(default = "default_true")]
    pub include_delete: bool,

    /// SQL generation workers
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Start bound, `YYYY-MM-DD HH:MM:SS` local time
    #[serde(default)]
    pub start_datetime: Option<String>,

    /// Stop bound, `YYYY-MM-DD HH:MM:SS` local time
    #[serde(default)]
    pub stop_datetime: Option<String>,

    /// Explicit start file (skips the start-file search)
    #[serde(default)]
    pub start_file: Option<String>,

    #[serde(default)]
    pub start_position: Option<u32>,

    #[serde(default)]
    pub stop_file: Option<String>,

    #[serde(default)]
    pub stop_position: Option<u32>,

    /// Local binlog files, oldest first (file mode only)
    #[serde(default)]
    pub local_files: Vec<PathBuf>,

    /// Directory for SQL and report files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Print SQL to stdout and tail the server without an idle deadline
    #[serde(default)]
    pub output_to_screen: bool,

    /// Prefix each statement with a position/timestamp comment
    #[serde(default = "default_true")]
    pub extra_info: bool,

    /// Idle deadline per pull before the stream is considered drained
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Deadline for reading the first event of a candidate file
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Statistics bucket width in binlog seconds
    #[serde(default = "default_print_interval")]
    pub print_interval_secs: u32,

    /// Rows at which a transaction is reported as big
    #[serde(default = "default_big_trx_rows")]
    pub big_trx_row_limit: usize,

    /// Duration at which a transaction is reported as long
    #[serde(default = "default_long_trx_secs")]
    pub long_trx_seconds: u32,

    /// Verify CRC32 event checksums
    #[serde(default = "default_true")]
    pub verify_checksum: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_db_port() -> u16 {
    3306
}

fn default_server_id() -> u32 {
    1113306
}

fn default_pool_size() -> u32 {
    2
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_mode() -> SourceMode {
    SourceMode::Repl
}

fn default_work_type() -> WorkType {
    WorkType::ToSql
}

fn default_true() -> bool {
    true
}

fn default_threads() -> usize {
    crate::tuning::auto_tune().worker_threads
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_idle_timeout() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    2
}

fn default_print_interval() -> u32 {
    30
}

fn default_big_trx_rows() -> usize {
    500
}

fn default_long_trx_secs() -> u32 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            work_type: default_work_type(),
            databases: Vec::new(),
            tables: Vec::new(),
            include_ddl: false,
            include_insert: true,
            include_update: true,
            include_delete: true,
            threads: default_threads(),
            start_datetime: None,
            stop_datetime: None,
            start_file: None,
            start_position: None,
            stop_file: None,
            stop_position: None,
            local_files: Vec::new(),
            output_dir: default_output_dir(),
            output_to_screen: false,
            extra_info: true,
            idle_timeout_secs: default_idle_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            print_interval_secs: default_print_interval(),
            big_trx_row_limit: default_big_trx_rows(),
            long_trx_seconds: default_long_trx_secs(),
            verify_checksum: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DatabaseConfig {
    /// Build a connection from `user:password@tcp(host:port)`
    pub fn from_connection_string(conn: &str) -> Result<Self> {
        let conn = conn.trim().trim_end_matches('/');

        let (user_pass, addr) = conn
            .split_once("@tcp(")
            .ok_or_else(|| Error::Config(format!("invalid connection string: {}", conn)))?;

        let (user, password) = user_pass
            .split_once(':')
            .ok_or_else(|| Error::Config("invalid user:password section".into()))?;

        let addr = addr.trim_end_matches(')');
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("invalid host:port section: {}", addr)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port: {}", port)))?;

        Ok(Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
            server_id: default_server_id(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
        })
    }

    /// Server-level connection URL for sqlx
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}",
            self.user, self.password, self.host, self.port
        )
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl JobConfig {
    /// Start bound as a unix timestamp
    pub fn start_timestamp(&self) -> Result<Option<u32>> {
        self.start_datetime
            .as_deref()
            .map(parse_datetime)
            .transpose()
    }

    /// Stop bound as a unix timestamp
    pub fn stop_timestamp(&self) -> Result<Option<u32>> {
        self.stop_datetime.as_deref().map(parse_datetime).transpose()
    }

    /// Operation types collected from row events
    pub fn sql_types(&self) -> Vec<crate::pipeline::OperationKind> {
        use crate::pipeline::OperationKind;

        let mut kinds = Vec::new();
        if self.include_insert {
            kinds.push(OperationKind::Insert);
        }
        if self.include_update {
            kinds.push(OperationKind::Update);
        }
        if self.include_delete {
            kinds.push(OperationKind::Delete);
        }
        kinds
    }

    pub fn is_stats_only(&self) -> bool {
        self.work_type == WorkType::Stats
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl BinlensConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BinlensConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: BinlensConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration with the given connection and default job settings
    pub fn with_database(database: DatabaseConfig) -> Self {
        Self {
            database,
            job: JobConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.host.is_empty() {
            return Err(Error::Config("database.host cannot be empty".into()));
        }

        let job = &self.job;
        if job.threads == 0 {
            return Err(Error::Config("job.threads must be at least 1".into()));
        }

        if let (Some(start), Some(stop)) = (job.start_timestamp()?, job.stop_timestamp()?) {
            if start >= stop {
                return Err(Error::Config(
                    "job.start_datetime must be earlier than job.stop_datetime".into(),
                ));
            }
        }

        if job.start_position.is_some() && job.start_file.is_none() {
            return Err(Error::Config("job.start_position requires job.start_file".into()));
        }

        if job.stop_position.is_some() && job.stop_file.is_none() {
            return Err(Error::Config("job.stop_position requires job.stop_file".into()));
        }

        if job.mode == SourceMode::File && job.local_files.is_empty() {
            return Err(Error::Config(
                "job.local_files must list at least one binlog file when mode = \"file\"".into(),
            ));
        }

        if job.print_interval_secs == 0 {
            return Err(Error::Config("job.print_interval_secs must be positive".into()));
        }

        Ok(())
    }
}

/// Parse a `YYYY-MM-DD HH:MM:SS` local datetime into a unix timestamp
pub fn parse_datetime(value: &str) -> Result<u32> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), DATETIME_FORMAT)
        .map_err(|e| Error::Config(format!("invalid datetime '{}': {}", value, e)))?;

    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| Error::Config(format!("datetime '{}' does not exist in local time", value)))?;

    u32::try_from(local.timestamp())
        .map_err(|_| Error::Config(format!("datetime '{}' is out of range", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
host = "localhost"
port = 3306
user = "repl"
password = "secret"

[job]
work_type = "rollback"
databases = ["shop"]
tables = ["orders", "items"]
threads = 4
start_datetime = "2026-01-21 16:00:00"
stop_datetime = "2026-01-21 17:00:00"
output_dir = "/tmp/binlens"
"#;

        let config = BinlensConfig::from_str(toml).unwrap();
        assert_eq!(config.database.user, "repl");
        assert_eq!(config.database.server_id, 1113306);
        assert_eq!(config.job.work_type, WorkType::Rollback);
        assert_eq!(config.job.mode, SourceMode::Repl);
        assert_eq!(config.job.tables.len(), 2);
        assert_eq!(config.job.threads, 4);
        assert!(config.job.include_insert);
        assert_eq!(config.job.idle_timeout(), Duration::from_secs(5));

        let start = config.job.start_timestamp().unwrap().unwrap();
        let stop = config.job.stop_timestamp().unwrap().unwrap();
        assert_eq!(stop - start, 3600);
    }

    #[test]
    fn test_stop_before_start_is_rejected() {
        let toml = r#"
[database]
host = "localhost"
user = "repl"

[job]
start_datetime = "2026-01-21 17:00:00"
stop_datetime = "2026-01-21 17:00:00"
"#;

        let err = BinlensConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_file_mode_requires_files() {
        let toml = r#"
[database]
host = "localhost"
user = "repl"

[job]
mode = "file"
"#;

        assert!(BinlensConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_connection_string() {
        let db = DatabaseConfig::from_connection_string("root:p4ss@tcp(127.0.0.1:3307)").unwrap();
        assert_eq!(db.user, "root");
        assert_eq!(db.password, "p4ss");
        assert_eq!(db.host, "127.0.0.1");
        assert_eq!(db.port, 3307);
        assert_eq!(db.address(), "127.0.0.1:3307");

        assert!(DatabaseConfig::from_connection_string("root@127.0.0.1:3306").is_err());
        assert!(DatabaseConfig::from_connection_string("root:x@tcp(127.0.0.1:port)").is_err());
    }

    #[test]
    fn test_sql_types() {
        let mut job = JobConfig::default();
        job.include_update = false;
        let kinds = job.sql_types();
        assert_eq!(kinds.len(), 2);
        assert!(!kinds.contains(&crate::pipeline::OperationKind::Update));
    }

    #[test]
    fn test_invalid_datetime() {
        assert!(parse_datetime("2026/01/21 10:00").is_err());
        assert!(parse_datetime("2026-01-21 10:00:00").is_ok());
    }
}
