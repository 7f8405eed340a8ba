//! Configuration management

use dataport_common::CsvDialect;
use serde::{Deserialize, Serialize};

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/dataport";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Job Configuration Constants
// ============================================================================

/// Default number of jobs running at the same time.
pub const DEFAULT_JOBS_MAX_CONCURRENT: usize = 4;

/// Default rows inserted per import batch.
pub const DEFAULT_JOBS_IMPORT_BATCH_SIZE: usize = 100;

/// Default records fetched per export batch.
pub const DEFAULT_JOBS_EXPORT_BATCH_SIZE: usize = 1000;

/// Default number of imported rows between progress writes.
pub const DEFAULT_JOBS_PROGRESS_INTERVAL: usize = 10;

/// Default number of PENDING rows read per reconciliation scan.
pub const DEFAULT_JOBS_PENDING_SCAN_LIMIT: i64 = 50;

/// Default lease length in seconds (5 minutes).
pub const DEFAULT_JOBS_LEASE_SECS: u64 = 300;

/// Default reconciliation interval; 0 disables the periodic reconciler.
pub const DEFAULT_JOBS_RECONCILE_INTERVAL_SECS: u64 = 0;

/// Default time finished jobs stay in memory (1 hour).
pub const DEFAULT_JOBS_RETENTION_SECS: u64 = 3600;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jobs: JobsConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Job queue and worker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub max_concurrent: usize,
    pub import_batch_size: usize,
    pub export_batch_size: usize,
    pub progress_interval: usize,
    pub pending_scan_limit: i64,
    pub lease_secs: u64,
    pub reconcile_interval_secs: u64,
    /// How long finished jobs stay in the in-memory map
    pub retention_secs: u64,
    pub csv_dialect: CsvDialect,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_JOBS_MAX_CONCURRENT,
            import_batch_size: DEFAULT_JOBS_IMPORT_BATCH_SIZE,
            export_batch_size: DEFAULT_JOBS_EXPORT_BATCH_SIZE,
            progress_interval: DEFAULT_JOBS_PROGRESS_INTERVAL,
            pending_scan_limit: DEFAULT_JOBS_PENDING_SCAN_LIMIT,
            lease_secs: DEFAULT_JOBS_LEASE_SECS,
            reconcile_interval_secs: DEFAULT_JOBS_RECONCILE_INTERVAL_SECS,
            retention_secs: DEFAULT_JOBS_RETENTION_SECS,
            csv_dialect: CsvDialect::default(),
        }
    }
}

impl JobsConfig {
    /// Read job settings through `lookup`, falling back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let csv_dialect = match lookup("JOBS_CSV_DIALECT") {
            Some(value) => value.parse::<CsvDialect>()?,
            None => defaults.csv_dialect,
        };

        Ok(Self {
            max_concurrent: parse_or(&lookup, "JOBS_MAX_CONCURRENT", defaults.max_concurrent),
            import_batch_size: parse_or(
                &lookup,
                "JOBS_IMPORT_BATCH_SIZE",
                defaults.import_batch_size,
            ),
            export_batch_size: parse_or(
                &lookup,
                "JOBS_EXPORT_BATCH_SIZE",
                defaults.export_batch_size,
            ),
            progress_interval: parse_or(
                &lookup,
                "JOBS_PROGRESS_INTERVAL",
                defaults.progress_interval,
            ),
            pending_scan_limit: parse_or(
                &lookup,
                "JOBS_PENDING_SCAN_LIMIT",
                defaults.pending_scan_limit,
            ),
            lease_secs: parse_or(&lookup, "JOBS_LEASE_SECS", defaults.lease_secs),
            reconcile_interval_secs: parse_or(
                &lookup,
                "JOBS_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            ),
            retention_secs: parse_or(&lookup, "JOBS_RETENTION_SECS", defaults.retention_secs),
            csv_dialect,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent == 0 {
            anyhow::bail!("JOBS_MAX_CONCURRENT must be greater than 0");
        }
        if self.import_batch_size == 0 || self.export_batch_size == 0 {
            anyhow::bail!("Job batch sizes must be greater than 0");
        }
        if self.progress_interval == 0 {
            anyhow::bail!("JOBS_PROGRESS_INTERVAL must be greater than 0");
        }
        if self.pending_scan_limit <= 0 {
            anyhow::bail!("JOBS_PENDING_SCAN_LIMIT must be greater than 0");
        }
        if self.lease_secs == 0 {
            anyhow::bail!("JOBS_LEASE_SECS must be greater than 0");
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        Ok(Config {
            server: ServerConfig {
                host: lookup("DATAPORT_HOST").unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string()),
                port: parse_or(&lookup, "DATAPORT_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: parse_or(
                    &lookup,
                    "DATAPORT_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: parse_or(
                    &lookup,
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: parse_or(
                    &lookup,
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: parse_or(
                    &lookup,
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: parse_or(
                    &lookup,
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            jobs: JobsConfig::from_lookup(&lookup)?,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        self.jobs.validate()?;

        if self.jobs.max_concurrent as u32 >= self.database.max_connections {
            tracing::warn!(
                max_concurrent = self.jobs.max_concurrent,
                max_connections = self.database.max_connections,
                "Job pool is not smaller than the database pool; HTTP handlers may starve"
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            jobs: JobsConfig::default(),
        }
    }
}
