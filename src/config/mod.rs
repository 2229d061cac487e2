/// Configuration management for the Mechaflow engine
///
/// Handles server, storage, queue, resume-bus and run-retention parameters.
/// Every value can be overridden through a `MECHAFLOW_*` environment variable.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration (job queue + execution records)
    pub database: DatabaseConfig,
    /// Durable job queue configuration
    pub queue: QueueConfig,
    /// Cross-process resume channel configuration
    pub bus: BusConfig,
    /// Run directory configuration
    pub runs: RunConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// SQLite database used for the job queue and execution records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection url (default: "sqlite://data/mechaflow.db")
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Whether this process runs a queue worker
    pub enabled: bool,
    /// Idle poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Attempts per job before it is marked dead
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// PostgreSQL url for LISTEN/NOTIFY. None keeps resume traffic in-process.
    pub postgres_url: Option<String>,
    /// NOTIFY channel name
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Seconds a terminal run stays queryable before eviction
    pub retention_secs: u64,
    /// Per-run progress channel capacity
    pub event_buffer: usize,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl RunConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            retention_secs: 300,
            event_buffer: 256,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("MECHAFLOW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("MECHAFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                url: std::env::var("MECHAFLOW_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/mechaflow.db".to_string()),
            },
            queue: QueueConfig {
                enabled: env_or("MECHAFLOW_QUEUE_ENABLED", true),
                poll_interval_ms: env_or("MECHAFLOW_QUEUE_POLL_MS", 500),
                max_attempts: env_or("MECHAFLOW_QUEUE_MAX_ATTEMPTS", 3),
            },
            bus: BusConfig {
                postgres_url: std::env::var("MECHAFLOW_RESUME_BUS_URL").ok().filter(|u| !u.is_empty()),
                channel: std::env::var("MECHAFLOW_RESUME_CHANNEL")
                    .unwrap_or_else(|_| "mechaflow_resume".to_string()),
            },
            runs: RunConfig {
                retention_secs: env_or("MECHAFLOW_RUN_RETENTION_SECS", 300),
                event_buffer: env_or("MECHAFLOW_EVENT_BUFFER", 256),
            },
        }
    }
}
