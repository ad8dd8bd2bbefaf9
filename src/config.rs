use std::env;
use std::path::PathBuf;

use crate::model::Minute;

/// Knobs the availability engine needs that are not part of any provider's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Step of the disabled-hours calendar view.
    pub mask_granularity: Minute,
    /// Duration assumed by the disabled-hours view when the caller names neither
    /// a service nor a duration.
    pub default_mask_duration: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mask_granularity: 10,
            default_mask_duration: 60,
        }
    }
}

/// Process configuration, read once from `SLOTKEEPER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        Self {
            bind: env::var("SLOTKEEPER_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parsed("SLOTKEEPER_PORT").unwrap_or(5433),
            data_dir: PathBuf::from(
                env::var("SLOTKEEPER_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            ),
            password: env::var("SLOTKEEPER_PASSWORD").unwrap_or_else(|_| "slotkeeper".into()),
            max_connections: parsed("SLOTKEEPER_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed("SLOTKEEPER_COMPACT_THRESHOLD").unwrap_or(1000),
            tls_cert: env::var("SLOTKEEPER_TLS_CERT").ok(),
            tls_key: env::var("SLOTKEEPER_TLS_KEY").ok(),
            metrics_port: parsed("SLOTKEEPER_METRICS_PORT"),
            engine: EngineConfig {
                mask_granularity: parsed::<Minute>("SLOTKEEPER_MASK_GRANULARITY")
                    .filter(|g| *g > 0)
                    .unwrap_or(defaults.mask_granularity),
                default_mask_duration: parsed::<u32>("SLOTKEEPER_DEFAULT_MASK_DURATION")
                    .filter(|d| *d > 0)
                    .unwrap_or(defaults.default_mask_duration),
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}
