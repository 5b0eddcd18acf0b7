use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::PdpError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub cache: Cache,
    pub functions: Functions,
    pub decision: DecisionLimits,
    pub asserter: Option<Asserter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Use the store's watch stream when it offers one. When false (or
    /// the store cannot watch) the cache polls instead.
    #[serde(default = "default_watch")]
    pub watch: bool,
    /// Polling interval, and the documented bound within which decisions
    /// reflect store mutations.
    pub reload_interval_secs: u64,
}

fn default_watch() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Functions {
    /// Hard per-call timeout for remote custom functions.
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLimits {
    /// Deadline for a single decision; exceeding it aborts the request
    /// with an evaluation error rather than returning partial results.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asserter {
    /// Token assertion webhook endpoint.
    pub endpoint: String,
    pub timeout_secs: u64,
    /// Identity domains the asserter may accept, passed through on every
    /// assertion call.
    pub allowed_idd: Option<String>,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            watch: true,
            reload_interval_secs: 30,
        }
    }
}

impl Default for Functions {
    fn default() -> Self {
        Self {
            call_timeout_secs: 5,
        }
    }
}

impl Default for DecisionLimits {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl Settings {
    /// Load settings from an optional file with environment overrides:
    /// `FULCRUM__CACHE__RELOAD_INTERVAL_SECS=5`, etc.
    pub fn load(path: &str) -> Result<Self, PdpError> {
        let defaults = Settings::default();
        let mut builder = config::Config::builder()
            .set_default("cache.watch", defaults.cache.watch)?
            .set_default(
                "cache.reload_interval_secs",
                defaults.cache.reload_interval_secs as i64,
            )?
            .set_default(
                "functions.call_timeout_secs",
                defaults.functions.call_timeout_secs as i64,
            )?
            .set_default("decision.timeout_secs", defaults.decision.timeout_secs as i64)?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(config::Environment::with_prefix("FULCRUM").separator("__"));

        let cfg = builder.build()?;
        let settings: Settings = cfg.try_deserialize()?;
        Ok(settings)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.cache.reload_interval_secs)
    }

    pub fn function_call_timeout(&self) -> Duration {
        Duration::from_secs(self.functions.call_timeout_secs)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision.timeout_secs)
    }
}
