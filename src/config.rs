use serde::Deserialize;
use std::time::Duration;
use std::{env, fs, path::Path};

use crate::db::DatabaseConfig;

/// Engine settings. Fields left out of a config file fall back to the
/// environment, then to the built-in defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How often overdue waits and tasks are expired.
    pub sweep_interval_ms: u64,
    /// TTL for tasks queued without one.
    pub default_task_ttl_ms: u64,
    pub database: DatabaseConfig,
}

impl EngineConfig {
    pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;
    pub const DEFAULT_TASK_TTL_MS: u64 = 5 * 60 * 1_000;

    /// Load from a JSON file; `${VAR}` references in the database settings
    /// are expanded from the environment.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.database = expand_database(config.database);
        Ok(config)
    }

    /// Sweep period; a zero setting means as often as possible.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: env_u64("PIPELINE_ENGINE_SWEEP_INTERVAL_MS")
                .unwrap_or(Self::DEFAULT_SWEEP_INTERVAL_MS),
            default_task_ttl_ms: env_u64("PIPELINE_ENGINE_TASK_TTL_MS")
                .unwrap_or(Self::DEFAULT_TASK_TTL_MS),
            database: DatabaseConfig::default(),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_database(mut db: DatabaseConfig) -> DatabaseConfig {
    db.url = expand_env_vars(&db.url);
    db.namespace = expand_env_vars(&db.namespace);
    db.database = expand_env_vars(&db.database);
    if let Some(user) = db.username.as_mut() {
        *user = expand_env_vars(user);
    }
    if let Some(pass) = db.password.as_mut() {
        *pass = expand_env_vars(pass);
    }
    db
}
