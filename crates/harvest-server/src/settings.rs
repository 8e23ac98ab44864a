//! Gateway settings with layered sources.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewaySettings::default()`]
//! 2. If `~/.harvest/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `HARVEST_*` environment variable overrides (highest priority)
//!
//! File values outside the ranges below are clamped with a warning; env
//! values outside them are ignored.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use harvest_engine::InvokerConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::server::ServerConfig;

const HEARTBEAT_SECS: RangeInclusive<u64> = 1..=3_600;
const DEADLINE_SECS: RangeInclusive<u64> = 1..=3_600;
const WORKERS: RangeInclusive<u64> = 1..=1_024;
const SEND_QUEUE: RangeInclusive<u64> = 1..=65_536;
const SEND_TIMEOUT_MS: RangeInclusive<u64> = 1..=60_000;
const CLIENT_TIMEOUT_SECS: RangeInclusive<u64> = 1..=86_400;
const DRAIN_TIMEOUT_SECS: RangeInclusive<u64> = 0..=3_600;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    pub server: ServerSettings,
    pub invoker: InvokerSettings,
    pub logging: LoggingSettings,
}

/// Network and connection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port; `0` picks a free one.
    pub port: u16,
    /// Outbound frames buffered per connection.
    pub max_send_queue: usize,
    /// How long a send may wait on a full queue before the connection is
    /// considered broken.
    pub send_timeout_ms: u64,
    /// WebSocket ping interval.
    pub heartbeat_interval_secs: u64,
    /// Connections silent for longer than this are dropped.
    pub client_timeout_secs: u64,
    /// Grace period for in-flight queries at shutdown.
    pub drain_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_send_queue: 256,
            send_timeout_ms: 5_000,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            drain_timeout_secs: 35,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvokerSettings {
    /// Pipeline computations allowed to run at once.
    pub workers: usize,
    /// Per-query deadline, measured from admission.
    pub deadline_secs: u64,
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            deadline_secs: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module level overrides, e.g. `{"harvest_engine": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            modules: BTreeMap::new(),
        }
    }
}

impl GatewaySettings {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            max_send_queue: self.server.max_send_queue.max(1),
            send_timeout: Duration::from_millis(self.server.send_timeout_ms),
            heartbeat_interval: Duration::from_secs(self.server.heartbeat_interval_secs.max(1)),
            client_timeout: Duration::from_secs(self.server.client_timeout_secs),
        }
    }

    pub fn invoker_config(&self) -> InvokerConfig {
        InvokerConfig {
            workers: self.invoker.workers,
            deadline: Duration::from_secs(self.invoker.deadline_secs),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.server.drain_timeout_secs)
    }
}

/// Resolve the path to the settings file (`~/.harvest/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".harvest").join("settings.json")
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

/// Defaults deep-merged with the file at `path`, without env overrides.
pub fn load_file(path: &Path) -> Result<GatewaySettings> {
    let defaults = serde_json::to_value(GatewaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: GatewaySettings = serde_json::from_value(merged)?;
    clamp_to_ranges(&mut settings);
    Ok(settings)
}

/// Pull every numeric setting into its supported range.
pub fn clamp_to_ranges(settings: &mut GatewaySettings) {
    let server = &mut settings.server;
    server.heartbeat_interval_secs =
        clamp_u64("server.heartbeatIntervalSecs", server.heartbeat_interval_secs, HEARTBEAT_SECS);
    server.client_timeout_secs =
        clamp_u64("server.clientTimeoutSecs", server.client_timeout_secs, CLIENT_TIMEOUT_SECS);
    server.drain_timeout_secs =
        clamp_u64("server.drainTimeoutSecs", server.drain_timeout_secs, DRAIN_TIMEOUT_SECS);
    server.send_timeout_ms = clamp_u64("server.sendTimeoutMs", server.send_timeout_ms, SEND_TIMEOUT_MS);
    server.max_send_queue =
        clamp_u64("server.maxSendQueue", server.max_send_queue as u64, SEND_QUEUE) as usize;

    let invoker = &mut settings.invoker;
    invoker.deadline_secs = clamp_u64("invoker.deadlineSecs", invoker.deadline_secs, DEADLINE_SECS);
    invoker.workers = clamp_u64("invoker.workers", invoker.workers as u64, WORKERS) as usize;
}

fn clamp_u64(key: &str, value: u64, range: RangeInclusive<u64>) -> u64 {
    let clamped = value.clamp(*range.start(), *range.end());
    if clamped != value {
        warn!(key, value, clamped, "setting out of range, clamping");
    }
    clamped
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, anything else is replaced by `source`, and nulls
/// in `source` leave `target` untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `HARVEST_*` overrides read through `lookup`.
///
/// Out-of-range or unparseable values are logged and ignored.
pub fn apply_env_overrides(settings: &mut GatewaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("HARVEST_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_in("HARVEST_PORT", 0..=u64::from(u16::MAX)) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.u64_in("HARVEST_HEARTBEAT_SECS", HEARTBEAT_SECS) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.u64_in("HARVEST_DEADLINE_SECS", DEADLINE_SECS) {
        settings.invoker.deadline_secs = v;
    }
    if let Some(v) = env.u64_in("HARVEST_WORKERS", WORKERS) {
        settings.invoker.workers = v as usize;
    }
    if let Some(v) = env.string("HARVEST_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("HARVEST_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64_in(&self, name: &str, range: RangeInclusive<u64>) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let (min, max) = (*range.start(), *range.end());
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, min, max, "invalid numeric env var, ignoring");
        }
        result
    }
}
