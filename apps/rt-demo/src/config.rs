//! Demo binary configuration loading (SPEC_FULL.md §1 "ambient stack").
//!
//! TOML is the sole config source, with every field optional and defaulted
//! — mirroring `forwarder::config`'s `RawConfig`/resolved-config split, but
//! sized down to what `echo-server`/`echo-client` actually need: the
//! handful of `TransportConfig` knobs worth tuning from the command line
//! without recompiling. CLI flags (see the binaries) take precedence over
//! a loaded file, which in turn takes precedence over `TransportConfig::default()`.

use rt_transport_core::TransportConfig;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawDemoConfig {
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeats_until_dead: Option<u32>,
    pub session_disconnect_grace_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub max_buffer_size_bytes: Option<usize>,
    pub attempt_budget_capacity: Option<u32>,
    pub budget_restore_interval_ms: Option<u64>,
    pub base_interval_ms: Option<u64>,
    pub max_jitter_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub reconnect_on_connection_drop: Option<bool>,
    pub protocol_version: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DemoConfigError {
    #[error("reading config file '{path}': {source}")]
    Io { path: String, source: std::io::Error },
    #[error("parsing config file '{path}': {source}")]
    Parse { path: String, source: toml::de::Error },
}

/// Load a `RawDemoConfig` from a TOML file, or the all-`None` default if
/// `path` is `None` — a missing `--config` flag just means "use
/// `TransportConfig::default()` as-is," not an error.
pub fn load_raw(path: Option<&Path>) -> Result<RawDemoConfig, DemoConfigError> {
    let Some(path) = path else {
        return Ok(RawDemoConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|source| DemoConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| DemoConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Resolve a `RawDemoConfig` against `TransportConfig::default()`, filling
/// in only the fields the file actually set.
pub fn resolve(raw: RawDemoConfig) -> TransportConfig {
    let defaults = TransportConfig::default();
    TransportConfig {
        heartbeat_interval: raw.heartbeat_interval_ms.map(Duration::from_millis).unwrap_or(defaults.heartbeat_interval),
        heartbeats_until_dead: raw.heartbeats_until_dead.unwrap_or(defaults.heartbeats_until_dead),
        session_disconnect_grace: raw
            .session_disconnect_grace_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.session_disconnect_grace),
        handshake_timeout: raw.handshake_timeout_ms.map(Duration::from_millis).unwrap_or(defaults.handshake_timeout),
        max_buffer_size_bytes: raw.max_buffer_size_bytes.unwrap_or(defaults.max_buffer_size_bytes),
        attempt_budget_capacity: raw.attempt_budget_capacity.unwrap_or(defaults.attempt_budget_capacity),
        budget_restore_interval: raw
            .budget_restore_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.budget_restore_interval),
        base_interval: raw.base_interval_ms.map(Duration::from_millis).unwrap_or(defaults.base_interval),
        max_jitter: raw.max_jitter_ms.map(Duration::from_millis).unwrap_or(defaults.max_jitter),
        max_backoff: raw.max_backoff_ms.map(Duration::from_millis).unwrap_or(defaults.max_backoff),
        reconnect_on_connection_drop: raw.reconnect_on_connection_drop.unwrap_or(defaults.reconnect_on_connection_drop),
        protocol_version: raw.protocol_version.unwrap_or(defaults.protocol_version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_resolves_to_pure_defaults() {
        let config = resolve(load_raw(None).unwrap());
        assert_eq!(config.heartbeat_interval, TransportConfig::default().heartbeat_interval);
    }

    #[test]
    fn partial_toml_only_overrides_what_it_sets() {
        let raw: RawDemoConfig = toml::from_str("heartbeat-interval-ms = 1000\nheartbeats-until-dead = 9\n").unwrap();
        let config = resolve(raw);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1000));
        assert_eq!(config.heartbeats_until_dead, 9);
        assert_eq!(config.protocol_version, TransportConfig::default().protocol_version);
    }
}
