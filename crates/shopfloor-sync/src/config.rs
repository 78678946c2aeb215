//! # Sync Configuration
//!
//! Configuration management for the synchronization layer.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     SHOPFLOOR_SERVER_URL=wss://mes.plant.local/ws                      │
//! │     SHOPFLOOR_DEVICE_ID=line-3-tablet                                  │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/shopfloor-link/sync.toml (Linux)                         │
//! │     ~/Library/Application Support/com.shopfloor.link/sync.toml (macOS) │
//! │                                                                         │
//! │  3. Preset (factory_network | tablet | high_performance)               │
//! │                                                                         │
//! │  4. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Line 3 Tablet"
//!
//! [connection]
//! server_url = "wss://mes.plant.local/ws"
//! backoff_base_ms = 1000
//! backoff_cap_ms = 30000
//! max_reconnect_attempts = 10
//!
//! [dispatch]
//! batch_size = 10
//! batch_timeout_ms = 100
//!
//! [queue]
//! conflict_strategy = "manual"
//!
//! [network]
//! health_endpoint = "http://mes.plant.local:8080/health"
//! ```

use serde::{Deserialize, Serialize};
use shopfloor_core::validation::validate_action_priority;
use shopfloor_core::{
    HealthThresholds, HealthWeights, ResolutionStrategy, DEFAULT_ACTION_PRIORITY,
    DEFAULT_MAX_RETRIES,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Line 3 Tablet").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Floor Client".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Connection Settings
// =============================================================================

/// Socket lifecycle, backoff and heartbeat settings.
///
/// ## Reconnect Timeline (defaults)
/// ```text
/// attempt:   1      2      3      4       5       6 ...
/// delay:     1s     2s     4s     8s      16s     30s (cap)
///            + jitter in [0, delay * jitter_ratio]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// WebSocket URL of the backend (`ws://` or `wss://`).
    #[serde(default = "default_server_url")]
    pub server_url: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// First reconnect delay.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Upper bound of the pre-jitter delay.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,

    /// Jitter spread as a fraction of the pre-jitter delay (0.0 - 1.0).
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Reconnect attempts before the terminal `Error` state.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive unanswered pings before the socket is dropped.
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,

    /// Health score below which a connected socket is recycled.
    #[serde(default = "default_proactive_threshold")]
    pub proactive_reconnect_threshold: f64,
}

fn default_server_url() -> String {
    "ws://localhost:8080/ws".to_string()
}
fn default_connect_timeout() -> u64 {
    10_000
}
fn default_backoff_base() -> u64 {
    1_000
}
fn default_backoff_cap() -> u64 {
    30_000
}
fn default_jitter_ratio() -> f64 {
    0.3
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_heartbeat_interval() -> u64 {
    30_000
}
fn default_max_missed_heartbeats() -> u32 {
    3
}
fn default_health_check_interval() -> u64 {
    10_000
}
fn default_proactive_threshold() -> f64 {
    0.3
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            server_url: default_server_url(),
            connect_timeout_ms: default_connect_timeout(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            jitter_ratio: default_jitter_ratio(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            health_check_interval_ms: default_health_check_interval(),
            proactive_reconnect_threshold: default_proactive_threshold(),
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Health thresholds derived from the heartbeat cadence: a link is
    /// stale after two silent heartbeat intervals.
    pub fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            stale_after: self.heartbeat_interval() * 2,
            ..HealthThresholds::default()
        }
    }

    pub fn health_weights(&self) -> HealthWeights {
        HealthWeights::default()
    }
}

// =============================================================================
// Dispatch Settings
// =============================================================================

/// Outbound lane and batching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Normal/low messages combined into one `batch` frame.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Longest a buffered normal/low message waits for its batch.
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_ms: u64,

    /// Bound across all four lanes.
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,

    /// Write failures tolerated per frame before it is dropped.
    #[serde(default = "default_max_message_retries")]
    pub max_message_retries: u32,
}

fn default_batch_size() -> usize {
    10
}
fn default_batch_timeout() -> u64 {
    100
}
fn default_max_queued_messages() -> usize {
    1_000
}
fn default_max_message_retries() -> u32 {
    3
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchSettings {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout(),
            max_queued_messages: default_max_queued_messages(),
            max_message_retries: default_max_message_retries(),
        }
    }
}

impl DispatchSettings {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

// =============================================================================
// Queue Settings
// =============================================================================

/// Offline action queue and reconciler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Priority for actions submitted without one (0-10).
    #[serde(default = "default_action_priority")]
    pub default_priority: u8,

    /// Retry budget for actions submitted without one.
    #[serde(default = "default_action_retries")]
    pub default_max_retries: u32,

    /// Days a completed or cancelled action is kept before cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Interval between automatic passes while connected.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    #[serde(default)]
    pub conflict_strategy: ResolutionStrategy,

    /// How long the channel entity service waits for `entity_result`.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_action_priority() -> u8 {
    DEFAULT_ACTION_PRIORITY
}
fn default_action_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_retention_days() -> u32 {
    7
}
fn default_sync_interval() -> u64 {
    60
}
fn default_request_timeout() -> u64 {
    10_000
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            default_priority: default_action_priority(),
            default_max_retries: default_action_retries(),
            retention_days: default_retention_days(),
            sync_interval_secs: default_sync_interval(),
            conflict_strategy: ResolutionStrategy::default(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl QueueSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// =============================================================================
// Network Settings
// =============================================================================

/// Network monitor probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Endpoint the latency probe connects to. Falls back to the server
    /// URL's host when unset.
    #[serde(default)]
    pub health_endpoint: Option<String>,

    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Consecutive probe failures treated as offline.
    #[serde(default = "default_probe_failure_threshold")]
    pub probe_failure_threshold: u32,
}

fn default_probe_interval() -> u64 {
    15
}
fn default_probe_timeout() -> u64 {
    3_000
}
fn default_probe_failure_threshold() -> u32 {
    3
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            health_endpoint: None,
            probe_interval_secs: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            probe_failure_threshold: default_probe_failure_threshold(),
        }
    }
}

impl NetworkSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// =============================================================================
// Presets
// =============================================================================

/// Named timing profiles. They differ only in timing and batching.
///
/// ```text
/// ┌──────────────────┬───────────┬──────────────┬─────────┬─────────────┐
/// │ preset           │ heartbeat │ backoff      │ batch   │ attempts    │
/// ├──────────────────┼───────────┼──────────────┼─────────┼─────────────┤
/// │ factory_network  │ 15s       │ 2s .. 60s    │ 20/250ms│ 20          │
/// │ tablet           │ 30s       │ 1s .. 30s    │ 10/100ms│ 10          │
/// │ high_performance │ 5s        │ 250ms .. 5s  │ 50/20ms │ 10          │
/// └──────────────────┴───────────┴──────────────┴─────────┴─────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Congested plant Wi-Fi: patient backoff, larger batches.
    FactoryNetwork,
    /// Handheld devices roaming between access points.
    Tablet,
    /// Wired control-room stations.
    HighPerformance,
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Preset::FactoryNetwork => write!(f, "factory_network"),
            Preset::Tablet => write!(f, "tablet"),
            Preset::HighPerformance => write!(f, "high_performance"),
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "factory_network" | "factory" => Ok(Preset::FactoryNetwork),
            "tablet" => Ok(Preset::Tablet),
            "high_performance" | "wired" => Ok(Preset::HighPerformance),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown preset: '{}'. Valid options: factory_network, tablet, high_performance",
                other
            ))),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub dispatch: DispatchSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub network: NetworkSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a full configuration from a named preset.
    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::FactoryNetwork => Self::factory_network(),
            Preset::Tablet => Self::tablet(),
            Preset::HighPerformance => Self::high_performance(),
        }
    }

    pub fn factory_network() -> Self {
        let mut config = Self::default();
        config.connection.connect_timeout_ms = 15_000;
        config.connection.backoff_base_ms = 2_000;
        config.connection.backoff_cap_ms = 60_000;
        config.connection.jitter_ratio = 0.5;
        config.connection.max_reconnect_attempts = 20;
        config.connection.heartbeat_interval_ms = 15_000;
        config.connection.proactive_reconnect_threshold = 0.4;
        config.dispatch.batch_size = 20;
        config.dispatch.batch_timeout_ms = 250;
        config
    }

    pub fn tablet() -> Self {
        let mut config = Self::default();
        config.dispatch.max_queued_messages = 500;
        config
    }

    pub fn high_performance() -> Self {
        let mut config = Self::default();
        config.connection.connect_timeout_ms = 5_000;
        config.connection.backoff_base_ms = 250;
        config.connection.backoff_cap_ms = 5_000;
        config.connection.heartbeat_interval_ms = 5_000;
        config.connection.health_check_interval_ms = 2_000;
        config.dispatch.batch_size = 50;
        config.dispatch.batch_timeout_ms = 20;
        config.dispatch.max_queued_messages = 5_000;
        config.queue.sync_interval_secs = 15;
        config
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        Self::load_with_base(Self::default(), config_path)
    }

    /// Like [`SyncConfig::load`] but starts from a preset when no file exists.
    pub fn load_with_base(base: SyncConfig, config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = base;

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        let url = Url::parse(&self.connection.server_url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(SyncError::InvalidUrl(format!(
                "Server URL must start with ws:// or wss://, got: {}",
                self.connection.server_url
            )));
        }

        if let Some(ref endpoint) = self.network.health_endpoint {
            let parsed = Url::parse(endpoint)?;
            if parsed.host_str().is_none() {
                return Err(SyncError::InvalidUrl(format!(
                    "Health endpoint has no host: {}",
                    endpoint
                )));
            }
        }

        let conn = &self.connection;
        if conn.backoff_base_ms == 0 || conn.backoff_cap_ms < conn.backoff_base_ms {
            return Err(SyncError::InvalidConfig(
                "backoff_base_ms must be > 0 and <= backoff_cap_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&conn.jitter_ratio) {
            return Err(SyncError::InvalidConfig(
                "jitter_ratio must be between 0.0 and 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&conn.proactive_reconnect_threshold) {
            return Err(SyncError::InvalidConfig(
                "proactive_reconnect_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        if conn.heartbeat_interval_ms == 0 || conn.health_check_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "heartbeat and health check intervals must be greater than 0".into(),
            ));
        }
        if conn.max_missed_heartbeats == 0 {
            return Err(SyncError::InvalidConfig(
                "max_missed_heartbeats must be greater than 0".into(),
            ));
        }

        if self.dispatch.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }
        if self.dispatch.max_queued_messages == 0 {
            return Err(SyncError::InvalidConfig(
                "max_queued_messages must be greater than 0".into(),
            ));
        }

        validate_action_priority(self.queue.default_priority)?;
        if self.queue.sync_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sync_interval_secs must be greater than 0".into(),
            ));
        }

        if self.network.probe_failure_threshold == 0 {
            return Err(SyncError::InvalidConfig(
                "probe_failure_threshold must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `SHOPFLOOR_*` overrides from the given lookup.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("SHOPFLOOR_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(name) = lookup("SHOPFLOOR_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(url) = lookup("SHOPFLOOR_SERVER_URL") {
            debug!(url = %url, "Overriding server URL from environment");
            self.connection.server_url = url;
        }

        if let Some(attempts) = lookup("SHOPFLOOR_MAX_RECONNECT_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(n) => self.connection.max_reconnect_attempts = n,
                Err(_) => warn!(value = %attempts, "Ignoring invalid SHOPFLOOR_MAX_RECONNECT_ATTEMPTS"),
            }
        }

        if let Some(size) = lookup("SHOPFLOOR_BATCH_SIZE") {
            match size.parse::<usize>() {
                Ok(n) => self.dispatch.batch_size = n,
                Err(_) => warn!(value = %size, "Ignoring invalid SHOPFLOOR_BATCH_SIZE"),
            }
        }

        if let Some(endpoint) = lookup("SHOPFLOOR_HEALTH_ENDPOINT") {
            self.network.health_endpoint = Some(endpoint);
        }

        if let Some(strategy) = lookup("SHOPFLOOR_CONFLICT_STRATEGY") {
            match strategy.parse::<ResolutionStrategy>() {
                Ok(parsed) => {
                    debug!(strategy = %parsed, "Overriding conflict strategy from environment");
                    self.queue.conflict_strategy = parsed;
                }
                Err(_) => warn!(strategy = %strategy, "Unknown conflict strategy in environment"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "shopfloor", "link")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn server_url(&self) -> &str {
        &self.connection.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.dispatch.batch_size, 10);
        assert_eq!(config.queue.default_priority, 5);
        assert_eq!(config.queue.conflict_strategy, ResolutionStrategy::Manual);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        config.device.id = "tablet-1".to_string();
        config.connection.server_url = "http://mes.local/ws".to_string();
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.connection.server_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.connection.server_url = "wss://mes.local/ws".to_string();
        assert!(config.validate().is_ok());

        config.dispatch.batch_size = 0;
        assert!(config.validate().is_err());
        config.dispatch.batch_size = 10;

        config.connection.jitter_ratio = 1.5;
        assert!(config.validate().is_err());
        config.connection.jitter_ratio = 0.3;

        config.queue.default_priority = 11;
        assert!(matches!(config.validate(), Err(SyncError::Validation(_))));
    }

    #[test]
    fn test_presets_validate_and_differ() {
        for preset in [Preset::FactoryNetwork, Preset::Tablet, Preset::HighPerformance] {
            let config = SyncConfig::preset(preset);
            assert!(config.validate().is_ok(), "{} preset invalid", preset);
        }

        let factory = SyncConfig::factory_network();
        let wired = SyncConfig::high_performance();
        assert!(factory.connection.backoff_cap_ms > wired.connection.backoff_cap_ms);
        assert!(factory.connection.heartbeat_interval_ms > wired.connection.heartbeat_interval_ms);
        assert_eq!(factory.queue.conflict_strategy, wired.queue.conflict_strategy);
    }

    #[test]
    fn test_preset_parsing() {
        assert_eq!("factory_network".parse::<Preset>().unwrap(), Preset::FactoryNetwork);
        assert_eq!("high-performance".parse::<Preset>().unwrap(), Preset::HighPerformance);
        assert_eq!("TABLET".parse::<Preset>().unwrap(), Preset::Tablet);
        assert!("satellite".parse::<Preset>().is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("SHOPFLOOR_SERVER_URL", "wss://mes.plant.local/ws"),
            ("SHOPFLOOR_BATCH_SIZE", "25"),
            ("SHOPFLOOR_MAX_RECONNECT_ATTEMPTS", "many"),
            ("SHOPFLOOR_CONFLICT_STRATEGY", "server_wins"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.connection.server_url, "wss://mes.plant.local/ws");
        assert_eq!(config.dispatch.batch_size, 25);
        assert_eq!(config.connection.max_reconnect_attempts, 10);
        assert_eq!(config.queue.conflict_strategy, ResolutionStrategy::ServerWins);
    }

    #[test]
    fn test_stale_after_tracks_heartbeat() {
        let config = SyncConfig::high_performance();
        assert_eq!(
            config.connection.health_thresholds().stale_after,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_toml_round_trip_keeps_sections() {
        let config = SyncConfig::factory_network();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[connection]"));
        assert!(toml_str.contains("[dispatch]"));

        let parsed: SyncConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.dispatch.batch_size, 20);
        assert_eq!(parsed.device.id, config.device.id);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let parsed: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "line-3"

            [queue]
            conflict_strategy = "merge"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.device.name, "Floor Client");
        assert_eq!(parsed.queue.conflict_strategy, ResolutionStrategy::Merge);
        assert_eq!(parsed.connection.max_reconnect_attempts, 10);
    }
}
