//! Settings types. Every section deserializes with `#[serde(default)]` so a
//! partial JSON file only needs the keys it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DuetSettings {
    pub server: ServerSettings,
    pub room: RoomSettings,
    pub delivery: DeliverySettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

impl DuetSettings {
    /// Reject values that would stall the session loop or make the room
    /// unusable.
    pub fn validate(&self) -> Result<()> {
        if self.room.id.trim().is_empty() {
            return Err(SettingsError::InvalidValue("room.id is empty".into()));
        }
        if self.room.participants.len() != 2 {
            return Err(SettingsError::InvalidValue(format!(
                "room.participants must name exactly two users, got {}",
                self.room.participants.len()
            )));
        }
        if self.room.participants[0] == self.room.participants[1] {
            return Err(SettingsError::InvalidValue(
                "room.participants must be distinct".into(),
            ));
        }
        let d = &self.delivery;
        if d.cycle_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "delivery.cycleIntervalMs must be positive".into(),
            ));
        }
        for (name, every) in [
            ("presenceEvery", d.presence_every),
            ("typingEvery", d.typing_every),
            ("heartbeatEvery", d.heartbeat_every),
            ("presenceRefreshEvery", d.presence_refresh_every),
        ] {
            if every == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "delivery.{name} must be positive"
                )));
            }
        }
        if d.max_sessions_per_identity == 0 || d.push_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "delivery limits must be positive".into(),
            ));
        }
        if self.store.max_messages == 0 || self.store.cache_max_messages == 0 {
            return Err(SettingsError::InvalidValue(
                "store retention limits must be positive".into(),
            ));
        }
        if self.store.cache_sweep_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "store.cacheSweepIntervalMs must be positive".into(),
            ));
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.sqlite_path.is_empty() {
            return Err(SettingsError::InvalidValue(
                "store.sqlitePath is required for the sqlite backend".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Grace period for live sessions to drain on shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ServerSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// The private room and its two participants.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomSettings {
    pub id: String,
    pub participants: Vec<String>,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            id: "private".to_string(),
            participants: vec!["alice".to_string(), "bob".to_string()],
        }
    }
}

/// Live session cadence and admission limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    pub cycle_interval_ms: u64,
    /// Presence is checked every Nth cycle.
    pub presence_every: u32,
    pub typing_every: u32,
    pub heartbeat_every: u32,
    /// The session's own presence record is refreshed every Nth cycle.
    pub presence_refresh_every: u32,
    pub max_sessions_per_identity: usize,
    pub connect_cooldown_ms: u64,
    /// Retry hint for cap rejections (cooldown rejections use the time left).
    pub retry_after_ms: u64,
    /// Capacity of each session's outbound channel.
    pub push_buffer: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 500,
            presence_every: 4,
            typing_every: 2,
            heartbeat_every: 20,
            presence_refresh_every: 60,
            max_sessions_per_identity: 3,
            connect_cooldown_ms: 1_000,
            retry_after_ms: 2_000,
            push_buffer: 256,
        }
    }
}

impl DeliverySettings {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn connect_cooldown(&self) -> Duration {
        Duration::from_millis(self.connect_cooldown_ms)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Message retention, cache and TTL knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub sqlite_path: String,
    pub max_messages: usize,
    pub dedupe_window_ms: u64,
    pub cache_ttl_ms: u64,
    pub cache_max_messages: usize,
    pub cache_sweep_interval_ms: u64,
    pub presence_ttl_secs: u64,
    pub typing_ttl_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: "duet.db".to_string(),
            max_messages: 1_000,
            dedupe_window_ms: 1_000,
            cache_ttl_ms: 30_000,
            cache_max_messages: 50,
            cache_sweep_interval_ms: 60_000,
            presence_ttl_secs: 3_600,
            typing_ttl_ms: 5_000,
        }
    }
}

impl StoreSettings {
    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
