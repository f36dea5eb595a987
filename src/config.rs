//! # Configuration Management
//!
//! Loads and manages application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_PLAYBACK__MIN_BUFFER_CHUNKS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore in environment variables because the
//! field names themselves contain single underscores.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
///
/// ## Why separate config structs:
/// The server, the playback engine, the rendering device and the session
/// limits are tuned independently, so each gets its own section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub playback: PlaybackConfig,
    pub device: DeviceConfig,
    pub performance: PerformanceConfig,
}

/// Where the HTTP/WebSocket server listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Tuning for the streaming playback engine.
///
/// ## Fields:
/// - `sample_rate`: rate of the incoming 16-bit mono PCM (Hz)
/// - `min_buffer_chunks`: fragments to collect before the first unit of a
///   turn is scheduled (absorbs network jitter)
/// - `drain_poll_interval_ms`: how often a completion handshake re-checks
///   for silence
/// - `quiescence_delay_ms`: grace period before the first drain check
/// - `ledger_capacity`: how many notified context ids are remembered
/// - `drained_event_name`: outbound event type sent once a turn has drained
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub min_buffer_chunks: usize,
    pub drain_poll_interval_ms: u64,
    pub quiescence_delay_ms: u64,
    pub ledger_capacity: usize,
    pub drained_event_name: String,
}

impl PlaybackConfig {
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn quiescence_delay(&self) -> Duration {
        Duration::from_millis(self.quiescence_delay_ms)
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,        // TTS output rate
            min_buffer_chunks: 2,
            drain_poll_interval_ms: 100,
            quiescence_delay_ms: 200,
            ledger_capacity: 10,
            drained_event_name: "playback-drained".to_string(),
        }
    }
}

/// Which rendering device backs each session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Clocked, silent device; keeps exact timing without audio hardware
    Virtual,
    /// Default output device through cpal (requires the `speaker` feature)
    Speaker,
}

impl std::str::FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "virtual" | "null" => Ok(DeviceKind::Virtual),
            "speaker" | "cpal" => Ok(DeviceKind::Speaker),
            _ => Err(format!("Unknown device kind: {}", s)),
        }
    }
}

/// Rendering device settings.
///
/// `start_suspended` mirrors browsers, where an output context starts
/// suspended until it is explicitly resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub start_suspended: bool,
}

/// Session limits and connection liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            playback: PlaybackConfig::default(),
            device: DeviceConfig {
                kind: DeviceKind::Virtual,
                start_suspended: false,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                heartbeat_interval_secs: 30,
                heartbeat_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_PLAYBACK__DRAINED_EVENT_NAME=ai-audio-done`
    /// - `APP_DEVICE__KIND=speaker`
    /// - `PORT=3000`: special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.playback.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if self.playback.ledger_capacity == 0 {
            return Err(anyhow::anyhow!("Ledger capacity must be greater than 0"));
        }

        if self.playback.drain_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Drain poll interval must be greater than 0"));
        }

        if self.playback.drained_event_name.trim().is_empty() {
            return Err(anyhow::anyhow!("Drained event name cannot be empty"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.heartbeat_timeout_secs <= self.performance.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Heartbeat timeout must be longer than the heartbeat interval"
            ));
        }

        Ok(())
    }

    /// Apply a partial JSON update (used by `PUT /api/v1/config`).
    ///
    /// Only the fields present in the JSON are changed, so
    /// `{"playback": {"min_buffer_chunks": 3}}` touches nothing else.
    /// Sessions already running keep the settings they started with.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Port {} is out of range", port))?;
            }
        }

        if let Some(playback) = partial_config.get("playback") {
            if let Some(rate) = playback.get("sample_rate").and_then(|v| v.as_u64()) {
                self.playback.sample_rate = u32::try_from(rate)
                    .map_err(|_| anyhow::anyhow!("Sample rate {} is out of range", rate))?;
            }
            if let Some(chunks) = playback.get("min_buffer_chunks").and_then(|v| v.as_u64()) {
                self.playback.min_buffer_chunks = usize::try_from(chunks)
                    .map_err(|_| anyhow::anyhow!("Min buffer chunks {} is out of range", chunks))?;
            }
            if let Some(interval) = playback.get("drain_poll_interval_ms").and_then(|v| v.as_u64()) {
                self.playback.drain_poll_interval_ms = interval;
            }
            if let Some(delay) = playback.get("quiescence_delay_ms").and_then(|v| v.as_u64()) {
                self.playback.quiescence_delay_ms = delay;
            }
            if let Some(capacity) = playback.get("ledger_capacity").and_then(|v| v.as_u64()) {
                self.playback.ledger_capacity = usize::try_from(capacity)
                    .map_err(|_| anyhow::anyhow!("Ledger capacity {} is out of range", capacity))?;
            }
            if let Some(name) = playback.get("drained_event_name").and_then(|v| v.as_str()) {
                self.playback.drained_event_name = name.to_string();
            }
        }

        if let Some(device) = partial_config.get("device") {
            if let Some(kind) = device.get("kind").and_then(|v| v.as_str()) {
                self.device.kind = kind.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            }
            if let Some(suspended) = device.get("start_suspended").and_then(|v| v.as_bool()) {
                self.device.start_suspended = suspended;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = usize::try_from(sessions)
                    .map_err(|_| anyhow::anyhow!("Max concurrent sessions {} is out of range", sessions))?;
            }
            if let Some(interval) = performance.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                self.performance.heartbeat_interval_secs = interval;
            }
            if let Some(timeout) = performance.get("heartbeat_timeout_secs").and_then(|v| v.as_u64()) {
                self.performance.heartbeat_timeout_secs = timeout;
            }
        }

        self.validate()?;
        Ok(())
    }
}
