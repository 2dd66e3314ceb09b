use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{CaptureConfig, CaptureConstraints};
use crate::streaming::ConnectionConfig;

const APP_DIR_NAME: &str = "speaking-test";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Upper bounds applied when projecting settings into runtime configs
const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 3600;
const MAX_RECONNECT_BASE_DELAY_MS: u64 = 60_000;
const MAX_CHUNK_DURATION_MS: u32 = 60_000;
const MAX_RECONNECT_BUFFER_SECS: f32 = 300.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Base URL of the request/response API (sessions, tasks, uploads, scores).
    pub api_base_url: String,

    /// Live stream endpoint. A session may override it at creation time.
    pub stream_url: String,

    /// How long `connect()` waits for the handshake reply.
    pub handshake_timeout_secs: u64,

    pub heartbeat_interval_secs: u64,

    /// First reconnect delay; doubles on every attempt.
    pub reconnect_base_delay_ms: u64,

    pub max_reconnect_attempts: u32,

    pub chunk_duration_ms: u32,

    pub target_sample_rate: u32,

    /// Seconds of audio held while the stream reconnects. 0 drops chunks instead.
    pub reconnect_buffer_secs: f32,

    pub http_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            stream_url: "ws://localhost:8000/ws".to_string(),
            handshake_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
            chunk_duration_ms: 1000,
            target_sample_rate: 16000,
            reconnect_buffer_secs: 10.0,
            http_timeout_secs: 60,
        }
    }
}

impl ClientSettings {
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.stream_url.clone(),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            heartbeat_interval: Duration::from_secs(
                self.heartbeat_interval_secs.clamp(1, MAX_HEARTBEAT_INTERVAL_SECS),
            ),
            reconnect_base_delay: Duration::from_millis(
                self.reconnect_base_delay_ms.min(MAX_RECONNECT_BASE_DELAY_MS),
            ),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            constraints: CaptureConstraints {
                sample_rate: self.target_sample_rate,
                ..CaptureConstraints::default()
            },
            chunk_duration_ms: self.chunk_duration_ms.min(MAX_CHUNK_DURATION_MS),
            reconnect_buffer_secs: clamp_buffer_secs(self.reconnect_buffer_secs),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Apply `SPEAKING_TEST_*` environment variables on top of the file values
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("SPEAKING_TEST_API_URL") {
            self.api_base_url = url;
        }
        if let Some(url) = lookup("SPEAKING_TEST_STREAM_URL") {
            self.stream_url = url;
        }
        if let Some(value) = lookup("SPEAKING_TEST_RECONNECT_BUFFER_SECS") {
            match value.parse::<f32>() {
                Ok(secs) if secs >= 0.0 => self.reconnect_buffer_secs = secs,
                _ => log::warn!(
                    "Settings: ignoring invalid SPEAKING_TEST_RECONNECT_BUFFER_SECS={:?}",
                    value
                ),
            }
        }
    }
}

fn clamp_buffer_secs(secs: f32) -> f32 {
    if secs.is_nan() || secs <= 0.0 {
        0.0
    } else {
        secs.min(MAX_RECONNECT_BUFFER_SECS)
    }
}

/// `<config dir>/speaking-test/settings.json`
pub fn default_settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings, falling back to defaults when the file is missing or bad
pub fn load_settings(path: &Path) -> ClientSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ClientSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ClientSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ClientSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ClientSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &ClientSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
