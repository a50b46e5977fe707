//! Configuration
//!
//! Two files are involved: the static [`AppConfig`] read once at startup,
//! and the [`RootSettings`] document that the control plane rewrites
//! whenever sessions or their properties change.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::device::{DataFlow, Role};
use crate::error::{ConfigError, Error, Result};
use crate::protocol::permissions::Permissions;
use crate::shm::layout::MAX_CHANNELS;

/// Name of the configuration file inside the platform config directory
pub const CONFIG_FILE_NAME: &str = "capture-control.toml";

/// Name of the persisted settings file
pub const SETTINGS_FILE_NAME: &str = "settings.toml";

/// HTTP / WebSocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind_address: SocketAddr,
    /// Path prefix every request must start with
    pub prefix: String,
    /// Protocol endpoint, relative to `prefix`
    pub websocket_path: String,
    /// Static files served for every other path
    pub document_root: Option<PathBuf>,
    /// WebSocket subprotocol offered on upgrade
    pub subprotocol: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], crate::constants::DEFAULT_HTTP_PORT)),
            prefix: "/".to_string(),
            websocket_path: "ws".to_string(),
            document_root: None,
            subprotocol: "capture-control".to_string(),
        }
    }
}

impl ServerConfig {
    /// Prefix normalised to start and end with `/`
    pub fn normalized_prefix(&self) -> String {
        let trimmed = self.prefix.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        }
    }

    /// Absolute protocol path
    pub fn websocket_route(&self) -> String {
        format!(
            "{}{}",
            self.normalized_prefix(),
            self.websocket_path.trim_start_matches('/')
        )
    }
}

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Capture worker executable
    pub executable: PathBuf,
    /// Arguments placed before the verb, for wrappers such as an emulator
    pub arguments: Vec<String>,
    /// Prefix of every shared memory name
    pub shm_prefix: String,
    /// Handle passed as `lifetime` so the worker exits with the controller
    pub lifetime_handle: Option<u32>,
    /// Attempts at getting a non-empty device list
    pub device_list_retries: u32,
    pub restart_delay_ms: u64,
    pub graceful_stop_timeout_ms: u64,
    /// Lines kept in each session's console
    pub console_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("capture-worker"),
            arguments: Vec::new(),
            shm_prefix: "capture-control".to_string(),
            lifetime_handle: None,
            device_list_retries: 3,
            restart_delay_ms: 1000,
            graceful_stop_timeout_ms: 5000,
            console_capacity: 20,
        }
    }
}

/// Event loop timer periods
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub cursor_interval_ms: u64,
    pub save_interval_ms: u64,
    /// 0 disables periodic device refresh
    pub device_refresh_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5,
            cursor_interval_ms: 1000,
            save_interval_ms: 3000,
            device_refresh_interval_ms: 10_000,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub timing: TimingConfig,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_filter: Option<String>,
    /// Persisted settings location, defaults next to the config file
    pub settings_path: Option<PathBuf>,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "capture-control")
}

impl AppConfig {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf> {
        project_dirs()
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .ok_or_else(|| ConfigError::NoConfigDir.into())
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|source| {
                ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                }
                .into()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Where [`RootSettings`] are stored for a config loaded from `config_path`
    pub fn resolve_settings_path(&self, config_path: &Path) -> PathBuf {
        self.settings_path.clone().unwrap_or_else(|| {
            config_path
                .parent()
                .map(|dir| dir.join(SETTINGS_FILE_NAME))
                .unwrap_or_else(|| PathBuf::from(SETTINGS_FILE_NAME))
        })
    }
}

/// Capture source selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct SourceSettings {
    /// Specific endpoint; `None` follows the default device for `flow`/`role`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    pub flow: DataFlow,
    pub role: Role,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            id: None,
            friendly_name: None,
            flow: DataFlow::Render,
            role: Role::Console,
        }
    }
}

/// Local playback sink selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LocalSinkSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    pub role: Role,
}

/// Network sink addresses; unset fields fall back to the root defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct NetworkSinkSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_service: Option<String>,
}

impl NetworkSinkSettings {
    /// Field-by-field merge with `defaults`
    pub fn merged_with(&self, defaults: &NetworkSinkSettings) -> NetworkSinkSettings {
        NetworkSinkSettings {
            bind_address: self.bind_address.clone().or_else(|| defaults.bind_address.clone()),
            peer_address: self.peer_address.clone().or_else(|| defaults.peer_address.clone()),
            peer_service: self.peer_service.clone().or_else(|| defaults.peer_service.clone()),
        }
    }
}

fn default_channel_volumes() -> Vec<f64> {
    vec![1.0; MAX_CHANNELS]
}

/// Persisted state of one capture session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub id: Uuid,
    pub sample_rate: Option<u32>,
    /// Requested channel mask, 0 for the worker default
    pub channels: u32,
    pub source: SourceSettings,
    pub local_sink: Option<LocalSinkSettings>,
    pub network_sink: Option<NetworkSinkSettings>,
    /// 0xRRGGBB
    pub color: u32,
    pub max_master_volume: f64,
    pub master_volume: f64,
    pub muted: bool,
    /// Mute state remembered while the root mute is engaged
    pub saved_muted: Option<bool>,
    pub channel_volumes: Vec<f64>,
    pub saturation_threshold: f64,
    pub silence_threshold: f64,
    pub averaging_weight: f64,
    pub saturation_debounce_factor: f64,
    pub saturation_recovery_factor: f64,
    /// Restart requested on the next `restart_pending` pass; never persisted
    #[serde(skip)]
    pub restart_pending: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            sample_rate: None,
            channels: 0,
            source: SourceSettings::default(),
            local_sink: None,
            network_sink: None,
            color: 0xFF_FF_FF,
            max_master_volume: 1.0,
            master_volume: 1.0,
            muted: false,
            saved_muted: None,
            channel_volumes: default_channel_volumes(),
            saturation_threshold: f64::INFINITY,
            silence_threshold: 0.0,
            averaging_weight: 0.0,
            saturation_debounce_factor: 1.0,
            saturation_recovery_factor: f64::INFINITY,
            restart_pending: false,
        }
    }
}

impl SessionSettings {
    /// Fresh settings with a new persistent id
    pub fn create_new() -> Self {
        Self {
            id: Uuid::new_v4(),
            ..Self::default()
        }
    }

    /// Stored gain for a channel slot (1.0 when the slot is missing)
    pub fn channel_volume(&self, index: usize) -> f64 {
        self.channel_volumes.get(index).copied().unwrap_or(1.0)
    }

    pub fn set_channel_volume(&mut self, index: usize, value: f64) {
        if self.channel_volumes.len() < MAX_CHANNELS {
            self.channel_volumes.resize(MAX_CHANNELS, 1.0);
        }
        if let Some(slot) = self.channel_volumes.get_mut(index) {
            *slot = value;
        }
    }
}

/// Protocol security settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    /// Shared secret unlocking the authenticated tier
    pub secret: Option<String>,
    pub global_permissions: Permissions,
    pub network_permissions: Permissions,
    pub unauthenticated_permissions: Permissions,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            secret: None,
            global_permissions: Permissions::ALL,
            network_permissions: Permissions::READ | Permissions::WRITE_PROPERTIES,
            unauthenticated_permissions: Permissions::READ | Permissions::TAP_STREAM,
        }
    }
}

/// Root persisted document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootSettings {
    pub network_sink_defaults: NetworkSinkSettings,
    pub websocket: WebSocketSettings,
    pub sessions: Vec<SessionSettings>,
}

/// Reads and writes [`RootSettings`]
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document; a missing file yields empty settings
    pub fn load(&self) -> Result<RootSettings> {
        match fs::read_to_string(&self.path) {
            Ok(text) => toml::from_str(&text).map_err(|source| {
                ConfigError::Parse {
                    path: self.path.display().to_string(),
                    source,
                }
                .into()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RootSettings::default()),
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Write through a temporary file so a crash never leaves a torn document
    pub fn save(&self, settings: &RootSettings) -> Result<()> {
        let text = toml::to_string_pretty(settings).map_err(ConfigError::from)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
