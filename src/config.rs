// Client configuration: backend location, session token and preferences.
// Stored as pretty JSON under the platform config directory; environment
// variables override what is on disk.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::ReconnectPolicy;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:5000";

pub const ENV_SERVER: &str = "SPECTRE_SERVER";
pub const ENV_SOCKET: &str = "SPECTRE_SOCKET";
pub const ENV_TOKEN: &str = "SPECTRE_TOKEN";

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_typing_timeout_ms() -> u64 {
    2000
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Realtime endpoint; derived from `server_url` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_url: Option<String>,
    // base64 at rest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
    #[serde(default)]
    pub sound_enabled: bool,
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_url: default_server_url(),
            socket_url: None,
            auth_token: None,
            sound_enabled: false,
            typing_timeout_ms: default_typing_timeout_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: &str) -> Self {
        ClientConfig {
            server_url: server_url.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    pub fn set_auth_token(&mut self, token: Option<&str>) {
        self.auth_token = token.map(|t| BASE64.encode(t));
    }

    pub fn auth_token(&self) -> Option<String> {
        let encoded = self.auth_token.as_ref()?;
        match BASE64.decode(encoded).map(String::from_utf8) {
            Ok(Ok(token)) => Some(token),
            _ => {
                warn!("Stored auth token is not valid base64, ignoring it");
                None
            }
        }
    }

    /// The realtime endpoint: the configured one, or the server URL with its
    /// scheme swapped to ws/wss.
    pub fn socket_url(&self) -> String {
        if let Some(url) = &self.socket_url {
            return url.clone();
        }
        derive_socket_url(&self.server_url)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
        }
    }

    /// Apply `SPECTRE_SERVER`, `SPECTRE_SOCKET` and `SPECTRE_TOKEN`.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(server) = lookup(ENV_SERVER).filter(|v| !v.is_empty()) {
            debug!("Server URL overridden from environment");
            self.server_url = server.trim_end_matches('/').to_string();
        }
        if let Some(socket) = lookup(ENV_SOCKET).filter(|v| !v.is_empty()) {
            self.socket_url = Some(socket);
        }
        if let Some(token) = lookup(ENV_TOKEN).filter(|v| !v.is_empty()) {
            self.set_auth_token(Some(&token));
        }
    }
}

pub fn derive_socket_url(server_url: &str) -> String {
    let trimmed = server_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_string()
    }
}

/// Use `path` instead of the default config file. Only the first call wins.
pub fn set_config_path_override(path: PathBuf) -> bool {
    CONFIG_PATH_OVERRIDE.set(path).is_ok()
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("spectre-chat");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("config.json"))
}

pub fn save_config_to(path: &Path, config: &ClientConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;

    info!("Configuration saved to {}", path.display());
    Ok(())
}

pub fn load_config_from(path: &Path) -> Result<Option<ClientConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)?;
    let config: ClientConfig = serde_json::from_str(&contents)
        .map_err(|e| anyhow!("Invalid configuration in {}: {}", path.display(), e))?;
    info!("Loaded configuration for {} from {}", config.server_url, path.display());

    Ok(Some(config))
}

pub fn save_config(config: &ClientConfig) -> Result<()> {
    save_config_to(&get_config_path()?, config)
}

/// Load the stored configuration (or defaults) with environment overrides applied.
pub fn load_config() -> Result<ClientConfig> {
    let mut config = load_config_from(&get_config_path()?)?.unwrap_or_default();
    config.apply_env();
    Ok(config)
}
