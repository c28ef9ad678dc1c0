//! Event configuration schema and loader
//!
//! The whole event is described by one TOML file: server settings, admission
//! tuning, the fixed sector/room layout and the guide accounts.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default listening port
pub const DEFAULT_PORT: u16 = 9999;

/// Event configuration loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    pub event: EventMeta,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub admission: AdmissionSection,
    #[serde(default)]
    pub sectors: Vec<SectorConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Event metadata section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub name: String,
}

/// Network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connections beyond this are refused
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Capacity of each connection's inbound and outbound queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Admission engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSection {
    /// Unanswered grouping proposals count as declined after this long
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
    /// How often expired rounds are swept
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Penalty level at which new tickets are refused (unset = never)
    #[serde(default)]
    pub max_penalty_level: Option<u32>,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            pending_timeout_secs: default_pending_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_penalty_level: None,
        }
    }
}

impl AdmissionSection {
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Sector definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectorConfig {
    /// Stable id; generated when omitted
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rooms: Vec<RoomConfig>,
}

/// Room definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
    pub capacity: usize,
}

/// Guide login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    /// Argon2 PHC string
    pub password_hash: String,
    /// Accounts naming the same group lead the same tour group
    #[serde(default)]
    pub group: Option<String>,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_sessions() -> usize {
    256
}

fn default_queue_capacity() -> usize {
    64
}

fn default_pending_timeout_secs() -> u64 {
    60
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl EventConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate config from TOML content
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: EventConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check names and id uniqueness
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event.name.trim().is_empty() {
            return Err(ConfigError::Invalid("event name is empty".into()));
        }

        let mut ids = HashSet::new();
        for sector in &self.sectors {
            if sector.name.trim().is_empty() {
                return Err(ConfigError::Invalid("sector with empty name".into()));
            }
            if let Some(id) = sector.id {
                if !ids.insert(id) {
                    return Err(ConfigError::Invalid(format!("duplicate id {}", id)));
                }
            }
            for room in &sector.rooms {
                if room.name.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "room with empty name in sector '{}'",
                        sector.name
                    )));
                }
                if let Some(id) = room.id {
                    if !ids.insert(id) {
                        return Err(ConfigError::Invalid(format!("duplicate id {}", id)));
                    }
                }
            }
        }

        let mut usernames = HashSet::new();
        for account in &self.accounts {
            if account.username.trim().is_empty() {
                return Err(ConfigError::Invalid("account with empty username".into()));
            }
            if !usernames.insert(account.username.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate account '{}'",
                    account.username
                )));
            }
        }

        if self.admission.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweep_interval_ms must be positive".into()));
        }

        Ok(())
    }
}
