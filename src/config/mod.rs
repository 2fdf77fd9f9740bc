//! Configuration management
//!
//! Settings come from an optional TOML file overlaid with `YAKPHONE_*`
//! environment variables, nested keys separated by `__`
//! (`YAKPHONE_ACCOUNT__PASSWORD=...`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    pub account: AccountConfig,
    pub network: NetworkConfig,
    pub timers: TimersConfig,
    pub media: MediaConfig,
    pub log_level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub domain: String,
    pub username: String,
    pub password: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local address of the SIP socket
    pub bind_address: SocketAddr,
    /// Registrar address, skips DNS when set
    pub sip_server: Option<SocketAddr>,
    /// STUN server address, skips DNS when set
    pub stun_server: Option<SocketAddr>,
    /// Look up a STUN server for the domain when none is configured
    pub use_stun: bool,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
    pub stun_retry_ms: u64,
    pub stun_refresh_ms: u64,
    pub connect_retry_secs: u64,
    pub register_expires_secs: u32,
    pub register_margin_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ptime_ms: u32,
    /// Jitter buffer low watermark, in frames
    pub min_frames: usize,
    /// Jitter buffer high watermark, in frames
    pub max_frames: usize,
    /// Interval between audio pumps
    pub audio_tick_ms: u64,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            account: AccountConfig::default(),
            network: NetworkConfig::default(),
            timers: TimersConfig::default(),
            media: MediaConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            sip_server: None,
            stun_server: None,
            use_stun: true,
            user_agent: format!("yakphone/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4000,
            t4_ms: 5000,
            stun_retry_ms: 500,
            stun_refresh_ms: 30_000,
            connect_retry_secs: 60,
            register_expires_secs: 120,
            register_margin_secs: 10,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ptime_ms: 20,
            min_frames: 5,
            max_frames: 15,
            audio_tick_ms: 20,
        }
    }
}

impl PhoneConfig {
    /// Load from `path` (if it exists) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder
            .add_source(
                config::Environment::with_prefix("YAKPHONE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
