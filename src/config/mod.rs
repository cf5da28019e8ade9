//! Configuration module

use serde::Deserialize;

use crate::lock::LockPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub portal: PortalConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub devices: Vec<DeviceOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub client_key: String,
    pub portal: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_check_frequency")]
    pub check_frequency_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            check_frequency_secs: default_check_frequency(),
        }
    }
}

/// Per-device behavior override, keyed by the portal device id.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceOverride {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub policy: LockPolicy,
}

fn default_base_url() -> String {
    "https://api.winker.com.br/v1/".to_string()
}

fn default_check_frequency() -> u64 {
    crate::sync::DEFAULT_CHECK_FREQUENCY.as_secs()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("DOORSYNC").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
