use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;

/// Baud rate used when nothing else selects one (first picklist entry)
pub const DEFAULT_BAUD: u32 = 9600;

pub const ENV_PORT: &str = "ACTUATOR_PORT";
pub const ENV_BAUD: &str = "ACTUATOR_BAUD";

/// One block of connection settings. Every key is optional so blocks can be layered.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct HostSettings {
    #[serde(rename = "PORT")]
    pub port: Option<String>,
    #[serde(rename = "BAUD_RATE")]
    pub baud_rate: Option<u32>,
    #[serde(rename = "TRANSCRIPT")]
    pub transcript: Option<PathBuf>,
}

impl HostSettings {
    /// Keys set in `self` win; unset keys fall through to `base`.
    pub fn over(self, base: HostSettings) -> HostSettings {
        HostSettings {
            port: self.port.or(base.port),
            baud_rate: self.baud_rate.or(base.baud_rate),
            transcript: self.transcript.or(base.transcript),
        }
    }

    pub fn baud_or_default(&self) -> u32 {
        self.baud_rate.unwrap_or(DEFAULT_BAUD)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ActuatorConfig {
    pub default: Option<HostSettings>,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostSettings>, // hostname -> settings
}

impl ActuatorConfig {
    /// Settings for `hostname`, layered over the `default` block.
    pub fn host_settings(&self, hostname: &str) -> HostSettings {
        let base = self.default.clone().unwrap_or_default();
        match self.hosts.get(hostname) {
            Some(host) => host.clone().over(base),
            None => {
                log::debug!(target: "config_loader", "No host block for '{}', using default block", hostname);
                base
            }
        }
    }
}

/// actuator.yaml lives next to Cargo.toml
pub fn default_config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("actuator.yaml")
}

pub fn parse_config(yaml: &str) -> Result<ActuatorConfig> {
    // An empty document deserializes to unit, not a mapping
    if yaml.trim().is_empty() {
        return Ok(ActuatorConfig::default());
    }
    let config: ActuatorConfig = serde_yaml::from_str(yaml)?;
    Ok(config)
}

/// Load the YAML config. A missing file yields empty settings; a malformed one is an error.
pub fn load_config(path: &Path) -> Result<ActuatorConfig> {
    if !path.exists() {
        log::info!(target: "config_loader", "No config at {:?}; using built-in defaults", path);
        return Ok(ActuatorConfig::default());
    }
    let file = File::open(path)
        .map_err(|e| anyhow!("Failed to open config at {:?}: {}", path, e))?;
    let config: ActuatorConfig = serde_yaml::from_reader(file)
        .with_context(|| format!("Invalid config file {:?}", path))?;
    Ok(config)
}

/// Overrides from `ACTUATOR_PORT` / `ACTUATOR_BAUD`, loading `.env` first.
pub fn env_overrides() -> Result<HostSettings> {
    let _ = dotenv();
    overrides_from(|key| env::var(key).ok())
}

fn overrides_from(lookup: impl Fn(&str) -> Option<String>) -> Result<HostSettings> {
    let port = lookup(ENV_PORT).filter(|p| !p.trim().is_empty());
    let baud_rate = match lookup(ENV_BAUD) {
        Some(raw) => Some(
            raw.trim()
                .parse::<u32>()
                .map_err(|e| anyhow!("{} must be an integer, got '{}': {}", ENV_BAUD, raw, e))?,
        ),
        None => None,
    };
    Ok(HostSettings { port, baud_rate, transcript: None })
}

/// Environment over the host block over the default block.
pub fn resolve_settings(path: &Path, hostname: &str) -> Result<HostSettings> {
    let from_file = load_config(path)?.host_settings(hostname);
    let settings = env_overrides()?.over(from_file);
    log::info!(
        target: "config_loader",
        "Settings for {}: port={:?}, baud={}",
        hostname,
        settings.port,
        settings.baud_or_default()
    );
    Ok(settings)
}
