use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, VirtError};

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/virt")
}

fn default_true() -> bool {
    true
}

/// Driver configuration, loaded from a TOML file by the binary or handed in
/// directly by an embedding agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory holding generated disks and cloud-init ISOs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directories task images are allowed to come from.
    #[serde(default)]
    pub image_paths: Vec<PathBuf>,

    /// Remove generated config files (cloud-init ISO, disk overlay) when a
    /// VM is destroyed. Operators keeping them for post-mortems set this to
    /// false.
    #[serde(default = "default_true")]
    pub remove_config_files: bool,

    #[serde(default)]
    pub emulator: EmulatorConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            image_paths: Vec::new(),
            remove_config_files: true,
            emulator: EmulatorConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

/// Connection settings for the hypervisor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmulatorConfig {
    /// Hypervisor URI, e.g. `qemu:///system`.
    pub uri: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub libvirt: LibvirtProviderConfig,
    #[serde(default)]
    pub cloud_hypervisor: CloudHypervisorProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibvirtProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Nominate this provider as the default dispenser.
    #[serde(default)]
    pub default: bool,
}

impl Default for LibvirtProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudHypervisorProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub default: bool,
    /// Guest firmware image booted by cloud-hypervisor.
    pub firmware: Option<PathBuf>,
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| VirtError::Validation(vec![format!("config parse error: {e}")]))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }
}
