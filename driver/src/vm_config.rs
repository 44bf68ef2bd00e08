use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VirtError};

/// Smallest VM the driver will build.
pub const MIN_MEMORY_MB: u64 = 500;
pub const MIN_CPUS: u32 = 1;
pub const MIN_DISK_MB: u64 = 2000;

/// RFC 1123 label limit; also the libvirt domain name limit we enforce.
pub const MAX_NAME_LEN: usize = 63;

/// Number of trailing task-id characters used as the VM name.
pub const VM_NAME_SUFFIX_LEN: usize = 8;

/// Task definition as handed over by the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub memory_mb: u64,
    pub cpus: u32,
    #[serde(default)]
    pub cpuset: Option<String>,

    pub alloc_dir: PathBuf,
    pub local_dir: PathBuf,
    pub secrets_dir: PathBuf,

    pub image: PathBuf,
    #[serde(default)]
    pub primary_disk_size: u64,
    #[serde(default)]
    pub use_thin_copy: bool,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub os: Option<OsVariant>,
    #[serde(default)]
    pub cmds: Vec<String>,
    #[serde(default)]
    pub boot_cmds: Vec<String>,
    #[serde(default)]
    pub default_user_password: Option<String>,
    #[serde(default)]
    pub default_user_authorized_ssh_key: Option<String>,
    /// Literal cloud-init user data, or an absolute path to a file with it.
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub network_interface: Option<NetworkInterfaceConfig>,
    /// Reserved ports, keyed by the labels referenced in the bridge config.
    #[serde(default)]
    pub ports: HashMap<String, PortMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsVariant {
    pub arch: String,
    pub machine: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    pub source: PathBuf,
    pub tag: String,
    pub destination: String,
    #[serde(default)]
    pub read_only: bool,
}

/// A file materialized inside the guest at first boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestFile {
    pub path: String,
    pub content: String,
    pub permissions: String,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

/// Backing image behind a copy-on-write overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackingStore {
    pub path: PathBuf,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterfaceConfig {
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Host bridge device, e.g. `virbr0`.
    pub name: String,
    /// Port labels resolved against the task's reserved ports.
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_ip: IpAddr,
    pub host_port: u16,
    pub container_port: u16,
}

/// Normalized VM description consumed by a provider. Built by the driver
/// facade from a [`TaskConfig`], validated, then discarded after `create_vm`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub memory_mb: u64,
    pub cpus: u32,
    #[serde(default)]
    pub cpuset: Option<String>,

    /// Disk the domain boots from: the resolved base image, or the
    /// copy-on-write overlay when thin-cloned.
    pub primary_disk: PathBuf,
    pub primary_disk_mb: u64,
    /// Probed (or post-clone) disk format tag, e.g. `qcow2`.
    pub disk_format: String,
    /// Backing image behind `primary_disk`, present when thin-cloned.
    #[serde(default)]
    pub backing: Option<BackingStore>,

    #[serde(default)]
    pub os: Option<OsVariant>,
    pub hostname: String,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    #[serde(default)]
    pub files: Vec<GuestFile>,
    #[serde(default)]
    pub boot_cmds: Vec<String>,
    #[serde(default)]
    pub run_cmds: Vec<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub default_user_password: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<String>,

    #[serde(default)]
    pub network_interface: Option<NetworkInterfaceConfig>,

    /// Raw domain description override; skips the shaper entirely.
    #[serde(default)]
    pub domain_xml: Option<String>,
    /// Remove generated config files (the cloud-init ISO) when the VM goes.
    #[serde(default)]
    pub remove_config_files: bool,
}

impl VmConfig {
    /// Check the config against the driver's minimums and the operator's
    /// allowed image paths. All independent problems are reported together.
    pub fn validate(&self, allowed_paths: &[PathBuf]) -> Result<()> {
        let mut errs = Vec::new();

        if self.name.is_empty() {
            errs.push("name is required".to_string());
        } else if !valid_label(&self.name) {
            errs.push(format!(
                "name {:?} is not a valid RFC 1123 label of at most {MAX_NAME_LEN} characters",
                self.name
            ));
        }

        if self.primary_disk.as_os_str().is_empty() {
            errs.push("image is required".to_string());
        } else if !path_allowed(&self.primary_disk, allowed_paths) {
            errs.push(format!(
                "image {:?} is outside the allowed paths",
                self.primary_disk
            ));
        }

        if self.memory_mb < MIN_MEMORY_MB {
            errs.push(format!(
                "memory {}MB is below the minimum of {MIN_MEMORY_MB}MB",
                self.memory_mb
            ));
        }
        if self.cpus < MIN_CPUS {
            errs.push(format!("at least {MIN_CPUS} cpu is required"));
        }
        if self.primary_disk_mb < MIN_DISK_MB {
            errs.push(format!(
                "primary disk {}MB is below the minimum of {MIN_DISK_MB}MB",
                self.primary_disk_mb
            ));
        }

        if let Some(os) = &self.os {
            if os.arch.is_empty() || os.machine.is_empty() {
                errs.push("os variant requires both arch and machine".to_string());
            }
        }

        if !valid_label(&self.hostname) {
            errs.push(format!("hostname {:?} is not a valid label", self.hostname));
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(VirtError::Validation(errs))
        }
    }
}

/// Derive the stable VM name from a task id: its last 8 characters.
pub fn vm_name_for_task(task_id: &str) -> String {
    let chars: Vec<char> = task_id.chars().collect();
    let start = chars.len().saturating_sub(VM_NAME_SUFFIX_LEN);
    chars[start..].iter().collect()
}

/// RFC 1123 label: alphanumeric start and end, alphanumeric or `-` inside,
/// at most 63 characters.
pub fn valid_label(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_NAME_LEN {
        return false;
    }
    let bytes = s.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

/// Prefix check against the allow-list. Both sides are canonicalized so a
/// symlinked prefix (or image path) cannot dodge or spuriously fail the
/// containment test; paths that do not exist fall back to textual form.
fn path_allowed(path: &Path, allowed: &[PathBuf]) -> bool {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    allowed.iter().any(|prefix| {
        let prefix = prefix
            .canonicalize()
            .unwrap_or_else(|_| prefix.to_path_buf());
        path.starts_with(prefix)
    })
}
