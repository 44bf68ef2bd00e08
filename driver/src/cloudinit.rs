use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::process::Command;

use crate::error::{Result, VirtError};
use crate::vm_config::{GuestFile, MountConfig};

/// Volume label the in-guest first-boot agent looks for.
pub const VOLUME_LABEL: &str = "cidata";

/// Characters rejected in guest file basenames, besides ASCII control codes.
const FORBIDDEN_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Everything that goes onto the first-boot ISO.
#[derive(Debug, Clone, Default)]
pub struct CloudInitConfig {
    pub instance_id: String,
    pub hostname: String,
    /// Literal user data, or an absolute path to a file holding it.
    pub user_data: Option<String>,
    pub vendor: VendorData,
}

#[derive(Debug, Clone, Default)]
pub struct VendorData {
    pub password: Option<String>,
    pub ssh_key: Option<String>,
    pub boot_cmds: Vec<String>,
    pub run_cmds: Vec<String>,
    pub mounts: Vec<MountConfig>,
    pub files: Vec<GuestFile>,
}

impl CloudInitConfig {
    /// First-boot payload for a VM: identity from the VM name and hostname,
    /// everything else from the task's guest-facing settings.
    pub fn from_vm_config(config: &crate::vm_config::VmConfig) -> Self {
        Self {
            instance_id: config.name.clone(),
            hostname: config.hostname.clone(),
            user_data: config.user_data.clone(),
            vendor: VendorData {
                password: config.default_user_password.clone(),
                ssh_key: config.ssh_key.clone(),
                boot_cmds: config.boot_cmds.clone(),
                run_cmds: config.run_cmds.clone(),
                mounts: config.mounts.clone(),
                files: config.files.clone(),
            },
        }
    }
}

/// Rendered `#cloud-config` vendor-data document.
#[derive(Debug, Default, Serialize)]
struct CloudConfigDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chpasswd: Option<Chpasswd>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ssh_pwauth: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bootcmd: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    runcmd: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    write_files: Vec<WriteFile>,
}

#[derive(Debug, Serialize)]
struct Chpasswd {
    expire: bool,
}

#[derive(Debug, Serialize)]
struct WriteFile {
    path: String,
    content: String,
    permissions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
}

/// Builds cloud-init ISOs with `genisoimage`.
pub struct IsoBuilder {
    genisoimage: PathBuf,
}

impl IsoBuilder {
    pub fn new() -> Result<Self> {
        let genisoimage = which::which("genisoimage")
            .map_err(|e| VirtError::CloudInit(format!("genisoimage not found: {e}")))?;
        Ok(Self { genisoimage })
    }

    /// Builder that skips tool discovery; only for tests that never pack.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            genisoimage: PathBuf::from("genisoimage"),
        }
    }

    /// Write the first-boot ISO for `config` at `iso_path`.
    ///
    /// The volume is ISO-9660 with Rock Ridge extensions, labeled `cidata`,
    /// and contains exactly `/meta-data`, `/user-data` and `/vendor-data`.
    pub async fn build(&self, config: &CloudInitConfig, iso_path: &Path) -> Result<()> {
        let staging = tempfile::tempdir().map_err(|e| {
            VirtError::CloudInit(format!("failed to create staging directory: {e}"))
        })?;
        let staged = stage(config, staging.path())?;

        let output = Command::new(&self.genisoimage)
            .arg("-output")
            .arg(iso_path)
            .args(["-volid", VOLUME_LABEL, "-joliet", "-rock"])
            .args(&staged)
            .output()
            .await
            .map_err(|e| VirtError::CloudInit(format!("failed to run genisoimage: {e}")))?;
        if !output.status.success() {
            return Err(VirtError::CloudInit(format!(
                "genisoimage failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::info!(
            "Created cloud-init ISO for {} at {}",
            config.instance_id,
            iso_path.display()
        );
        Ok(())
    }
}

/// Render the three payload files into `dir`, returning their paths in the
/// order they appear on the ISO.
fn stage(config: &CloudInitConfig, dir: &Path) -> Result<Vec<PathBuf>> {
    for file in &config.vendor.files {
        validate_file_path(&file.path).map_err(VirtError::CloudInit)?;
    }

    let meta_data = dir.join("meta-data");
    std::fs::write(&meta_data, render_meta_data(config))?;

    let user_data = dir.join("user-data");
    std::fs::write(&user_data, render_user_data(config.user_data.as_deref())?)?;

    let vendor_data = dir.join("vendor-data");
    std::fs::write(&vendor_data, render_vendor_data(&config.vendor)?)?;

    Ok(vec![meta_data, user_data, vendor_data])
}

fn render_meta_data(config: &CloudInitConfig) -> String {
    format!(
        "instance-id: {}\nlocal-hostname: {}\n",
        config.instance_id, config.hostname
    )
}

/// User data is passed through verbatim. A value that looks like an absolute
/// path to an existing file is streamed from disk; otherwise the literal is
/// used, and an empty cloud-config document stands in when nothing was given.
fn render_user_data(user_data: Option<&str>) -> Result<String> {
    match user_data {
        Some(value) => {
            let path = Path::new(value);
            if path.is_absolute() && path.is_file() {
                std::fs::read_to_string(path).map_err(|e| {
                    VirtError::CloudInit(format!("failed to read user data {value}: {e}"))
                })
            } else {
                Ok(value.to_string())
            }
        }
        None => Ok("#cloud-config\n".to_string()),
    }
}

fn render_vendor_data(vendor: &VendorData) -> Result<String> {
    let mut doc = CloudConfigDoc::default();

    if let Some(password) = &vendor.password {
        doc.password = Some(password.clone());
        doc.chpasswd = Some(Chpasswd { expire: false });
        doc.ssh_pwauth = Some(true);
    }
    if let Some(key) = &vendor.ssh_key {
        doc.ssh_authorized_keys.push(key.clone());
    }

    // Mount points must exist before the tags are mounted, so both commands
    // run at boot time ahead of runcmd.
    for mount in &vendor.mounts {
        doc.bootcmd
            .push(format!("mkdir -p {}", mount.destination));
        doc.bootcmd.push(format!(
            "mount -t virtiofs {} {}",
            mount.tag, mount.destination
        ));
    }
    doc.bootcmd.extend(vendor.boot_cmds.iter().cloned());
    doc.runcmd.extend(vendor.run_cmds.iter().cloned());

    for file in &vendor.files {
        let owner = match (&file.owner, &file.group) {
            (Some(owner), Some(group)) => Some(format!("{owner}:{group}")),
            (Some(owner), None) => Some(owner.clone()),
            _ => None,
        };
        doc.write_files.push(WriteFile {
            path: file.path.clone(),
            content: file.content.clone(),
            permissions: file.permissions.clone(),
            encoding: file.encoding.clone(),
            owner,
        });
    }

    let body = serde_yaml::to_string(&doc)
        .map_err(|e| VirtError::CloudInit(format!("vendor data rendering failed: {e}")))?;
    Ok(format!("#cloud-config\n{body}"))
}

fn validate_file_path(path: &str) -> std::result::Result<(), String> {
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if name.is_empty() {
        return Err(format!("file path {path:?} has no basename"));
    }
    if name
        .chars()
        .any(|c| c.is_ascii_control() || FORBIDDEN_NAME_CHARS.contains(&c))
    {
        return Err(format!("file path {path:?} contains forbidden characters"));
    }
    Ok(())
}
