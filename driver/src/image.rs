use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;

use crate::error::{Result, VirtError};

/// Disk-image operations backed by `qemu-img`.
pub struct ImageTools {
    qemu_img: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    format: String,
}

impl ImageTools {
    pub fn new() -> Result<Self> {
        let qemu_img = which::which("qemu-img")
            .map_err(|e| VirtError::Validation(vec![format!("qemu-img not found: {e}")]))?;
        Ok(Self { qemu_img })
    }

    /// Report the on-disk format of an image, verbatim from `qemu-img info`.
    pub async fn probe_format(&self, path: &Path) -> Result<String> {
        let output = Command::new(&self.qemu_img)
            .args(["info", "--output=json"])
            .arg(path)
            .output()
            .await?;
        if !output.status.success() {
            return Err(VirtError::from_output("qemu-img info", &output));
        }
        parse_image_format(&output.stdout)
    }

    /// Create a copy-on-write qcow2 overlay at `dest` backed by `base`.
    ///
    /// The base image is opened read-only by qemu-img and is never modified;
    /// the overlay reports itself as qcow2 regardless of the base format.
    pub async fn thin_clone(
        &self,
        base: &Path,
        base_format: &str,
        dest: &Path,
        size_mb: u64,
    ) -> Result<()> {
        tracing::info!(
            "Creating thin copy of {} at {} ({}M)",
            base.display(),
            dest.display(),
            size_mb
        );
        let output = Command::new(&self.qemu_img)
            .args(["create", "-f", "qcow2", "-b"])
            .arg(base)
            .args(["-F", base_format])
            .arg(dest)
            .arg(format!("{size_mb}M"))
            .output()
            .await?;
        if !output.status.success() {
            return Err(VirtError::from_output("qemu-img create", &output));
        }
        Ok(())
    }
}

fn parse_image_format(stdout: &[u8]) -> Result<String> {
    let info: ImageInfo = serde_json::from_slice(stdout)?;
    Ok(info.format)
}

/// Locate a task image: operator-allowed paths first, then the task's
/// allocation directory. The returned path is canonical, so later
/// allowed-path checks are not fooled by symlinks.
pub fn resolve_image(image: &Path, allowed_paths: &[PathBuf], alloc_dir: &Path) -> Result<PathBuf> {
    if image.is_absolute() && image.exists() {
        let resolved = image.canonicalize()?;
        let under_allowed = allowed_paths.iter().any(|prefix| {
            prefix
                .canonicalize()
                .map(|p| resolved.starts_with(p))
                .unwrap_or(false)
        });
        if under_allowed {
            return Ok(resolved);
        }
    }

    let candidate = if image.is_absolute() {
        // Absolute paths that were not allowed above may still name a file
        // the task itself materialized under its allocation directory.
        alloc_dir.join(image.file_name().unwrap_or_default())
    } else {
        alloc_dir.join(image)
    };
    if candidate.exists() {
        return Ok(candidate.canonicalize()?);
    }

    Err(VirtError::ImageNotFound(image.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qemu_img_info_output() {
        let out = br#"{
            "virtual-size": 10737418240,
            "filename": "/images/base.qcow2",
            "format": "qcow2",
            "actual-size": 1982464
        }"#;
        assert_eq!(parse_image_format(out).unwrap(), "qcow2");
    }

    #[test]
    fn rejects_malformed_probe_output() {
        assert!(parse_image_format(b"not json").is_err());
    }

    #[test]
    fn resolves_from_allowed_path() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("base.qcow2");
        std::fs::write(&image, b"img").unwrap();

        let resolved = resolve_image(
            &image,
            &[dir.path().to_path_buf()],
            Path::new("/nonexistent"),
        )
        .unwrap();
        assert_eq!(resolved, image.canonicalize().unwrap());
    }

    #[test]
    fn falls_back_to_alloc_dir() {
        let alloc = tempfile::tempdir().unwrap();
        let image = alloc.path().join("task.qcow2");
        std::fs::write(&image, b"img").unwrap();

        let resolved = resolve_image(Path::new("task.qcow2"), &[], alloc.path()).unwrap();
        assert_eq!(resolved, image.canonicalize().unwrap());
    }

    #[test]
    fn outside_allowed_paths_is_not_found() {
        let allowed = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let image = other.path().join("base.qcow2");
        std::fs::write(&image, b"img").unwrap();

        let err = resolve_image(
            &image,
            &[allowed.path().to_path_buf()],
            Path::new("/nonexistent"),
        )
        .unwrap_err();
        assert!(matches!(err, VirtError::ImageNotFound(_)));
    }

    #[test]
    fn missing_image_is_not_found() {
        let err = resolve_image(Path::new("/images/ghost.qcow2"), &[], Path::new("/tmp"))
            .unwrap_err();
        assert!(matches!(err, VirtError::ImageNotFound(_)));
    }
}
