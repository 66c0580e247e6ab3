use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{InjectConfig, QemuConfig};
use crate::error::{Error, Result, ResultExt};
use crate::qemu::Arch;
use crate::storage::inject::Injector;
use crate::utils::{run_tool, run_tool_stdout};

/// One guest disk: either blank of a given size, or a copy-on-write overlay
/// of an existing image. Exactly one of the two must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub backing_file: Option<PathBuf>,
}

impl DiskSpec {
    pub fn blank(size: impl Into<String>) -> Self {
        Self {
            size: Some(size.into()),
            backing_file: None,
        }
    }

    pub fn overlay(backing_file: impl Into<PathBuf>) -> Self {
        Self {
            size: None,
            backing_file: Some(backing_file.into()),
        }
    }

    /// Check the disk description without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        match (&self.size, &self.backing_file) {
            (Some(_), Some(_)) => Err(Error::Configuration(
                "disk sets both size and backing_file".to_string(),
            )),
            (None, None) => Err(Error::Configuration(
                "disk needs either size or backing_file".to_string(),
            )),
            (Some(size), None) => parse_size(size).map(|_| ()),
            (None, Some(_)) => Ok(()),
        }
    }
}

/// Parse a size string like "10G", "512M", "64k" or plain bytes.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Configuration("empty size string".to_string()));
    }

    let (num_str, multiplier) = if s.ends_with('T') || s.ends_with('t') {
        (&s[..s.len() - 1], 1024u64 * 1024 * 1024 * 1024)
    } else if s.ends_with('G') || s.ends_with('g') {
        (&s[..s.len() - 1], 1024u64 * 1024 * 1024)
    } else if s.ends_with('M') || s.ends_with('m') {
        (&s[..s.len() - 1], 1024u64 * 1024)
    } else if s.ends_with('K') || s.ends_with('k') {
        (&s[..s.len() - 1], 1024u64)
    } else {
        (s, 1u64)
    };

    let num: u64 = num_str
        .parse()
        .configuration(format_args!("parsing size number '{}'", num_str))?;
    if num == 0 {
        return Err(Error::Configuration(format!("disk size must be positive: {}", s)));
    }
    num.checked_mul(multiplier)
        .ok_or_else(|| Error::Configuration(format!("disk size overflows: {}", s)))
}

/// Reopen a temp file read-write and unlink it, so the returned descriptor
/// is the only reference left to the data.
pub fn into_anonymous(tmp: NamedTempFile) -> Result<OwnedFd> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(tmp.path())
        .resource(format_args!("reopening {}", tmp.path().display()))?;
    let path = tmp.path().to_path_buf();
    tmp.close()
        .resource(format_args!("unlinking {}", path.display()))?;
    Ok(OwnedFd::from(file))
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    format: String,
}

/// Creates qcow2 images in a temp dir and hands them back as unlinked
/// descriptors.
pub struct DiskPreparer {
    temp_dir: PathBuf,
    qemu_img: String,
    injector: Injector,
}

impl DiskPreparer {
    pub fn new(temp_dir: &Path, qemu: &QemuConfig, inject: &InjectConfig) -> Self {
        Self {
            temp_dir: temp_dir.to_path_buf(),
            qemu_img: qemu.img.clone(),
            injector: Injector::new(inject),
        }
    }

    pub fn injector(&self) -> &Injector {
        &self.injector
    }

    /// Create the image, inject `payload` into it if the guest cannot take
    /// it through firmware, and return an anonymous read-write descriptor.
    ///
    /// Nothing is created when the description is invalid, and no file is left
    /// behind on any failure.
    pub async fn prepare(
        &self,
        disk: &DiskSpec,
        payload: Option<&Path>,
        guest: Arch,
    ) -> Result<OwnedFd> {
        disk.validate()?;

        let tmp = tempfile::Builder::new()
            .prefix("vmfabric-disk-")
            .suffix(".qcow2")
            .tempfile_in(&self.temp_dir)
            .resource(format_args!("creating disk in {}", self.temp_dir.display()))?;

        if let Some(backing) = &disk.backing_file {
            self.create_overlay(tmp.path(), backing).await?;
        } else if let Some(size) = &disk.size {
            self.create_blank(tmp.path(), parse_size(size)?).await?;
        }

        if let Some(payload) = payload {
            if !guest.has_fw_cfg() {
                self.injector.inject(payload, tmp.path()).await?;
            }
        }

        let fd = into_anonymous(tmp)?;
        debug!(guest = %guest, "disk prepared");
        Ok(fd)
    }

    async fn create_blank(&self, path: &Path, bytes: u64) -> Result<()> {
        run_tool(
            "qemu-img create",
            Command::new(&self.qemu_img)
                .args(["create", "-q", "-f", "qcow2"])
                .arg(path)
                .arg(bytes.to_string()),
        )
        .await?;
        Ok(())
    }

    async fn create_overlay(&self, path: &Path, backing: &Path) -> Result<()> {
        // The overlay must not depend on the caller's cwd or on symlinks
        let backing = std::fs::canonicalize(backing)
            .map_err(|e| Error::NotFound(format!("backing file {}: {}", backing.display(), e)))?;

        let format = self.backing_format(&backing).await?;
        info!(backing = %backing.display(), format = %format, "creating overlay");

        let mut options = std::ffi::OsString::from("backing_file=");
        options.push(&backing);
        options.push(format!(",backing_fmt={}", format));
        run_tool(
            "qemu-img create",
            Command::new(&self.qemu_img)
                .args(["create", "-q", "-f", "qcow2", "-o"])
                .arg(options)
                .arg(path),
        )
        .await?;
        Ok(())
    }

    async fn backing_format(&self, backing: &Path) -> Result<String> {
        let json = run_tool_stdout(
            "qemu-img info",
            Command::new(&self.qemu_img)
                .args(["info", "--output=json"])
                .arg(backing),
        )
        .await?;
        let info: ImageInfo = serde_json::from_str(&json).resource("parsing qemu-img info")?;
        Ok(info.format)
    }
}
