use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result, ResultExt};

/// Config file name
const CONFIG_FILE: &str = "vmfabric.toml";

/// Embedded default config, used when no file is found on the lookup chain
const EMBEDDED_CONFIG: &str = include_str!("../vmfabric.toml");

// ============================================================================
// Config Data Structures
// ============================================================================

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub qemu: QemuConfig,
    #[serde(default)]
    pub inject: InjectConfig,
    #[serde(default)]
    pub ssh: SshConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Where console logs are written. Defaults to the cluster temp dir.
    #[serde(default)]
    pub console_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_bridge_prefix")]
    pub bridge_prefix: String,
    /// Number of static DHCP reservations per segment
    #[serde(default = "default_pool_size")]
    pub pool_size: u8,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_dnsmasq")]
    pub dnsmasq: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QemuConfig {
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,
    #[serde(default = "default_qemu_img")]
    pub img: String,
    /// Overrides the binary picked from the architecture table
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default = "default_firmware_amd64")]
    pub firmware_amd64: String,
    #[serde(default = "default_firmware_arm64")]
    pub firmware_arm64: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InjectConfig {
    #[serde(default = "default_guestfish")]
    pub guestfish: String,
    /// Path inside the guest filesystem the payload is uploaded to
    #[serde(default = "default_destination")]
    pub destination: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_key_type")]
    pub key_type: String,
    #[serde(default = "default_retry_secs")]
    pub retry_secs: u64,
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/var/tmp")
}
fn default_bridge_prefix() -> String {
    "br".to_string()
}
fn default_pool_size() -> u8 {
    64
}
fn default_domain() -> String {
    "local".to_string()
}
fn default_dnsmasq() -> String {
    "dnsmasq".to_string()
}
fn default_memory_mib() -> u32 {
    1024
}
fn default_qemu_img() -> String {
    "qemu-img".to_string()
}
fn default_firmware_amd64() -> String {
    "bios-256k.bin".to_string()
}
fn default_firmware_arm64() -> String {
    "/usr/share/AAVMF/AAVMF_CODE.fd".to_string()
}
fn default_guestfish() -> String {
    "guestfish".to_string()
}
fn default_destination() -> String {
    "/boot/ignition/config.ign".to_string()
}
fn default_ssh_user() -> String {
    "core".to_string()
}
fn default_key_type() -> String {
    "ed25519".to_string()
}
fn default_retry_secs() -> u64 {
    300
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            console_dir: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_prefix: default_bridge_prefix(),
            pool_size: default_pool_size(),
            domain: default_domain(),
            dnsmasq: default_dnsmasq(),
        }
    }
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            memory_mib: default_memory_mib(),
            img: default_qemu_img(),
            binary: None,
            firmware_amd64: default_firmware_amd64(),
            firmware_arm64: default_firmware_arm64(),
        }
    }
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            guestfish: default_guestfish(),
            destination: default_destination(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            key_type: default_key_type(),
            retry_secs: default_retry_secs(),
        }
    }
}

// ============================================================================
// Config File Loading
// ============================================================================

/// Find the config file using the lookup chain.
///
/// Lookup order:
/// 1. Explicit path
/// 2. `$VMFABRIC_CONFIG`
/// 3. XDG user config (~/.config/vmfabric/vmfabric.toml)
/// 4. System config (/etc/vmfabric/vmfabric.toml)
///
/// Returns `Ok(None)` when nothing is found and the embedded default applies.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit_path {
        if !path.exists() {
            return Err(Error::Configuration(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }

    if let Ok(env_path) = std::env::var("VMFABRIC_CONFIG") {
        let p = PathBuf::from(env_path);
        if !p.exists() {
            return Err(Error::Configuration(format!(
                "VMFABRIC_CONFIG points at missing file: {}",
                p.display()
            )));
        }
        return Ok(Some(p));
    }

    if let Some(proj_dirs) = ProjectDirs::from("", "", "vmfabric") {
        let p = proj_dirs.config_dir().join(CONFIG_FILE);
        if p.exists() {
            return Ok(Some(p));
        }
    }

    let system = Path::new("/etc/vmfabric").join(CONFIG_FILE);
    if system.exists() {
        return Ok(Some(system));
    }

    Ok(None)
}

impl Config {
    /// Load the config from the lookup chain, falling back to the embedded
    /// defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match find_config_file(explicit_path)? {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .configuration(format_args!("reading {}", path.display()))?;
                let config = Self::parse(&content)
                    .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
                info!(config_file = %path.display(), "loaded config");
                Ok(config)
            }
            None => {
                debug!("no config file found, using embedded defaults");
                Self::parse(EMBEDDED_CONFIG)
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).configuration("parsing config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.network.pool_size == 0 || self.network.pool_size > 250 {
            return Err(Error::Configuration(format!(
                "network.pool_size must be between 1 and 250, got {}",
                self.network.pool_size
            )));
        }
        if self.network.bridge_prefix.is_empty() || self.network.bridge_prefix.len() > 10 {
            return Err(Error::Configuration(
                "network.bridge_prefix must be 1-10 characters".to_string(),
            ));
        }
        if !self.inject.destination.starts_with('/') {
            return Err(Error::Configuration(format!(
                "inject.destination must be absolute: {}",
                self.inject.destination
            )));
        }
        Ok(())
    }
}
