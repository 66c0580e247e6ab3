//! Builds the QEMU command line for a guest and starts it.

use std::collections::HashMap;
use std::os::fd::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QemuConfig;
use crate::error::{Error, Result};
use crate::network::{Dialer, MacAddr, Tap};
use crate::qemu::arch::{self, Arch, ArchProfile, Console, Firmware};
use crate::qemu::fdset::ExtraFiles;
use crate::qemu::machine::{Machine, MachineResources};
use crate::utils::{forward_lines, ChildLog, Stream};

/// fw_cfg key the guest's first-boot agent reads its config from
pub const FW_CFG_CONFIG_NAME: &str = "opt/com.coreos/config";
/// Mount tag of the read-only share carrying the config payload
pub const CONFIG_SHARE_TAG: &str = "config-2";

/// First QEMU release that opens fdset-backed drives read-only unless told
/// otherwise
const AUTO_READ_ONLY_SINCE: (u32, u32) = (3, 1);

/// How the config payload reaches the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigDelivery {
    None,
    /// File handed to firmware through fw_cfg
    Firmware(PathBuf),
    /// Directory exposed read-only over 9p
    SharedDir(PathBuf),
    /// Already injected into the primary disk
    Offline,
}

/// Everything that varies between launches, in command-line terms.
#[derive(Debug)]
pub struct LaunchPlan<'a> {
    pub profile: &'a ArchProfile,
    pub uuid: Uuid,
    pub memory_mib: u32,
    pub firmware: Option<&'a str>,
    pub console: &'a Path,
    pub config: &'a ConfigDelivery,
    pub disk_fds: &'a [RawFd],
    pub tap_fd: RawFd,
    pub mac: MacAddr,
    pub auto_read_only_off: bool,
}

fn push(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

/// Argument vector, in a fixed order: machine template, identity, console,
/// entropy, firmware, config, disks, network.
pub fn build_args(plan: &LaunchPlan<'_>) -> Vec<String> {
    let p = plan.profile;
    let mut args = Vec::new();

    push(&mut args, &["-machine", p.machine, "-cpu", p.cpu]);
    push(&mut args, &["-m", &plan.memory_mib.to_string()]);
    push(&mut args, &["-uuid", &plan.uuid.to_string()]);

    push(&mut args, &["-display", "none"]);
    push(
        &mut args,
        &["-chardev", &format!("file,id=log,path={}", plan.console.display())],
    );
    match p.console {
        Console::Serial => push(&mut args, &["-serial", "chardev:log"]),
        Console::Sclp => push(&mut args, &["-device", "sclpconsole,chardev=log"]),
    }

    push(&mut args, &["-object", "rng-random,filename=/dev/urandom,id=rng0"]);
    push(&mut args, &["-device", &format!("{},rng=rng0", p.virtio("rng"))]);

    match (p.firmware, plan.firmware) {
        (Firmware::Bios, Some(path)) => push(&mut args, &["-bios", path]),
        (Firmware::Pflash, Some(path)) => push(
            &mut args,
            &["-drive", &format!("if=pflash,file={},format=raw,unit=0,readonly=on", path)],
        ),
        _ => {}
    }

    match plan.config {
        ConfigDelivery::Firmware(path) => push(
            &mut args,
            &["-fw_cfg", &format!("name={},file={}", FW_CFG_CONFIG_NAME, path.display())],
        ),
        ConfigDelivery::SharedDir(dir) => {
            push(
                &mut args,
                &[
                    "-fsdev",
                    &format!("local,id=cfg,security_model=none,readonly=on,path={}", dir.display()),
                ],
            );
            push(
                &mut args,
                &[
                    "-device",
                    &format!("{},fsdev=cfg,mount_tag={}", p.virtio("9p"), CONFIG_SHARE_TAG),
                ],
            );
        }
        ConfigDelivery::None | ConfigDelivery::Offline => {}
    }

    let ro = if plan.auto_read_only_off { ",auto-read-only=off" } else { "" };
    for (i, fd) in plan.disk_fds.iter().enumerate() {
        let set = i + 1;
        push(&mut args, &["-add-fd", &format!("fd={},set={}", fd, set)]);
        push(
            &mut args,
            &["-drive", &format!("if=none,id=d{},format=qcow2,file=/dev/fdset/{}{}", i, set, ro)],
        );
        let boot = if i == 0 { ",bootindex=1" } else { "" };
        push(
            &mut args,
            &["-device", &format!("{},drive=d{}{}", p.virtio("blk"), i, boot)],
        );
    }

    push(&mut args, &["-netdev", &format!("tap,id=tap,fd={}", plan.tap_fd)]);
    push(
        &mut args,
        &["-device", &format!("{},netdev=tap,mac={}", p.virtio("net"), plan.mac)],
    );

    args
}

/// Extract (major, minor) from `qemu-system-* --version` output.
pub fn parse_version(output: &str) -> Option<(u32, u32)> {
    let rest = &output[output.find("version ")? + "version ".len()..];
    let token = rest.split_whitespace().next()?;
    let mut parts = token.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Inputs for one guest; ownership of every resource moves into the machine.
pub struct LaunchRequest {
    pub id: Uuid,
    pub guest: Arch,
    pub disks: Vec<OwnedFd>,
    pub tap: Tap,
    pub console: PathBuf,
    pub config: ConfigDelivery,
    pub workdir: Option<TempDir>,
}

pub struct Launcher {
    host: Arch,
    config: QemuConfig,
    versions: tokio::sync::Mutex<HashMap<String, Option<(u32, u32)>>>,
}

impl Launcher {
    pub fn new(host: Arch, config: QemuConfig) -> Self {
        Self {
            host,
            config,
            versions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> Arch {
        self.host
    }

    fn binary<'a>(&'a self, profile: &'a ArchProfile) -> &'a str {
        self.config.binary.as_deref().unwrap_or(profile.binary)
    }

    fn firmware_for(&self, profile: &ArchProfile) -> Option<&str> {
        match profile.firmware {
            Firmware::Bios => Some(self.config.firmware_amd64.as_str()),
            Firmware::Pflash => Some(self.config.firmware_arm64.as_str()),
            Firmware::None => None,
        }
    }

    /// Version of `binary`, probed once. `None` if it cannot be parsed.
    async fn version(&self, binary: &str) -> Option<(u32, u32)> {
        let mut cache = self.versions.lock().await;
        if let Some(v) = cache.get(binary) {
            return *v;
        }
        let probed = match Command::new(binary).arg("--version").output().await {
            Ok(out) => parse_version(&String::from_utf8_lossy(&out.stdout)),
            Err(e) => {
                warn!(binary = %binary, error = %e, "qemu version probe failed");
                None
            }
        };
        debug!(binary = %binary, version = ?probed, "qemu version");
        cache.insert(binary.to_string(), probed);
        probed
    }

    /// Start the hypervisor for `req` through `dialer` and return the
    /// supervised machine.
    pub async fn launch(&self, dialer: &dyn Dialer, req: LaunchRequest) -> Result<Machine> {
        let profile = arch::profile(self.host, req.guest)?;
        let binary = self.binary(profile).to_string();
        let auto_read_only_off = self
            .version(&binary)
            .await
            .map(|v| v >= AUTO_READ_ONLY_SINCE)
            .unwrap_or(false);

        let mut files = ExtraFiles::new();
        let disk_fds: Vec<RawFd> = req.disks.into_iter().map(|fd| files.push(fd)).collect();
        let tap_fd = files.push(req.tap.try_clone_fd()?);

        let args = build_args(&LaunchPlan {
            profile,
            uuid: req.id,
            memory_mib: self.config.memory_mib,
            firmware: self.firmware_for(profile),
            console: &req.console,
            config: &req.config,
            disk_fds: &disk_fds,
            tap_fd,
            mac: req.tap.mac(),
            auto_read_only_off,
        });
        debug!(target: "qemu", machine = %req.id, args = ?args, "qemu command line");

        let mut cmd = dialer.command(&binary)?;
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        files.install(&mut cmd)?;

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("hypervisor {}", binary)),
            _ => Error::resource(format!("spawning {}", binary), e),
        })?;
        // Drops the staged descriptor copies held by the pre_exec closure
        drop(cmd);

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, ChildLog::Qemu, Stream::Stdout, req.id.to_string());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, ChildLog::Qemu, Stream::Stderr, req.id.to_string());
        }

        info!(
            target: "qemu",
            machine = %req.id,
            guest = %req.guest,
            pid = ?child.id(),
            ip = %req.tap.lease().ip,
            "machine started"
        );

        Ok(Machine::supervise(
            req.id,
            req.guest,
            req.console,
            child,
            MachineResources::new(files, req.tap, req.workdir),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan<'a>(
        profile: &'a ArchProfile,
        config: &'a ConfigDelivery,
        disks: &'a [RawFd],
        auto_ro: bool,
    ) -> LaunchPlan<'a> {
        LaunchPlan {
            profile,
            uuid: Uuid::nil(),
            memory_mib: 2048,
            firmware: Some("bios-256k.bin"),
            console: Path::new("/tmp/console.txt"),
            config,
            disk_fds: disks,
            tap_fd: 5,
            mac: "02:00:00:00:00:07".parse().unwrap(),
            auto_read_only_off: auto_ro,
        }
    }

    fn position(args: &[String], needle: &str) -> usize {
        args.iter()
            .position(|a| a.starts_with(needle))
            .unwrap_or_else(|| panic!("{needle} missing from {args:?}"))
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("QEMU emulator version 6.2.0 (Debian 1:6.2+dfsg-2ubuntu6)\n"),
            Some((6, 2))
        );
        assert_eq!(parse_version("QEMU emulator version 3.1.0\nCopyright"), Some((3, 1)));
        assert_eq!(parse_version("QEMU emulator version 2.12.1"), Some((2, 12)));
        assert_eq!(parse_version("QEMU emulator version 8.2.50-rc1"), Some((8, 2)));
        assert_eq!(parse_version("garbage"), None);
        assert_eq!(parse_version("QEMU emulator version x.y"), None);
    }

    #[test]
    fn test_amd64_firmware_config_order() {
        let profile = arch::profile(Arch::Amd64, Arch::Amd64).unwrap();
        let config = ConfigDelivery::Firmware(PathBuf::from("/tmp/m/config.ign"));
        let args = build_args(&plan(profile, &config, &[3, 4], true));

        assert_eq!(&args[..4], &["-machine", "accel=kvm", "-cpu", "host"]);
        let uuid = position(&args, "-uuid");
        let display = position(&args, "-display");
        let rng = position(&args, "rng-random");
        let bios = position(&args, "-bios");
        let fw_cfg = position(&args, "-fw_cfg");
        let add_fd = position(&args, "-add-fd");
        let netdev = position(&args, "-netdev");
        assert!(uuid < display && display < rng && rng < bios);
        assert!(bios < fw_cfg && fw_cfg < add_fd && add_fd < netdev);

        assert_eq!(args[fw_cfg + 1], "name=opt/com.coreos/config,file=/tmp/m/config.ign");
        assert!(args.contains(&"chardev:log".to_string()));
        assert!(args.contains(&"file,id=log,path=/tmp/console.txt".to_string()));
        assert!(args.contains(&"fd=3,set=1".to_string()));
        assert!(args.contains(&"fd=4,set=2".to_string()));
        assert!(args.contains(&"if=none,id=d0,format=qcow2,file=/dev/fdset/1,auto-read-only=off".to_string()));
        assert!(args.contains(&"virtio-blk-pci,drive=d0,bootindex=1".to_string()));
        assert!(args.contains(&"virtio-blk-pci,drive=d1".to_string()));
        assert!(args.contains(&"tap,id=tap,fd=5".to_string()));
        assert_eq!(args.last().unwrap(), "virtio-net-pci,netdev=tap,mac=02:00:00:00:00:07");
    }

    #[test]
    fn test_old_qemu_omits_auto_read_only() {
        let profile = arch::profile(Arch::Amd64, Arch::Amd64).unwrap();
        let args = build_args(&plan(profile, &ConfigDelivery::None, &[3], false));
        assert!(!args.iter().any(|a| a.contains("auto-read-only")));
        assert!(!args.iter().any(|a| a == "-fw_cfg" || a == "-fsdev"));
    }

    #[test]
    fn test_shared_dir_config() {
        let profile = arch::profile(Arch::Amd64, Arch::Amd64).unwrap();
        let config = ConfigDelivery::SharedDir(PathBuf::from("/tmp/m/cfg"));
        let args = build_args(&plan(profile, &config, &[3], true));
        let fsdev = position(&args, "-fsdev");
        assert_eq!(
            args[fsdev + 1],
            "local,id=cfg,security_model=none,readonly=on,path=/tmp/m/cfg"
        );
        assert_eq!(args[fsdev + 3], "virtio-9p-pci,fsdev=cfg,mount_tag=config-2");
    }

    #[test]
    fn test_s390x_uses_ccw_and_sclp_console() {
        let profile = arch::profile(Arch::S390x, Arch::S390x).unwrap();
        let args = build_args(&plan(profile, &ConfigDelivery::Offline, &[3], true));
        assert!(args.contains(&"sclpconsole,chardev=log".to_string()));
        assert!(!args.contains(&"-serial".to_string()));
        assert!(!args.contains(&"-bios".to_string()));
        assert!(args.contains(&"virtio-rng-ccw,rng=rng0".to_string()));
        assert!(args.contains(&"virtio-blk-ccw,drive=d0,bootindex=1".to_string()));
        assert!(args.last().unwrap().starts_with("virtio-net-ccw"));
    }

    #[test]
    fn test_arm64_pflash() {
        let profile = arch::profile(Arch::Amd64, Arch::Arm64).unwrap();
        let mut p = plan(profile, &ConfigDelivery::None, &[3], true);
        p.firmware = Some("/usr/share/AAVMF/AAVMF_CODE.fd");
        let args = build_args(&p);
        assert!(args.contains(
            &"if=pflash,file=/usr/share/AAVMF/AAVMF_CODE.fd,format=raw,unit=0,readonly=on".to_string()
        ));
        assert_eq!(&args[..4], &["-machine", "virt", "-cpu", "cortex-a57"]);
    }
}
