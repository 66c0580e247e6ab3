//! Host/guest architecture pairs and how QEMU is invoked for each.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Amd64,
    Arm64,
    S390x,
    Ppc64le,
}

impl Arch {
    pub const ALL: [Arch; 4] = [Arch::Amd64, Arch::Arm64, Arch::S390x, Arch::Ppc64le];

    /// Architecture this binary was built for
    pub fn host() -> Result<Self> {
        Self::from_rust_arch(std::env::consts::ARCH, cfg!(target_endian = "little"))
    }

    fn from_rust_arch(arch: &str, little_endian: bool) -> Result<Self> {
        match arch {
            "x86_64" => Ok(Arch::Amd64),
            "aarch64" => Ok(Arch::Arm64),
            "s390x" => Ok(Arch::S390x),
            // Big-endian ppc64 has no entry in the table
            "powerpc64" if little_endian => Ok(Arch::Ppc64le),
            other => {
                let endian = if little_endian { "" } else { " (big-endian)" };
                Err(Error::Configuration(format!(
                    "unsupported host architecture {}{}",
                    other, endian
                )))
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::S390x => "s390x",
            Arch::Ppc64le => "ppc64le",
        }
    }

    /// Whether the firmware exposes a channel for passing the config
    /// payload at boot. Guests without it get the payload injected into the
    /// disk image instead.
    pub fn has_fw_cfg(&self) -> bool {
        matches!(self, Arch::Amd64 | Arch::Arm64)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "amd64" | "x86_64" => Ok(Arch::Amd64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "s390x" => Ok(Arch::S390x),
            "ppc64le" => Ok(Arch::Ppc64le),
            other => Err(Error::Configuration(format!("unknown architecture {}", other))),
        }
    }
}

/// Boot firmware selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    /// Built into the machine model
    None,
    /// `-bios <file>`
    Bios,
    /// Read-only pflash drive
    Pflash,
}

/// How the serial console is wired to the log chardev
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Console {
    /// `-serial chardev:log`
    Serial,
    /// `-device sclpconsole,chardev=log`
    Sclp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchProfile {
    pub binary: &'static str,
    pub machine: &'static str,
    pub cpu: &'static str,
    /// Suffix of virtio device names: `pci` or `ccw`
    pub bus: &'static str,
    pub firmware: Firmware,
    pub console: Console,
}

impl ArchProfile {
    /// Virtio device name for this bus, e.g. `virtio-blk-pci`
    pub fn virtio(&self, device: &str) -> String {
        format!("virtio-{}-{}", device, self.bus)
    }
}

/// Table cell; unsupported pairs are listed explicitly.
#[derive(Debug)]
enum Support {
    Supported(ArchProfile),
    Unsupported,
}

use Support::{Supported, Unsupported};

const X86_KVM: ArchProfile = ArchProfile {
    binary: "qemu-system-x86_64",
    machine: "accel=kvm",
    cpu: "host",
    bus: "pci",
    firmware: Firmware::Bios,
    console: Console::Serial,
};

const X86_TCG: ArchProfile = ArchProfile {
    binary: "qemu-system-x86_64",
    machine: "pc-q35-2.8",
    cpu: "kvm64",
    bus: "pci",
    firmware: Firmware::Bios,
    console: Console::Serial,
};

const ARM_KVM: ArchProfile = ArchProfile {
    binary: "qemu-system-aarch64",
    machine: "virt,gic-version=max,accel=kvm",
    cpu: "host",
    bus: "pci",
    firmware: Firmware::Pflash,
    console: Console::Serial,
};

const ARM_TCG: ArchProfile = ArchProfile {
    binary: "qemu-system-aarch64",
    machine: "virt",
    cpu: "cortex-a57",
    bus: "pci",
    firmware: Firmware::Pflash,
    console: Console::Serial,
};

const S390X_KVM: ArchProfile = ArchProfile {
    binary: "qemu-system-s390x",
    machine: "s390-ccw-virtio,accel=kvm",
    cpu: "host",
    bus: "ccw",
    firmware: Firmware::None,
    console: Console::Sclp,
};

const S390X_TCG: ArchProfile = ArchProfile {
    binary: "qemu-system-s390x",
    machine: "s390-ccw-virtio",
    cpu: "max",
    bus: "ccw",
    firmware: Firmware::None,
    console: Console::Sclp,
};

const PPC_KVM: ArchProfile = ArchProfile {
    binary: "qemu-system-ppc64",
    machine: "pseries,kvm-type=HV,vsmt=8,cap-fwnmi=off",
    cpu: "host",
    bus: "pci",
    firmware: Firmware::None,
    console: Console::Serial,
};

const PPC_TCG: ArchProfile = ArchProfile {
    binary: "qemu-system-ppc64",
    machine: "pseries",
    cpu: "power9",
    bus: "pci",
    firmware: Firmware::None,
    console: Console::Serial,
};

/// Every (host, guest) pair, keyed explicitly.
static TABLE: [((Arch, Arch), Support); 16] = [
    ((Arch::Amd64, Arch::Amd64), Supported(X86_KVM)),
    ((Arch::Amd64, Arch::Arm64), Supported(ARM_TCG)),
    ((Arch::Amd64, Arch::S390x), Supported(S390X_TCG)),
    ((Arch::Amd64, Arch::Ppc64le), Supported(PPC_TCG)),
    ((Arch::Arm64, Arch::Amd64), Supported(X86_TCG)),
    ((Arch::Arm64, Arch::Arm64), Supported(ARM_KVM)),
    ((Arch::Arm64, Arch::S390x), Unsupported),
    ((Arch::Arm64, Arch::Ppc64le), Unsupported),
    ((Arch::S390x, Arch::Amd64), Unsupported),
    ((Arch::S390x, Arch::Arm64), Unsupported),
    ((Arch::S390x, Arch::S390x), Supported(S390X_KVM)),
    ((Arch::S390x, Arch::Ppc64le), Unsupported),
    ((Arch::Ppc64le, Arch::Amd64), Unsupported),
    ((Arch::Ppc64le, Arch::Arm64), Unsupported),
    ((Arch::Ppc64le, Arch::S390x), Unsupported),
    ((Arch::Ppc64le, Arch::Ppc64le), Supported(PPC_KVM)),
];

/// Look up how to run `guest` on `host`.
pub fn profile(host: Arch, guest: Arch) -> Result<&'static ArchProfile> {
    let cell = TABLE
        .iter()
        .find(|(pair, _)| *pair == (host, guest))
        .map(|(_, support)| support);
    match cell {
        Some(Supported(p)) => Ok(p),
        Some(Unsupported) | None => Err(Error::Configuration(format!(
            "running {} guests on a {} host is not supported",
            guest, host
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_complete() {
        for host in Arch::ALL {
            for guest in Arch::ALL {
                assert_eq!(
                    TABLE.iter().filter(|(pair, _)| *pair == (host, guest)).count(),
                    1,
                    "{host}/{guest}"
                );
            }
        }
    }

    #[test]
    fn test_native_pairs_use_kvm() {
        for arch in Arch::ALL {
            let p = profile(arch, arch).unwrap();
            assert!(p.machine.contains("accel=kvm") || p.machine.contains("kvm-type"), "{arch}");
            assert_eq!(p.cpu, "host");
        }
    }

    #[test]
    fn test_emulated_pairs() {
        let p = profile(Arch::Amd64, Arch::Arm64).unwrap();
        assert_eq!(p.binary, "qemu-system-aarch64");
        assert_eq!(p.machine, "virt");
        assert_eq!(p.cpu, "cortex-a57");

        let p = profile(Arch::Arm64, Arch::Amd64).unwrap();
        assert_eq!(p.binary, "qemu-system-x86_64");
        assert_eq!(p.cpu, "kvm64");
    }

    #[test]
    fn test_unsupported_pair() {
        let err = profile(Arch::S390x, Arch::Amd64).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("amd64 guests on a s390x host"));
    }

    #[test]
    fn test_s390x_uses_ccw_and_sclp() {
        let p = profile(Arch::S390x, Arch::S390x).unwrap();
        assert_eq!(p.virtio("blk"), "virtio-blk-ccw");
        assert_eq!(p.console, Console::Sclp);
        assert_eq!(p.firmware, Firmware::None);
        assert!(!Arch::S390x.has_fw_cfg());
    }

    #[test]
    fn test_host_mapping_checks_endianness() {
        assert_eq!(Arch::from_rust_arch("x86_64", true).unwrap(), Arch::Amd64);
        assert_eq!(Arch::from_rust_arch("s390x", false).unwrap(), Arch::S390x);
        assert_eq!(Arch::from_rust_arch("powerpc64", true).unwrap(), Arch::Ppc64le);
        assert!(matches!(
            Arch::from_rust_arch("powerpc64", false),
            Err(Error::Configuration(_))
        ));
        assert!(Arch::from_rust_arch("riscv64", true).is_err());
    }

    #[test]
    fn test_parse_arch() {
        assert_eq!("x86_64".parse::<Arch>().unwrap(), Arch::Amd64);
        assert_eq!("arm64".parse::<Arch>().unwrap(), Arch::Arm64);
        assert!("mips".parse::<Arch>().is_err());
        assert_eq!(Arch::Ppc64le.to_string(), "ppc64le");
    }
}
