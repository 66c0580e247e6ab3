//! TAP devices opened through /dev/net/tun.
//!
//! The devices are non-persistent: the kernel removes the interface as soon
//! as the last descriptor is closed, so dropping the fd is the teardown.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use libc::{c_int, c_short, IFNAMSIZ};

const TUN_DEVICE: &str = "/dev/net/tun";

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    flags: c_short,
    _pad: [u8; 22],
}

const TUNSETIFF: nix::sys::ioctl::ioctl_num_type =
    nix::request_code_write!(b'T', 202, std::mem::size_of::<c_int>());
const TUNSETPERSIST: nix::sys::ioctl::ioctl_num_type =
    nix::request_code_write!(b'T', 203, std::mem::size_of::<c_int>());

nix::ioctl_write_int_bad!(tun_set_persist, TUNSETPERSIST);
nix::ioctl_readwrite_bad!(tun_set_iff, TUNSETIFF, IfReq);

impl IfReq {
    fn new(pattern: &str, flags: c_int) -> std::io::Result<Self> {
        let bytes = pattern.as_bytes();
        if bytes.is_empty() || bytes.len() >= IFNAMSIZ {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid interface name {:?}", pattern),
            ));
        }
        let mut name = [0u8; IFNAMSIZ];
        name[..bytes.len()].copy_from_slice(bytes);
        Ok(IfReq {
            name,
            flags: flags as c_short,
            _pad: [0; 22],
        })
    }

    fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

/// Open a TAP device in the calling thread's network namespace.
///
/// `pattern` may contain `%d`, in which case the kernel picks the index.
/// Returns the descriptor and the name the kernel assigned.
pub fn open_tap(pattern: &str) -> std::io::Result<(OwnedFd, String)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(TUN_DEVICE)?;

    let mut req = IfReq::new(pattern, libc::IFF_TAP | libc::IFF_NO_PI | libc::IFF_VNET_HDR)?;
    // SAFETY: req is a valid ifreq-shaped buffer for the duration of the call
    unsafe { tun_set_iff(file.as_raw_fd(), &mut req) }.map_err(std::io::Error::from)?;
    // SAFETY: plain integer argument
    unsafe { tun_set_persist(file.as_raw_fd(), 0) }.map_err(std::io::Error::from)?;

    Ok((OwnedFd::from(file), req.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_layout() {
        // struct ifreq is 40 bytes on every Linux ABI we target
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
    }

    #[test]
    fn test_ifreq_name_roundtrip() {
        let req = IfReq::new("tap%d", libc::IFF_TAP).unwrap();
        assert_eq!(req.name(), "tap%d");
        assert_eq!(req.flags, libc::IFF_TAP as c_short);
    }

    #[test]
    fn test_ifreq_rejects_long_name() {
        assert!(IfReq::new("a-name-far-too-long", 0).is_err());
        assert!(IfReq::new("", 0).is_err());
    }
}
