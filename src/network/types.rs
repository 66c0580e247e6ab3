use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Generate a random locally administered unicast address
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let mut bytes: [u8; 6] = rng.gen();
        // Locally administered (bit 1 set), unicast (bit 0 clear)
        bytes[0] = (bytes[0] | 0x02) & !0x01;
        MacAddr(bytes)
    }

    pub fn is_local_unicast(&self) -> bool {
        self.0[0] & 0x02 == 0x02 && self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(Error::Configuration(format!("invalid MAC address: {}", s)));
        }
        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(parts) {
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| Error::Configuration(format!("invalid MAC address: {}", s)))?;
        }
        Ok(MacAddr(bytes))
    }
}

/// A static DHCP reservation handed to exactly one tap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub hostname: String,
}

/// IPv4 layout of one fabric segment: 10.{index}.0.0/24 with the bridge on .1
/// and reservations from .2 upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAddressing {
    pub index: u8,
}

impl SegmentAddressing {
    pub const PREFIX_LEN: u8 = 24;

    pub fn new(index: u8) -> Self {
        Self { index }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::new(10, self.index, 0, 0)
    }

    pub fn bridge_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(10, self.index, 0, 1)
    }

    pub fn bridge_cidr(&self) -> String {
        format!("{}/{}", self.bridge_ip(), Self::PREFIX_LEN)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }

    /// Generate `count` reservations with fresh MAC addresses
    pub fn leases(&self, bridge: &str, count: u8) -> Vec<Lease> {
        (0..count.min(250))
            .map(|i| Lease {
                mac: MacAddr::random(),
                ip: Ipv4Addr::new(10, self.index, 0, 2 + i),
                hostname: format!("{}-m{}", bridge, i),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_mac_is_local_unicast() {
        for _ in 0..64 {
            let mac = MacAddr::random();
            assert!(mac.is_local_unicast(), "{} not local unicast", mac);
        }
    }

    #[test]
    fn test_mac_display_and_parse() {
        let mac: MacAddr = "02:ab:00:10:ff:01".parse().unwrap();
        assert_eq!(mac.0, [0x02, 0xab, 0x00, 0x10, 0xff, 0x01]);
        assert_eq!(mac.to_string(), "02:ab:00:10:ff:01");

        assert!("02:ab:00".parse::<MacAddr>().is_err());
        assert!("02:ab:00:10:ff:zz".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_segment_addressing() {
        let seg = SegmentAddressing::new(3);
        assert_eq!(seg.network(), Ipv4Addr::new(10, 3, 0, 0));
        assert_eq!(seg.bridge_cidr(), "10.3.0.1/24");

        let leases = seg.leases("br3", 4);
        assert_eq!(leases.len(), 4);
        assert_eq!(leases[0].ip, Ipv4Addr::new(10, 3, 0, 2));
        assert_eq!(leases[3].ip, Ipv4Addr::new(10, 3, 0, 5));
        assert_eq!(leases[1].hostname, "br3-m1");

        let macs: std::collections::HashSet<_> = leases.iter().map(|l| l.mac).collect();
        assert_eq!(macs.len(), 4);
    }
}
