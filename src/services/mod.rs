//! In-sandbox services the guests depend on.

pub mod discovery;
pub mod ntp;

pub use discovery::DiscoveryService;
pub use ntp::NtpServer;
