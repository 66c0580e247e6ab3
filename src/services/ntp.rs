//! Minimal SNTP server so guests without outside connectivity agree on time.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::network::Sandbox;

pub const NTP_PORT: u16 = 123;
pub const PACKET_LEN: usize = 48;

/// Seconds between 1900-01-01 and 1970-01-01
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const MODE_CLIENT: u8 = 3;
const MODE_SERVER: u8 = 4;
const STRATUM: u8 = 1;
/// 2^-20 s, roughly one microsecond
const PRECISION: i8 = -20;
const REFERENCE_ID: &[u8; 4] = b"LOCL";

/// 64-bit NTP timestamp for `t`.
pub fn ntp_timestamp(t: SystemTime) -> [u8; 8] {
    let since_epoch = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let secs = (since_epoch.as_secs() + NTP_UNIX_OFFSET) as u32;
    let frac = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;

    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&secs.to_be_bytes());
    out[4..].copy_from_slice(&(frac as u32).to_be_bytes());
    out
}

/// Build the server reply for a client request, or `None` for anything
/// that is not a well-formed client packet.
pub fn respond(request: &[u8], received: SystemTime, now: SystemTime) -> Option<[u8; PACKET_LEN]> {
    if request.len() < PACKET_LEN {
        return None;
    }
    let version = (request[0] >> 3) & 0x07;
    let mode = request[0] & 0x07;
    if mode != MODE_CLIENT || version == 0 {
        return None;
    }

    let mut reply = [0u8; PACKET_LEN];
    // LI = 0, VN echoed, mode = server
    reply[0] = (version << 3) | MODE_SERVER;
    reply[1] = STRATUM;
    reply[2] = request[2];
    reply[3] = PRECISION as u8;
    // Root delay and dispersion stay zero
    reply[12..16].copy_from_slice(REFERENCE_ID);
    reply[16..24].copy_from_slice(&ntp_timestamp(now));
    // Originate = client's transmit timestamp
    reply[24..32].copy_from_slice(&request[40..48]);
    reply[32..40].copy_from_slice(&ntp_timestamp(received));
    reply[40..48].copy_from_slice(&ntp_timestamp(now));
    Some(reply)
}

pub struct NtpServer {
    addr: SocketAddr,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NtpServer {
    /// Serve on port 123 of every address inside the sandbox, so each
    /// segment's bridge answers for the segment it advertises to.
    pub async fn start(sandbox: &Sandbox) -> Result<Self> {
        let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), NTP_PORT);
        let socket = sandbox.bind_udp(addr).await?;
        Self::serve(UdpSocket::from_std(socket)?)
    }

    pub fn serve(socket: UdpSocket) -> Result<Self> {
        let addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let task = tokio::spawn(serve_loop(socket));
        info!(addr = %addr, "ntp server listening");
        Ok(Self {
            addr,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop answering. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let task = self
            .task
            .lock()
            .map_err(|_| Error::Resource("ntp task lock poisoned".into()))?
            .take();
        if let Some(task) = task {
            task.abort();
            debug!(addr = %self.addr, "ntp server stopped");
        }
        Ok(())
    }
}

impl Drop for NtpServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

async fn serve_loop(socket: Arc<UdpSocket>) {
    let mut buf = [0u8; 512];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "ntp receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let received = SystemTime::now();
        let Some(reply) = respond(&buf[..len], received, SystemTime::now()) else {
            debug!(peer = %peer, len = len, "ignoring non-client ntp packet");
            continue;
        };
        if let Err(e) = socket.send_to(&reply, peer).await {
            warn!(peer = %peer, error = %e, "ntp reply failed");
        }
    }
}
