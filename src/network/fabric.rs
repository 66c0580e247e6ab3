//! Bridged segments inside the sandbox, each with its own DHCP/DNS responder.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Write as _};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::cleanup::CleanupStack;
use crate::config::NetworkConfig;
use crate::error::{Error, ErrorList, Result, ResultExt};
use crate::network::namespace::Sandbox;
use crate::network::tap::open_tap;
use crate::network::types::{Lease, MacAddr, SegmentAddressing};
use crate::utils::{forward_lines, run_tool, ChildLog, Stream};

/// How long a freshly started responder must stay up before it is trusted.
const RESPONDER_SETTLE: Duration = Duration::from_millis(300);

/// Render the dnsmasq configuration for one segment.
pub fn render_dnsmasq_config(
    bridge: &str,
    addressing: &SegmentAddressing,
    domain: &str,
    leases: &[Lease],
) -> String {
    let mut conf = String::new();
    let gw = addressing.bridge_ip();

    let _ = writeln!(conf, "keep-in-foreground");
    let _ = writeln!(conf, "log-facility=-");
    let _ = writeln!(conf, "leasefile-ro");
    let _ = writeln!(conf, "pid-file=");
    let _ = writeln!(conf, "no-resolv");
    let _ = writeln!(conf, "no-hosts");
    let _ = writeln!(conf, "domain={}", domain);
    let _ = writeln!(conf, "local=/{}/", domain);
    let _ = writeln!(conf, "expand-hosts");
    let _ = writeln!(conf, "interface={}", bridge);
    let _ = writeln!(conf, "bind-interfaces");
    let _ = writeln!(
        conf,
        "dhcp-range={},static,{},12h",
        addressing.network(),
        addressing.netmask()
    );
    let _ = writeln!(conf, "dhcp-option=option:router,{}", gw);
    let _ = writeln!(conf, "dhcp-option=option:dns-server,{}", gw);
    let _ = writeln!(conf, "dhcp-option=option:ntp-server,{}", gw);
    for lease in leases {
        let _ = writeln!(conf, "dhcp-host={},{},{}", lease.mac, lease.ip, lease.hostname);
    }
    conf
}

// ============================================================================
// Segment
// ============================================================================

pub struct Segment {
    bridge: String,
    addressing: SegmentAddressing,
    pool: Mutex<VecDeque<Lease>>,
    responder: Mutex<Option<Child>>,
    config_path: PathBuf,
}

impl Segment {
    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    pub fn addressing(&self) -> SegmentAddressing {
        self.addressing
    }

    /// Reservations not currently held by a tap
    pub fn available(&self) -> usize {
        self.pool.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn take_lease(&self) -> Result<Lease> {
        self.pool
            .lock()
            .map_err(|_| Error::Resource("lease pool lock poisoned".into()))?
            .pop_front()
            .ok_or_else(|| Error::Resource(format!("address pool of {} exhausted", self.bridge)))
    }

    fn return_lease(&self, lease: Lease) {
        if let Ok(mut pool) = self.pool.lock() {
            pool.push_back(lease);
        }
    }

    fn responder_pid(&self) -> Option<u32> {
        self.responder.lock().ok().and_then(|c| c.as_ref().and_then(|c| c.id()))
    }

    async fn stop_responder(&self) -> Result<()> {
        let child = self
            .responder
            .lock()
            .map_err(|_| Error::Resource("responder lock poisoned".into()))?
            .take();
        if let Some(mut child) = child {
            child.start_kill().resource("signaling dnsmasq")?;
            child.wait().await.resource("waiting for dnsmasq")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("bridge", &self.bridge)
            .field("address", &self.addressing.bridge_cidr())
            .field("available", &self.available())
            .field("responder", &self.responder_pid())
            .finish()
    }
}

// ============================================================================
// Tap
// ============================================================================

/// A tap attached to a segment bridge, holding one reservation.
///
/// Dropping it closes the descriptor (the kernel deletes the interface) and
/// returns the reservation to the segment pool.
pub struct Tap {
    name: String,
    fd: Option<OwnedFd>,
    lease: Lease,
    segment: Arc<Segment>,
}

impl Tap {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> MacAddr {
        self.lease.mac
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn bridge(&self) -> &str {
        self.segment.bridge()
    }

    /// Duplicate the descriptor for handing to a child process.
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        self.fd
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("tap {} already closed", self.name)))?
            .try_clone()
            .resource("duplicating tap descriptor")
    }
}

impl fmt::Debug for Tap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tap")
            .field("name", &self.name)
            .field("bridge", &self.segment.bridge)
            .field("lease", &self.lease)
            .field("open", &self.fd.is_some())
            .finish()
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        drop(self.fd.take());
        self.segment.return_lease(self.lease.clone());
        debug!(tap = %self.name, ip = %self.lease.ip, "tap released");
    }
}

// ============================================================================
// Fabric
// ============================================================================

pub struct Fabric {
    sandbox: Arc<Sandbox>,
    config: NetworkConfig,
    work_dir: PathBuf,
    /// Serializes every bridge and tap mutation.
    segments: tokio::sync::Mutex<FabricState>,
}

#[derive(Default)]
struct FabricState {
    by_bridge: HashMap<String, Arc<Segment>>,
    next_index: u8,
}

impl Fabric {
    pub fn new(sandbox: Arc<Sandbox>, config: NetworkConfig, work_dir: &Path) -> Self {
        Self {
            sandbox,
            config,
            work_dir: work_dir.to_path_buf(),
            segments: tokio::sync::Mutex::new(FabricState::default()),
        }
    }

    /// Name for the n-th segment
    pub fn bridge_name(&self, index: u8) -> String {
        format!("{}{}", self.config.bridge_prefix, index)
    }

    /// Create a bridge with an address and a running DHCP/DNS responder.
    ///
    /// On failure everything created so far is removed again and the segment
    /// is not registered.
    pub async fn new_segment(&self, bridge: &str) -> Result<Arc<Segment>> {
        let mut state = self.segments.lock().await;
        if state.by_bridge.contains_key(bridge) {
            return Err(Error::Configuration(format!("segment {} already exists", bridge)));
        }
        let addressing = SegmentAddressing::new(state.next_index);

        let mut undo = CleanupStack::new();
        match self.build_segment(bridge, addressing, &mut undo).await {
            Ok(segment) => {
                // The segment owns its resources from here on
                undo.disarm();
                state.next_index = state.next_index.wrapping_add(1);
                state.by_bridge.insert(bridge.to_string(), segment.clone());
                info!(
                    bridge = %bridge,
                    address = %addressing.bridge_cidr(),
                    pool = self.config.pool_size,
                    "segment ready"
                );
                Ok(segment)
            }
            Err(e) => {
                warn!(bridge = %bridge, error = %e, "segment creation failed, unwinding");
                if let Err(cleanup) = undo.unwind().await {
                    warn!(bridge = %bridge, error = %cleanup, "segment unwind incomplete");
                }
                Err(e)
            }
        }
    }

    async fn build_segment(
        &self,
        bridge: &str,
        addressing: SegmentAddressing,
        undo: &mut CleanupStack,
    ) -> Result<Arc<Segment>> {
        run_tool(
            "ip link add bridge",
            self.sandbox
                .command("ip")?
                .args(["link", "add", bridge, "type", "bridge"]),
        )
        .await?;
        let (sandbox, name) = (self.sandbox.clone(), bridge.to_string());
        undo.push(format!("delete bridge {}", bridge), move || async move {
            delete_link(&sandbox, &name).await
        });

        run_tool(
            "ip addr add",
            self.sandbox
                .command("ip")?
                .args(["addr", "add", &addressing.bridge_cidr(), "dev", bridge]),
        )
        .await?;
        run_tool(
            "ip link set up",
            self.sandbox.command("ip")?.args(["link", "set", bridge, "up"]),
        )
        .await?;

        let leases = addressing.leases(bridge, self.config.pool_size);
        let conf = render_dnsmasq_config(bridge, &addressing, &self.config.domain, &leases);
        let config_path = self.work_dir.join(format!("dnsmasq-{}.conf", bridge));
        tokio::fs::write(&config_path, conf)
            .await
            .resource(format_args!("writing {}", config_path.display()))?;
        let path = config_path.clone();
        undo.push(format!("remove {}", config_path.display()), move || async move {
            tokio::fs::remove_file(&path).await.map_err(Error::Io)
        });

        let responder = self.start_responder(bridge, &config_path).await?;

        Ok(Arc::new(Segment {
            bridge: bridge.to_string(),
            addressing,
            pool: Mutex::new(leases.into()),
            responder: Mutex::new(Some(responder)),
            config_path,
        }))
    }

    async fn start_responder(&self, bridge: &str, config_path: &Path) -> Result<Child> {
        let mut child = self
            .sandbox
            .command(&self.config.dnsmasq)?
            .arg(format!("--conf-file={}", config_path.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::NotFound(format!("dhcp responder {}", self.config.dnsmasq))
                }
                _ => Error::resource("spawning dnsmasq", e),
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, ChildLog::Dnsmasq, Stream::Stdout, bridge.to_string());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, ChildLog::Dnsmasq, Stream::Stderr, bridge.to_string());
        }

        // dnsmasq exits straight away when it cannot bind
        match tokio::time::timeout(RESPONDER_SETTLE, child.wait()).await {
            Ok(Ok(status)) => Err(Error::Resource(format!(
                "dnsmasq on {} exited during startup: {}",
                bridge, status
            ))),
            Ok(Err(e)) => Err(Error::resource("waiting for dnsmasq", e)),
            Err(_) => {
                debug!(bridge = %bridge, pid = ?child.id(), "dnsmasq running");
                Ok(child)
            }
        }
    }

    pub async fn segment(&self, bridge: &str) -> Result<Arc<Segment>> {
        self.segments
            .lock()
            .await
            .by_bridge
            .get(bridge)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("segment {}", bridge)))
    }

    pub async fn bridges(&self) -> Vec<String> {
        let mut names: Vec<String> = self.segments.lock().await.by_bridge.keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a tap on `bridge`, attach it and reserve an address for it.
    pub async fn allocate_tap(&self, bridge: &str) -> Result<Tap> {
        let state = self.segments.lock().await;
        let segment = state
            .by_bridge
            .get(bridge)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("segment {}", bridge)))?;

        let lease = segment.take_lease()?;
        let (fd, name) = match self.sandbox.run_in(|| open_tap("tap%d")).await {
            Ok(opened) => opened,
            Err(e) => {
                segment.return_lease(lease);
                return Err(Error::resource("opening tap", e));
            }
        };
        // From here on the Tap guard returns the lease and closes the fd
        let tap = Tap {
            name,
            fd: Some(fd),
            lease,
            segment,
        };

        run_tool(
            "ip link set master",
            self.sandbox
                .command("ip")?
                .args(["link", "set", tap.name(), "master", bridge]),
        )
        .await?;
        run_tool(
            "ip link set up",
            self.sandbox.command("ip")?.args(["link", "set", tap.name(), "up"]),
        )
        .await?;

        drop(state);
        debug!(
            tap = %tap.name(),
            bridge = %bridge,
            mac = %tap.mac(),
            ip = %tap.lease().ip,
            "tap allocated"
        );
        Ok(tap)
    }

    /// Stop every responder and delete every bridge.
    pub async fn destroy(&self) -> Result<()> {
        let mut state = self.segments.lock().await;
        let mut errors = ErrorList::new();
        let segments: Vec<(String, Arc<Segment>)> = state.by_bridge.drain().collect();
        for (bridge, segment) in segments {
            errors.check(format!("stop dnsmasq on {}", bridge), segment.stop_responder().await);
            errors.check(
                format!("delete bridge {}", bridge),
                delete_link(&self.sandbox, &bridge).await,
            );
            if let Err(e) = tokio::fs::remove_file(&segment.config_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    errors.push(format!("remove {}", segment.config_path.display()), e);
                }
            }
        }
        errors.into_result()
    }
}

async fn delete_link(sandbox: &Sandbox, name: &str) -> Result<()> {
    let mut cmd = match sandbox.command("ip") {
        Ok(cmd) => cmd,
        // Namespace already gone, and the link with it
        Err(Error::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    match run_tool("ip link del", cmd.args(["link", "del", name])).await {
        Err(Error::ToolFailure { stderr, .. }) if stderr.contains("Cannot find device") => {
            debug!(link = %name, "link already removed");
            Ok(())
        }
        other => other.map(|_| ()),
    }
}
