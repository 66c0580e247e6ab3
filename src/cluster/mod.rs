//! Cluster lifecycle: one sandbox with its fabric, services and agent, plus
//! the machines launched into it.
//!
//! Construction walks `Empty -> SandboxReady -> ServicesReady`, pushing a
//! release action for every resource it acquires. A failure on the way
//! unwinds those actions and nothing is left behind. Destroy tears down
//! machines first, then services, then the sandbox.

pub mod payload;
pub mod roster;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cleanup::CleanupStack;
use crate::config::Config;
use crate::error::{Error, ErrorList, Result, ResultExt};
use crate::network::{Dialer, Fabric, Sandbox};
use crate::qemu::{arch, Arch, LaunchRequest, Launcher, Machine};
use crate::services::{DiscoveryService, NtpServer};
use crate::ssh::Agent;
use crate::storage::{DiskPreparer, DiskSpec};

pub use payload::{ConfigPayload, PayloadEncoding, DISCOVERY_TOKEN};
pub use roster::{Member, Roster};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Empty,
    SandboxReady,
    ServicesReady,
    Populated(usize),
    Destroyed,
}

/// What to launch. The first disk boots.
#[derive(Debug, Clone, Default)]
pub struct MachineOptions {
    /// Guest architecture; the host's when unset
    pub guest: Option<Arch>,
    pub disks: Vec<DiskSpec>,
    /// First-boot config; a blank one when unset. The cluster key is added
    /// either way.
    pub config: Option<ConfigPayload>,
    /// Bridge to attach to; the primary segment when unset
    pub segment: Option<String>,
}

impl MachineOptions {
    /// A machine booting from a copy-on-write overlay of `image`.
    pub fn from_image(image: impl Into<PathBuf>) -> Self {
        Self {
            disks: vec![DiskSpec::overlay(image)],
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: ConfigPayload) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_guest(mut self, guest: Arch) -> Self {
        self.guest = Some(guest);
        self
    }

    pub fn with_disk(mut self, disk: DiskSpec) -> Self {
        self.disks.push(disk);
        self
    }

    pub fn on_segment(mut self, bridge: impl Into<String>) -> Self {
        self.segment = Some(bridge.into());
        self
    }
}

struct Inner {
    id: Uuid,
    host: Arch,
    config: Config,
    workdir: PathBuf,
    sandbox: Arc<Sandbox>,
    fabric: Arc<Fabric>,
    primary: String,
    gateway: IpAddr,
    discovery: Arc<DiscoveryService>,
    agent: Arc<Agent>,
    disks: DiskPreparer,
    launcher: Launcher,
    roster: Roster<Machine>,
    /// Release actions for everything but the machines, in acquisition order
    teardown: Mutex<CleanupStack>,
    destroyed: AtomicBool,
}

/// Handle to a running cluster. Cheap to clone; every clone refers to the
/// same cluster.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<Inner>,
}

impl Cluster {
    /// Bring up the sandbox, the primary segment, NTP, discovery and the
    /// credential agent.
    pub async fn new(config: Config) -> Result<Self> {
        let host = Arch::host()?;
        let id = Uuid::new_v4();
        let mut undo = CleanupStack::new();

        match Self::build(id, host, config, &mut undo).await {
            Ok(mut inner) => {
                inner.teardown = Mutex::new(std::mem::take(&mut undo));
                info!(
                    cluster = %id,
                    bridge = %inner.primary,
                    discovery = %inner.discovery.endpoint(),
                    state = ?ClusterState::ServicesReady,
                    "cluster ready"
                );
                Ok(Self {
                    inner: Arc::new(inner),
                })
            }
            Err(e) => {
                warn!(cluster = %id, error = %e, "cluster setup failed, unwinding");
                if let Err(cleanup) = undo.unwind().await {
                    warn!(cluster = %id, error = %cleanup, "cluster unwind incomplete");
                }
                debug!(cluster = %id, state = ?ClusterState::Empty, "unwound");
                Err(e)
            }
        }
    }

    async fn build(id: Uuid, host: Arch, config: Config, undo: &mut CleanupStack) -> Result<Inner> {
        let root = &config.paths.temp_dir;
        let dir = tempfile::Builder::new()
            .prefix("vmfabric-")
            .tempdir_in(root)
            .resource(format_args!("creating cluster dir in {}", root.display()))?;
        let workdir = dir.path().to_path_buf();
        undo.push("remove cluster dir", move || async move {
            dir.close().resource("removing cluster dir")
        });

        let sandbox = Arc::new(Sandbox::create().await?);
        let s = sandbox.clone();
        undo.push("destroy sandbox", move || async move {
            s.destroy();
            Ok(())
        });
        debug!(cluster = %id, state = ?ClusterState::SandboxReady, "sandbox up");

        let fabric = Arc::new(Fabric::new(sandbox.clone(), config.network.clone(), &workdir));
        let f = fabric.clone();
        undo.push("destroy fabric", move || async move { f.destroy().await });
        let primary = fabric.bridge_name(0);
        let segment = fabric.new_segment(&primary).await?;
        let gateway = IpAddr::V4(segment.addressing().bridge_ip());

        let ntp = Arc::new(NtpServer::start(&sandbox).await?);
        let n = ntp.clone();
        undo.push("stop ntp", move || async move { n.stop() });

        let discovery = Arc::new(DiscoveryService::start(&sandbox, gateway, &workdir).await?);
        let d = discovery.clone();
        undo.push("stop discovery", move || async move { d.stop().await });

        let dialer: Arc<dyn Dialer> = sandbox.clone();
        let agent = Arc::new(Agent::new(dialer, &workdir, &config.ssh).await?);
        let a = agent.clone();
        undo.push("close agent", move || async move { a.close().await });

        Ok(Inner {
            id,
            host,
            disks: DiskPreparer::new(&workdir, &config.qemu, &config.inject),
            launcher: Launcher::new(host, config.qemu.clone()),
            config,
            workdir,
            sandbox,
            fabric,
            primary,
            gateway,
            discovery,
            agent,
            roster: Roster::new(),
            teardown: Mutex::new(CleanupStack::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn host(&self) -> Arch {
        self.inner.host
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.inner.sandbox
    }

    pub fn discovery(&self) -> &DiscoveryService {
        &self.inner.discovery
    }

    pub fn agent(&self) -> &Agent {
        &self.inner.agent
    }

    /// Bridge of the segment created with the cluster
    pub fn primary_segment(&self) -> &str {
        &self.inner.primary
    }

    /// Address of the primary bridge, where discovery listens
    pub fn gateway(&self) -> IpAddr {
        self.inner.gateway
    }

    pub fn workdir(&self) -> &Path {
        &self.inner.workdir
    }

    pub async fn state(&self) -> ClusterState {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return ClusterState::Destroyed;
        }
        match self.inner.roster.len().await {
            0 => ClusterState::ServicesReady,
            n => ClusterState::Populated(n),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Resource(format!("cluster {} is destroyed", self.inner.id)));
        }
        Ok(())
    }

    /// Add another bridge with its own responder and address range.
    /// Returns the bridge name to pass in [`MachineOptions::segment`].
    pub async fn new_segment(&self) -> Result<String> {
        self.ensure_live()?;
        let index = self.inner.fabric.bridges().await.len();
        let index = u8::try_from(index)
            .map_err(|_| Error::Resource("no segment index left".to_string()))?;
        let bridge = self.inner.fabric.bridge_name(index);
        self.inner.fabric.new_segment(&bridge).await?;
        Ok(bridge)
    }

    /// Discovery URL for a cluster of `size` members, ready to substitute
    /// for [`DISCOVERY_TOKEN`].
    pub async fn discovery_url(&self, size: usize) -> Result<String> {
        self.ensure_live()?;
        self.inner.discovery.allocate_discovery_url(size).await
    }

    /// Launch one machine and add it to the roster.
    pub async fn new_machine(&self, options: MachineOptions) -> Result<Arc<Machine>> {
        self.ensure_live()?;
        let machine = Arc::new(self.launch(options).await?);
        self.inner.roster.register(machine.clone()).await;
        Ok(machine)
    }

    /// Launch several machines concurrently. Either all of them end up in
    /// the roster or none do.
    pub async fn new_machines(&self, options: Vec<MachineOptions>) -> Result<Vec<Arc<Machine>>> {
        self.ensure_live()?;
        let count = options.len();
        let machines = self
            .inner
            .roster
            .launch_all(options, |opts| {
                let cluster = self.clone();
                async move { cluster.launch(opts).await.map(Arc::new) }
            })
            .await?;
        info!(cluster = %self.inner.id, count = count, "machines launched");
        Ok(machines)
    }

    async fn launch(&self, options: MachineOptions) -> Result<Machine> {
        let inner = &self.inner;
        let guest = options.guest.unwrap_or(inner.host);
        arch::profile(inner.host, guest)?;
        if options.disks.is_empty() {
            return Err(Error::Configuration("machine needs at least one disk".to_string()));
        }
        for disk in &options.disks {
            disk.validate()?;
        }
        // Every guest gets the cluster key, with or without a config of its own
        let agent = &inner.agent;
        let payload = options
            .config
            .clone()
            .unwrap_or_else(ConfigPayload::blank)
            .authorize(agent.user(), agent.public_key())?;

        let id = Uuid::new_v4();
        let workdir = tempfile::Builder::new()
            .prefix(&format!("machine-{}-", id.simple()))
            .tempdir_in(&inner.workdir)
            .resource("creating machine dir")?;

        let (config, inject) = payload.stage(workdir.path(), guest).await?;

        let mut disks = Vec::with_capacity(options.disks.len());
        for (i, spec) in options.disks.iter().enumerate() {
            // Only the boot disk carries the payload
            let payload = if i == 0 { inject.as_deref() } else { None };
            disks.push(inner.disks.prepare(spec, payload, guest).await?);
        }

        let bridge = options.segment.as_deref().unwrap_or(&inner.primary);
        let tap = inner.fabric.allocate_tap(bridge).await?;

        let console_dir = inner
            .config
            .paths
            .console_dir
            .clone()
            .unwrap_or_else(|| inner.workdir.clone());
        let console = console_dir.join(format!("{}.console", id));

        inner
            .launcher
            .launch(
                &*inner.sandbox,
                LaunchRequest {
                    id,
                    guest,
                    disks,
                    tap,
                    console,
                    config,
                    workdir: Some(workdir),
                },
            )
            .await
    }

    /// Live machines in launch order
    pub async fn machines(&self) -> Vec<Arc<Machine>> {
        self.inner.roster.list().await
    }

    pub async fn machine(&self, id: Uuid) -> Result<Arc<Machine>> {
        self.inner
            .roster
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("machine {}", id)))
    }

    /// Stop one machine and drop it from the roster.
    pub async fn destroy_machine(&self, id: Uuid) -> Result<()> {
        self.inner.roster.destroy_member(id).await
    }

    /// Run `command` on `machine` over SSH with the cluster's key.
    ///
    /// Output is returned even when the command fails.
    pub async fn ssh(&self, machine: &Machine, command: &str) -> (Vec<u8>, Result<()>) {
        let client = self.inner.agent.client(IpAddr::V4(machine.ip()));
        match client.run(command).await {
            Ok(out) => {
                let result = if out.success() {
                    Ok(())
                } else {
                    Err(Error::tool(
                        format!("ssh {}", machine.hostname()),
                        String::from_utf8_lossy(&out.stderr),
                    ))
                };
                (out.stdout, result)
            }
            Err(e) => (Vec::new(), Err(e)),
        }
    }

    /// Wait until `machine` accepts SSH logins, within the configured retry
    /// window. Fails early if the hypervisor exits meanwhile.
    pub async fn wait_for_ssh(&self, machine: &Machine) -> Result<()> {
        let timeout = Duration::from_secs(self.inner.config.ssh.retry_secs);
        let client = self.inner.agent.client(IpAddr::V4(machine.ip()));
        tokio::select! {
            res = client.wait_ready(timeout) => res,
            status = machine.wait_exit() => Err(Error::Anomaly(format!(
                "machine {} exited before ssh came up: {}",
                machine.id(),
                status.map(|s| s.to_string()).unwrap_or_else(|| "unknown status".to_string())
            ))),
        }
    }

    /// Tear everything down, machines first. Safe to call more than once;
    /// later calls do nothing.
    pub async fn destroy(&self) -> Result<()> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut errors = ErrorList::new();
        if let Err(e) = self.inner.roster.destroy_all().await {
            errors.extend_from("machines", e);
        }
        if let Err(e) = self.inner.teardown.lock().await.unwind().await {
            errors.extend_from("cluster", e);
        }

        if errors.is_empty() {
            info!(cluster = %self.inner.id, state = ?ClusterState::Destroyed, "cluster destroyed");
        } else {
            warn!(cluster = %self.inner.id, errors = errors.len(), "cluster destroyed with errors");
        }
        errors.into_result()
    }
}
