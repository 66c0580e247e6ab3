//! A running guest and the task that watches its hypervisor process.

use std::net::Ipv4Addr;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorList, Result, ResultExt};
use crate::network::{MacAddr, Tap};
use crate::qemu::arch::Arch;
use crate::qemu::fdset::ExtraFiles;

/// How long destroy waits for the hypervisor to go away
pub const DESTROY_GRACE: Duration = Duration::from_secs(10);
/// How long SIGTERM is given before SIGKILL
const TERM_GRACE: Duration = Duration::from_secs(3);

/// Descriptors and scratch space held for the guest's lifetime.
pub struct MachineResources {
    files: ExtraFiles,
    tap: Tap,
    workdir: Option<TempDir>,
}

impl MachineResources {
    pub fn new(files: ExtraFiles, tap: Tap, workdir: Option<TempDir>) -> Self {
        Self { files, tap, workdir }
    }
}

pub struct Machine {
    id: Uuid,
    guest: Arch,
    ip: Ipv4Addr,
    hostname: String,
    mac: MacAddr,
    tap: String,
    console: PathBuf,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exit: watch::Receiver<Option<ExitStatus>>,
    resources: Mutex<Option<MachineResources>>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("guest", &self.guest)
            .field("ip", &self.ip)
            .field("tap", &self.tap)
            .field("pid", &self.pid)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Machine {
    /// Take ownership of a freshly spawned hypervisor and watch it.
    pub(crate) fn supervise(
        id: Uuid,
        guest: Arch,
        console: PathBuf,
        child: Child,
        resources: MachineResources,
    ) -> Self {
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let pid = child.id();
        let lease = resources.tap.lease().clone();

        tokio::spawn(watch_process(id, child, kill_rx, exit_tx));

        Self {
            id,
            guest,
            ip: lease.ip,
            hostname: lease.hostname,
            mac: lease.mac,
            tap: resources.tap.name().to_string(),
            console,
            pid,
            started_at: Utc::now(),
            kill: Mutex::new(Some(kill_tx)),
            exit: exit_rx,
            resources: Mutex::new(Some(resources)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn guest(&self) -> Arch {
        self.guest
    }

    /// Address reserved for the guest on its segment
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn tap_name(&self) -> &str {
        &self.tap
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn console_path(&self) -> &Path {
        &self.console
    }

    /// Everything the guest has written to its serial console so far.
    pub async fn console_text(&self) -> Result<String> {
        let bytes = tokio::fs::read(&self.console)
            .await
            .resource(format_args!("reading {}", self.console.display()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit.borrow()
    }

    /// Resolves once the hypervisor is gone. `None` if the watcher lost
    /// track of the process without an exit status.
    pub async fn wait_exit(&self) -> Option<ExitStatus> {
        let mut exit = self.exit.clone();
        let status = exit.wait_for(|s| s.is_some()).await.ok().and_then(|s| *s);
        status
    }

    /// Stop the hypervisor and release the disk, tap and scratch resources.
    /// Safe to call more than once.
    pub async fn destroy(&self) -> Result<()> {
        let mut errors = ErrorList::new();

        let sender = self.kill.lock().ok().and_then(|mut k| k.take());
        if let Some(tx) = sender {
            debug!(machine = %self.id, "stopping machine");
            let _ = tx.send(());
        }

        let mut exit = self.exit.clone();
        match tokio::time::timeout(DESTROY_GRACE, exit.wait_for(|s| s.is_some())).await {
            Ok(Ok(_)) => {}
            // Watcher gone without a status; the process handle went with it
            Ok(Err(_)) => debug!(machine = %self.id, "watcher already finished"),
            Err(_) => errors.push(
                "stop hypervisor",
                Error::Timeout(format!(
                    "machine {} still running after {:?}",
                    self.id, DESTROY_GRACE
                )),
            ),
        }

        let resources = self.resources.lock().ok().and_then(|mut r| r.take());
        if let Some(MachineResources { files, tap, workdir }) = resources {
            drop(files);
            drop(tap);
            if let Some(dir) = workdir {
                errors.check("remove machine dir", dir.close());
            }
            info!(machine = %self.id, "machine destroyed");
        }

        errors.into_result()
    }
}

async fn watch_process(
    id: Uuid,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
) {
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        // Fires on request and when the machine handle is dropped
        _ = &mut kill_rx => (terminate(&mut child).await, true),
    };

    match status {
        Ok(status) => {
            if requested {
                debug!(target: "qemu", machine = %id, status = %status, "hypervisor stopped");
            } else if status.signal().is_none() {
                warn!(
                    target: "qemu",
                    machine = %id,
                    status = %status,
                    "hypervisor exited without being signaled"
                );
            } else {
                info!(
                    target: "qemu",
                    machine = %id,
                    status = %status,
                    "hypervisor killed by signal"
                );
            }
            let _ = exit_tx.send(Some(status));
        }
        Err(e) => warn!(target: "qemu", machine = %id, error = %e, "waiting for hypervisor failed"),
    }
}

async fn terminate(child: &mut Child) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if let Ok(status) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
            return status;
        }
    }
    child.start_kill()?;
    child.wait().await
}
