//! Private network namespace owned by one cluster.
//!
//! The namespace is created by a dedicated thread that unshares and then
//! exits, so no runtime worker ever changes namespace. Work that must happen
//! inside (binding sockets, opening taps) runs on a fresh thread that joins
//! the namespace and exits when done. Children join it in `pre_exec`.

use std::fs::File;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::sched::{setns, unshare, CloneFlags};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::{Error, Result, ResultExt};
use crate::network::Dialer;
use crate::utils::run_tool;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Sandbox {
    ns: Mutex<Option<Arc<OwnedFd>>>,
}

impl Sandbox {
    /// Create a new namespace with its loopback up.
    pub async fn create() -> Result<Self> {
        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("netns-create".into())
            .spawn(move || {
                let res = unshare(CloneFlags::CLONE_NEWNET)
                    .resource("unshare(CLONE_NEWNET)")
                    .and_then(|()| {
                        File::open("/proc/thread-self/ns/net")
                            .map(OwnedFd::from)
                            .resource("opening namespace handle")
                    });
                let _ = tx.send(res);
            })
            .resource("spawning namespace thread")?;

        let fd = rx
            .await
            .map_err(|_| Error::Resource("namespace thread exited early".into()))??;

        let sandbox = Sandbox {
            ns: Mutex::new(Some(Arc::new(fd))),
        };
        run_tool(
            "ip link set lo up",
            sandbox.command("ip")?.args(["link", "set", "lo", "up"]),
        )
        .await?;

        info!(fd = sandbox.raw_fd().unwrap_or(-1), "network sandbox created");
        Ok(sandbox)
    }

    fn handle(&self) -> Result<Arc<OwnedFd>> {
        self.ns
            .lock()
            .map_err(|_| Error::Resource("sandbox lock poisoned".into()))?
            .clone()
            .ok_or_else(|| Error::NotFound("sandbox already destroyed".into()))
    }

    fn raw_fd(&self) -> Option<i32> {
        self.handle().ok().map(|fd| fd.as_raw_fd())
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle().is_err()
    }

    /// A command whose child joins the namespace before exec.
    pub fn command(&self, program: &str) -> Result<Command> {
        let ns = self.handle()?;
        let mut cmd = Command::new(program);
        // SAFETY: setns is async-signal-safe and the closure only touches
        // the descriptor it owns.
        unsafe {
            cmd.pre_exec(move || {
                setns(&*ns, CloneFlags::CLONE_NEWNET).map_err(std::io::Error::from)
            });
        }
        Ok(cmd)
    }

    /// Run `work` on a fresh thread that has joined the namespace.
    pub async fn run_in<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let ns = self.handle()?;
        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("netns-worker".into())
            .spawn(move || {
                let res = setns(&*ns, CloneFlags::CLONE_NEWNET)
                    .map_err(std::io::Error::from)
                    .and_then(|()| work());
                let _ = tx.send(res);
            })
            .resource("spawning namespace worker")?;

        rx.await
            .map_err(|_| Error::Resource("namespace worker panicked".into()))?
            .map_err(Error::Io)
    }

    /// Bind a TCP listener inside the namespace. The socket stays bound to
    /// this namespace after the worker thread exits.
    pub async fn bind_tcp(&self, addr: SocketAddr) -> Result<TcpListener> {
        let listener = self
            .run_in(move || TcpListener::bind(addr))
            .await
            .map_err(|e| Error::resource(format!("binding tcp {}", addr), e))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    pub async fn bind_udp(&self, addr: SocketAddr) -> Result<UdpSocket> {
        let socket = self
            .run_in(move || UdpSocket::bind(addr))
            .await
            .map_err(|e| Error::resource(format!("binding udp {}", addr), e))?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// Drop the namespace handle. Idempotent; the kernel frees the namespace
    /// once no process or descriptor references it.
    pub fn destroy(&self) {
        if let Ok(mut guard) = self.ns.lock() {
            if guard.take().is_some() {
                debug!("network sandbox handle closed");
            }
        }
    }
}

#[async_trait]
impl Dialer for Sandbox {
    fn command(&self, program: &str) -> Result<Command> {
        Sandbox::command(self, program)
    }

    async fn dial(&self, addr: SocketAddr) -> Result<tokio::net::TcpStream> {
        let stream = self
            .run_in(move || TcpStream::connect_timeout(&addr, DIAL_TIMEOUT))
            .await?;
        stream.set_nonblocking(true)?;
        Ok(tokio::net::TcpStream::from_std(stream)?)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_root() -> bool {
        unsafe { libc::geteuid() == 0 }
    }

    #[tokio::test]
    async fn test_command_runs_inside_namespace() {
        if !is_root() {
            eprintln!("Skipping test_command_runs_inside_namespace - requires root");
            return;
        }

        let sandbox = Sandbox::create().await.unwrap();
        let output = run_tool(
            "ip link show",
            sandbox.command("ip").unwrap().args(["-o", "link", "show"]),
        )
        .await
        .unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let links: Vec<&str> = stdout.lines().collect();
        // A fresh namespace only has loopback
        assert_eq!(links.len(), 1, "unexpected links: {stdout}");
        assert!(links[0].contains("lo:"));
        assert!(links[0].contains("UP"));

        sandbox.destroy();
    }

    #[tokio::test]
    async fn test_run_in_sees_other_namespace() {
        if !is_root() {
            eprintln!("Skipping test_run_in_sees_other_namespace - requires root");
            return;
        }

        let host_ns = std::fs::read_link("/proc/self/ns/net").unwrap();
        let sandbox = Sandbox::create().await.unwrap();
        let inner = sandbox
            .run_in(|| std::fs::read_link("/proc/thread-self/ns/net"))
            .await
            .unwrap();
        assert_ne!(host_ns, inner);

        // The calling thread never moved
        assert_eq!(std::fs::read_link("/proc/self/ns/net").unwrap(), host_ns);
    }

    #[tokio::test]
    async fn test_listen_and_dial_inside() {
        if !is_root() {
            eprintln!("Skipping test_listen_and_dial_inside - requires root");
            return;
        }

        let sandbox = Sandbox::create().await.unwrap();
        let listener = sandbox.bind_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let _stream = sandbox.dial(addr).await.unwrap();
        accept.await.unwrap().unwrap();

        // The same port on host loopback is not ours
        assert!(std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        if !is_root() {
            eprintln!("Skipping test_destroy_is_idempotent - requires root");
            return;
        }

        let sandbox = Sandbox::create().await.unwrap();
        sandbox.destroy();
        sandbox.destroy();
        assert!(sandbox.is_destroyed());
        assert!(matches!(sandbox.command("true"), Err(Error::NotFound(_))));
    }
}
