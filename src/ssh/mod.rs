//! SSH access to guests through the system `ssh` client.
//!
//! Commands run wherever the [`Dialer`] places them, which for a cluster is
//! inside its sandbox, so guest addresses resolve without host routes.

pub mod agent;

pub use agent::Agent;

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result, ResultExt};
use crate::network::Dialer;

pub const SSH_PORT: u16 = 22;

/// Options shared by every invocation. Guest host keys change on every boot
/// so they are neither checked nor recorded.
#[rustfmt::skip]
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "ConnectTimeout=10",
];

#[derive(Debug, Clone)]
enum Auth {
    Agent(PathBuf),
    Password(String),
}

/// Captured result of one remote command
#[derive(Debug)]
pub struct SshOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl SshOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Convert a non-zero exit into a tool failure named after `step`.
    pub fn check(self, step: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::tool(step, String::from_utf8_lossy(&self.stderr)))
        }
    }
}

#[derive(Clone)]
pub struct SshClient {
    dialer: Arc<dyn Dialer>,
    host: IpAddr,
    user: String,
    auth: Auth,
}

impl SshClient {
    pub fn with_agent(dialer: Arc<dyn Dialer>, host: IpAddr, user: &str, socket: &Path) -> Self {
        Self {
            dialer,
            host,
            user: user.to_string(),
            auth: Auth::Agent(socket.to_path_buf()),
        }
    }

    pub fn with_password(
        dialer: Arc<dyn Dialer>,
        host: IpAddr,
        user: &str,
        password: &str,
    ) -> Self {
        Self {
            dialer,
            host,
            user: user.to_string(),
            auth: Auth::Password(password.to_string()),
        }
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// Program and arguments for running `remote` on the guest.
    fn argv(&self, remote: &str) -> (&'static str, Vec<String>) {
        let mut args: Vec<String> = Vec::new();
        let program = match &self.auth {
            Auth::Agent(_) => "ssh",
            Auth::Password(_) => {
                // sshpass reads the password from $SSHPASS
                args.extend(["-e".to_string(), "ssh".to_string()]);
                "sshpass"
            }
        };
        args.extend(SSH_OPTS.iter().map(|s| s.to_string()));
        match &self.auth {
            Auth::Agent(_) => args.extend(["-o".into(), "BatchMode=yes".into()]),
            Auth::Password(_) => args.extend([
                "-o".into(),
                "PubkeyAuthentication=no".into(),
                "-o".into(),
                "PreferredAuthentications=password,keyboard-interactive".into(),
            ]),
        }
        args.push(format!("{}@{}", self.user, self.host));
        args.push("--".into());
        args.push(remote.to_string());
        (program, args)
    }

    fn command(&self, remote: &str) -> Result<Command> {
        let (program, args) = self.argv(remote);
        let mut cmd = self.dialer.command(program)?;
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &self.auth {
            Auth::Agent(socket) => {
                cmd.env("SSH_AUTH_SOCK", socket);
            }
            Auth::Password(password) => {
                cmd.env("SSHPASS", password).env_remove("SSH_AUTH_SOCK");
            }
        }
        Ok(cmd)
    }

    /// Run `remote` and capture its output. Only a failure to run the client
    /// at all is an error; the exit status is returned to the caller.
    pub async fn run(&self, remote: &str) -> Result<SshOutput> {
        debug!(host = %self.host, command = %remote, "ssh");
        let output = self
            .command(remote)?
            .output()
            .await
            .resource("spawning ssh client")?;
        Ok(SshOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Wait until the guest's SSH port accepts connections.
    pub async fn wait_for_port(&self, timeout: Duration) -> Result<()> {
        let addr = SocketAddr::new(self.host, SSH_PORT);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let attempt =
                tokio::time::timeout(Duration::from_secs(2), self.dialer.dial(addr)).await;
            if let Ok(Ok(_)) = attempt {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "ssh port on {} not reachable within {}s",
                    self.host,
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Wait until a trivial command succeeds, which implies the guest has
    /// accepted our credentials.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        self.wait_for_port(timeout).await?;
        loop {
            let last = match self.run("true").await {
                Ok(out) if out.success() => return Ok(()),
                Ok(out) => String::from_utf8_lossy(&out.stderr).trim().to_string(),
                Err(e) => e.to_string(),
            };
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "ssh login to {} not accepted: {}",
                    self.host, last
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
