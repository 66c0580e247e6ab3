//! Per-cluster credential agent.
//!
//! A fresh keypair is generated into a private temp dir and loaded into an
//! `ssh-agent` listening on a socket in that dir. Clients authenticate via
//! the agent socket; the private key never leaves the dir.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::SshConfig;
use crate::error::{Error, ErrorList, Result, ResultExt};
use crate::network::Dialer;
use crate::ssh::SshClient;
use crate::utils::{run_tool, wait_for_path};

const AGENT_SOCKET: &str = "agent.sock";
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Agent {
    dialer: Arc<dyn Dialer>,
    user: String,
    socket: PathBuf,
    public_key: String,
    dir: Mutex<Option<TempDir>>,
    process: tokio::sync::Mutex<Option<Child>>,
}

impl Agent {
    /// Generate a keypair, start the agent and load the key into it.
    pub async fn new(
        dialer: Arc<dyn Dialer>,
        temp_root: &Path,
        config: &SshConfig,
    ) -> Result<Self> {
        // TempDir is created 0700
        let dir = tempfile::Builder::new()
            .prefix("vmfabric-agent-")
            .tempdir_in(temp_root)
            .resource(format_args!("creating agent dir in {}", temp_root.display()))?;

        let key_path = dir.path().join(format!("id_{}", config.key_type));
        run_tool(
            "ssh-keygen",
            Command::new("ssh-keygen")
                .args(["-q", "-t", &config.key_type, "-N", "", "-C", "vmfabric", "-f"])
                .arg(&key_path)
                .stdin(Stdio::null()),
        )
        .await?;

        let public_key = tokio::fs::read_to_string(key_path.with_extension("pub"))
            .await
            .resource("reading public key")?
            .trim()
            .to_string();

        let socket = dir.path().join(AGENT_SOCKET);
        let mut child = Command::new("ssh-agent")
            .arg("-D")
            .arg("-a")
            .arg(&socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .resource("spawning ssh-agent")?;

        if let Err(e) = wait_for_path(&socket, SOCKET_TIMEOUT).await {
            let _ = child.start_kill();
            return Err(e);
        }

        let added = run_tool(
            "ssh-add",
            Command::new("ssh-add")
                .arg(&key_path)
                .env("SSH_AUTH_SOCK", &socket)
                .stdin(Stdio::null()),
        )
        .await;
        if let Err(e) = added {
            let _ = child.start_kill();
            return Err(e);
        }

        info!(socket = %socket.display(), pid = ?child.id(), "credential agent ready");
        Ok(Self {
            dialer,
            user: config.user.clone(),
            socket,
            public_key,
            dir: Mutex::new(Some(dir)),
            process: tokio::sync::Mutex::new(Some(child)),
        })
    }

    /// Socket to forward or export as `SSH_AUTH_SOCK`
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Public key in authorized_keys format
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Guest account the key logs in as
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Client for `host` using the agent's key and the configured user.
    pub fn client(&self, host: IpAddr) -> SshClient {
        SshClient::with_agent(self.dialer.clone(), host, &self.user, &self.socket)
    }

    /// Client for `host` authenticating with a password instead of the key.
    pub fn password_client(&self, host: IpAddr, user: &str, password: &str) -> SshClient {
        SshClient::with_password(self.dialer.clone(), host, user, password)
    }

    /// Stop the agent and remove the key material. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut errors = ErrorList::new();

        if let Some(mut child) = self.process.lock().await.take() {
            errors.check("signaling ssh-agent", child.start_kill());
            errors.check("waiting for ssh-agent", child.wait().await);
        }

        let dir = self
            .dir
            .lock()
            .map_err(|_| Error::Resource("agent dir lock poisoned".into()))?
            .take();
        if let Some(dir) = dir {
            debug!(dir = %dir.path().display(), "removing agent dir");
            errors.check("removing agent dir", dir.close());
        }

        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::HostDialer;

    fn have(tool: &str) -> bool {
        std::process::Command::new("sh")
            .args(["-c", &format!("command -v {}", tool)])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_agent_lifecycle() {
        if !have("ssh-keygen") || !have("ssh-agent") || !have("ssh-add") {
            eprintln!("Skipping test_agent_lifecycle - openssh client tools not installed");
            return;
        }

        let root = tempfile::tempdir().unwrap();
        let agent = Agent::new(Arc::new(HostDialer), root.path(), &SshConfig::default())
            .await
            .unwrap();

        assert!(agent.public_key().starts_with("ssh-ed25519 "));
        assert!(agent.socket().exists());

        let listed = Command::new("ssh-add")
            .arg("-l")
            .env("SSH_AUTH_SOCK", agent.socket())
            .output()
            .await
            .unwrap();
        assert!(listed.status.success());

        let dir = agent.socket().parent().unwrap().to_path_buf();
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        agent.close().await.unwrap();
        assert!(!dir.exists());
        agent.close().await.unwrap();
    }
}
