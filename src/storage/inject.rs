//! Offline placement of a config payload onto a guest image, for guests
//! whose firmware has no config channel.
//!
//! Drives a `guestfish --listen` daemon through a sequence of remote calls.
//! Every step is named so a failure says which step broke, and the daemon is
//! always told to exit, falling back to a kill.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::InjectConfig;
use crate::error::{Error, Result, ResultExt};
use crate::utils::{graceful_kill, run_tool, run_tool_stdout};

const BOOT_LABEL: &str = "boot";
const ROOT_LABEL: &str = "root";
const LUKS_FSTYPE: &str = "crypto_LUKS";
const LUKS_MAPPING: &str = "root";
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Extract the daemon pid from `guestfish --listen` output, which looks like
/// `GUESTFISH_PID=4513; export GUESTFISH_PID`.
pub fn parse_listen_pid(output: &str) -> Option<u32> {
    let start = output.find("GUESTFISH_PID=")? + "GUESTFISH_PID=".len();
    let digits: String = output[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok().filter(|&pid| pid > 0)
}

/// Parent directory of an absolute guest path, `/` for top-level files.
fn guest_parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

pub struct Injector {
    guestfish: String,
    destination: String,
}

impl Injector {
    pub fn new(config: &InjectConfig) -> Self {
        Self {
            guestfish: config.guestfish.clone(),
            destination: config.destination.clone(),
        }
    }

    /// Where payloads end up inside the guest filesystem
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Upload `payload` into `image`. Running it twice leaves the same file.
    pub async fn inject(&self, payload: &Path, image: &Path) -> Result<()> {
        info!(
            image = %image.display(),
            destination = %self.destination,
            "injecting config offline"
        );

        let session = Session::launch(&self.guestfish, image)
            .await
            .map_err(|e| e.in_step("inject"))?;
        let populated = self.populate(&session, payload).await;
        let exited = session.exit().await;

        populated.map_err(|e| e.in_step("inject"))?;
        exited.map_err(|e| e.in_step("inject"))
    }

    async fn populate(&self, s: &Session, payload: &Path) -> Result<()> {
        s.call("run", &["run"]).await?;
        let boot = s.call("find boot partition", &["findfs-label", BOOT_LABEL]).await?;

        match s.call("find root partition", &["findfs-partlabel", ROOT_LABEL]).await {
            Ok(part) => {
                let fstype = s.call("probe root filesystem", &["vfs-type", &part]).await?;
                if fstype == LUKS_FSTYPE {
                    debug!(partition = %part, "unlocking encrypted root");
                    s.call_with_key("unlock root", &["luks-open", &part, LUKS_MAPPING])
                        .await?;
                }
            }
            // Images without a GPT label carry the filesystem label only
            Err(e) => debug!(error = %e, "no root partition label, using filesystem label"),
        }

        let root = s.call("find root filesystem", &["findfs-label", ROOT_LABEL]).await?;
        s.call("mount root", &["mount", &root, "/"]).await?;
        s.call("mount boot", &["mount", &boot, "/boot"]).await?;
        s.call("create destination dir", &["mkdir-p", guest_parent(&self.destination)])
            .await?;

        let payload = payload.to_string_lossy();
        s.call("upload config", &["upload", &payload, &self.destination])
            .await?;
        s.call("unmount", &["umount-all"]).await?;
        Ok(())
    }
}

struct Session {
    guestfish: String,
    pid: u32,
    ended: bool,
}

impl Session {
    async fn launch(guestfish: &str, image: &Path) -> Result<Self> {
        let stdout = run_tool_stdout(
            "launch",
            Command::new(guestfish)
                .args(["--listen", "-a"])
                .arg(image)
                .env("LIBGUESTFS_BACKEND", "direct")
                .stdin(Stdio::null()),
        )
        .await?;
        let pid = parse_listen_pid(&stdout)
            .ok_or_else(|| Error::tool("launch", format!("unexpected output: {}", stdout)))?;
        debug!(pid = pid, "guestfish daemon listening");

        Ok(Self {
            guestfish: guestfish.to_string(),
            pid,
            ended: false,
        })
    }

    fn remote(&self) -> Command {
        let mut cmd = Command::new(&self.guestfish);
        cmd.arg(format!("--remote={}", self.pid));
        cmd
    }

    async fn call(&self, step: &str, args: &[&str]) -> Result<String> {
        run_tool_stdout(step, self.remote().arg("--").args(args)).await
    }

    /// Call with an empty key supplied on stdin.
    async fn call_with_key(&self, step: &str, args: &[&str]) -> Result<()> {
        let mut child = self
            .remote()
            .arg("--keys-from-stdin")
            .arg("--")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .resource(format_args!("spawning {}", step))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(b"\n").await.resource("writing key")?;
        }
        let output = child.wait_with_output().await.resource(format_args!("waiting for {}", step))?;
        if !output.status.success() {
            return Err(Error::tool(step, String::from_utf8_lossy(&output.stderr)));
        }
        Ok(())
    }

    async fn exit(mut self) -> Result<()> {
        self.ended = true;
        let res = run_tool("exit", self.remote().args(["--", "exit"])).await;
        if let Err(e) = &res {
            warn!(pid = self.pid, error = %e, "guestfish did not exit cleanly, killing");
            graceful_kill(self.pid, KILL_TIMEOUT).await;
        }
        res.map(|_| ())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.ended {
            let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_pid() {
        assert_eq!(
            parse_listen_pid("GUESTFISH_PID=4513; export GUESTFISH_PID\n"),
            Some(4513)
        );
        assert_eq!(parse_listen_pid("GUESTFISH_PID=77"), Some(77));
        assert_eq!(parse_listen_pid("libguestfs: error: no kernel"), None);
        assert_eq!(parse_listen_pid("GUESTFISH_PID=; export"), None);
        assert_eq!(parse_listen_pid("GUESTFISH_PID=0"), None);
    }

    #[test]
    fn test_guest_parent() {
        assert_eq!(guest_parent("/boot/ignition/config.ign"), "/boot/ignition");
        assert_eq!(guest_parent("/config.ign"), "/");
        assert_eq!(guest_parent("config.ign"), "/");
    }

    #[tokio::test]
    async fn test_launch_failure_names_step() {
        let injector = Injector::new(&InjectConfig {
            guestfish: "false".to_string(),
            destination: "/boot/ignition/config.ign".to_string(),
        });
        let err = injector
            .inject(Path::new("/nonexistent.ign"), Path::new("/nonexistent.qcow2"))
            .await
            .unwrap_err();
        match err {
            Error::ToolFailure { step, .. } => assert_eq!(step, "inject: launch"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
