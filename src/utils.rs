//! Helpers for driving external tools and supervising child processes.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Check if a process is alive by checking /proc/{pid} existence.
pub fn is_process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// Send SIGTERM, wait up to `timeout`, then SIGKILL.
///
/// Used for helpers that are not our children (the guestfish daemon forks
/// away from its launcher) so there is no handle to wait on.
pub async fn graceful_kill(pid: u32, timeout: Duration) {
    let target = Pid::from_raw(pid as i32);
    if kill(target, Signal::SIGTERM).is_err() {
        return;
    }

    let interval = Duration::from_millis(100);
    let iterations = (timeout.as_millis() / 100).max(1);
    for _ in 0..iterations {
        if !is_process_alive(pid) {
            return;
        }
        tokio::time::sleep(interval).await;
    }

    debug!(pid = pid, "process ignored SIGTERM, sending SIGKILL");
    let _ = kill(target, Signal::SIGKILL);
}

/// Run a helper to completion, mapping a spawn failure to a resource error
/// and a non-zero exit to a tool failure named after `step`.
pub async fn run_tool(step: &str, cmd: &mut Command) -> Result<Output> {
    debug!(step = %step, command = ?cmd.as_std(), "running");

    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::resource(format!("spawning {}", step), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::tool(step, stderr));
    }
    Ok(output)
}

/// Run a helper and return its trimmed stdout.
pub async fn run_tool_stdout(step: &str, cmd: &mut Command) -> Result<String> {
    let output = run_tool(step, cmd).await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Long-running helpers whose output is forwarded into the log, each under
/// its own target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildLog {
    Dnsmasq,
    Qemu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

fn emit(source: ChildLog, stream: Stream, instance: &str, line: &str) {
    let s = stream.as_str();
    match (source, stream) {
        (ChildLog::Qemu, Stream::Stderr) => {
            warn!(target: "qemu", machine = %instance, stream = s, "{}", line)
        }
        (ChildLog::Qemu, Stream::Stdout) => {
            info!(target: "qemu", machine = %instance, stream = s, "{}", line)
        }
        (ChildLog::Dnsmasq, _) => {
            debug!(target: "dnsmasq", bridge = %instance, stream = s, "{}", line)
        }
    }
}

/// Forward each line of a child's output into the log. `instance` names
/// the machine or bridge the child belongs to.
pub fn forward_lines<R>(reader: R, source: ChildLog, stream: Stream, instance: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => emit(source, stream, &instance, &line),
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        source = ?source,
                        instance = %instance,
                        error = %e,
                        "output stream error"
                    );
                    break;
                }
            }
        }
    });
}

/// Poll until `path` exists.
pub async fn wait_for_path(path: &Path, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !path.exists() {
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "waiting for {} to appear",
                path.display()
            )));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}
