//! Passing descriptors to the hypervisor at fixed numbers.
//!
//! Descriptor `i` lands at `3 + i` in the child. Before forking, each source
//! is duplicated above the target range with CLOEXEC so `dup2` in the child
//! never clobbers a source that is still needed; the copies vanish at exec.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg};
use tokio::process::Command;

use crate::error::{Result, ResultExt};

/// First descriptor number after stdio
pub const FIRST_EXTRA_FD: RawFd = 3;

#[derive(Default)]
pub struct ExtraFiles {
    files: Vec<OwnedFd>,
}

impl ExtraFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a descriptor; returns the number it will have in the child.
    pub fn push(&mut self, fd: OwnedFd) -> RawFd {
        self.files.push(fd);
        FIRST_EXTRA_FD + (self.files.len() as RawFd - 1)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Arrange for the queued descriptors to appear in the child spawned
    /// from `cmd`. The originals stay owned here.
    pub fn install(&self, cmd: &mut Command) -> Result<()> {
        let floor = FIRST_EXTRA_FD + self.files.len() as RawFd;
        let mut staged = Vec::with_capacity(self.files.len());
        for fd in &self.files {
            let raw = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(floor))
                .resource("staging descriptor for child")?;
            // SAFETY: fcntl just returned a fresh descriptor we now own
            staged.push(unsafe { OwnedFd::from_raw_fd(raw) });
        }

        // SAFETY: dup2 is async-signal-safe; the closure only reads
        // descriptors it owns.
        unsafe {
            cmd.pre_exec(move || {
                for (i, src) in staged.iter().enumerate() {
                    let target = FIRST_EXTRA_FD + i as RawFd;
                    if libc::dup2(src.as_raw_fd(), target) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, Write};

    #[test]
    fn test_push_numbers() {
        let mut extra = ExtraFiles::new();
        let a = tempfile::tempfile().unwrap();
        let b = tempfile::tempfile().unwrap();
        assert_eq!(extra.push(OwnedFd::from(a)), 3);
        assert_eq!(extra.push(OwnedFd::from(b)), 4);
        assert_eq!(extra.len(), 2);
    }

    #[tokio::test]
    async fn test_child_sees_descriptors() {
        let mut first = tempfile::tempfile().unwrap();
        first.write_all(b"disk-a").unwrap();
        first.rewind().unwrap();
        let mut second = tempfile::tempfile().unwrap();
        second.write_all(b"disk-b").unwrap();
        second.rewind().unwrap();

        let mut extra = ExtraFiles::new();
        extra.push(OwnedFd::from(first));
        extra.push(OwnedFd::from(second));

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "cat <&3; echo; cat <&4"]);
        extra.install(&mut cmd).unwrap();
        let out = cmd.output().await.unwrap();
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        assert_eq!(String::from_utf8_lossy(&out.stdout), "disk-a\ndisk-b");
    }
}
