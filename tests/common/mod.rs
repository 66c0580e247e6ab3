// Common test utilities for vmfabric integration tests
#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use vmfabric::Config;

/// Env var naming a bootable qcow2 image for the end-to-end tests
pub const TEST_IMAGE_ENV: &str = "VMFABRIC_TEST_IMAGE";

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// True if `tool` resolves on $PATH
pub fn have_tool(tool: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
        .unwrap_or(false)
}

/// Bootable image for end-to-end tests, if one was provided.
pub fn test_image() -> Option<PathBuf> {
    std::env::var_os(TEST_IMAGE_ENV)
        .map(PathBuf::from)
        .filter(|p| p.exists())
}

/// Defaults with all scratch space under `root`.
pub fn config_in(root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.paths.temp_dir = root.to_path_buf();
    config
}

/// Names of every link in the current network namespace
pub fn host_links() -> Vec<String> {
    let out = std::process::Command::new("ip")
        .args(["-o", "link", "show"])
        .output()
        .expect("failed to run ip link show");
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter_map(|l| l.split(": ").nth(1))
        .map(|name| name.split('@').next().unwrap_or(name).to_string())
        .collect()
}

/// Write an executable shell script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("writing script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
    path
}

/// Number of live processes whose command line mentions `marker`
pub fn processes_matching(marker: &str) -> usize {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().chars().all(|c| c.is_ascii_digit()))
        .filter_map(|e| std::fs::read(e.path().join("cmdline")).ok())
        .filter(|cmdline| String::from_utf8_lossy(cmdline).contains(marker))
        .count()
}

/// Init logging once per test binary; RUST_LOG controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
