//! Cluster lifecycle. The setup/teardown tests need root, dnsmasq and the
//! OpenSSH tools and skip otherwise. The boot test additionally needs QEMU,
//! KVM and a bootable image in $VMFABRIC_TEST_IMAGE:
//!   VMFABRIC_TEST_IMAGE=/path/to/image.qcow2 cargo test --test test_cluster -- --ignored

mod common;

use std::time::Duration;

use std::path::Path;

use anyhow::Result;
use vmfabric::storage::DiskSpec;
use vmfabric::{Cluster, ClusterState, Config, ConfigPayload, Error, MachineOptions};

fn skip(test: &str) -> bool {
    if !common::is_root() {
        eprintln!("Skipping {} - requires root", test);
        return true;
    }
    for tool in ["dnsmasq", "ssh-keygen", "ssh-agent", "ssh-add"] {
        if !common::have_tool(tool) {
            eprintln!("Skipping {} - requires {}", test, tool);
            return true;
        }
    }
    false
}

#[tokio::test]
async fn test_empty_cluster_lifecycle() -> Result<()> {
    if skip("test_empty_cluster_lifecycle") {
        return Ok(());
    }
    common::init_tracing();
    let root = tempfile::tempdir()?;
    let before = common::host_links();

    let cluster = Cluster::new(common::config_in(root.path())).await?;
    assert_eq!(cluster.state().await, ClusterState::ServicesReady);
    assert!(cluster.workdir().starts_with(root.path()));
    assert!(cluster.agent().public_key().starts_with("ssh-"));
    // Everything lives in the sandbox
    assert_eq!(common::host_links(), before);

    let url = cluster.discovery_url(3).await?;
    let rest = url.strip_prefix("http://").expect("http scheme");
    let (authority, path) = rest.split_once('/').expect("path");
    assert!(authority.starts_with(&cluster.gateway().to_string()));
    assert!(authority.rsplit_once(':').unwrap().1.parse::<u16>().is_ok());
    assert!(path.starts_with("v2/keys/_etcd/registry/"));

    let extra = cluster.new_segment().await?;
    assert_ne!(extra, cluster.primary_segment());

    cluster.destroy().await?;
    assert_eq!(cluster.state().await, ClusterState::Destroyed);
    assert!(cluster.sandbox().is_destroyed());
    assert_eq!(std::fs::read_dir(root.path())?.count(), 0);

    // Second destroy is a no-op; further work is refused
    cluster.destroy().await?;
    assert!(cluster.discovery_url(1).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_failed_batch_leaves_empty_roster() -> Result<()> {
    if skip("test_failed_batch_leaves_empty_roster") {
        return Ok(());
    }
    let root = tempfile::tempdir()?;
    let images = tempfile::tempdir()?;
    let base = images.path().join("base.raw");
    std::fs::write(&base, vec![0u8; 1 << 20])?;

    let cluster = Cluster::new(common::config_in(root.path())).await?;
    let batch = vec![
        MachineOptions::from_image(&base),
        MachineOptions::from_image(images.path().join("missing.qcow2")),
        MachineOptions::from_image(&base),
    ];
    assert!(cluster.new_machines(batch).await.is_err());
    assert!(cluster.machines().await.is_empty());
    assert_eq!(cluster.state().await, ClusterState::ServicesReady);

    // Invalid options fail before anything is created
    let bad = MachineOptions {
        disks: vec![DiskSpec::default()],
        ..Default::default()
    };
    assert!(matches!(
        cluster.new_machine(bad).await,
        Err(Error::Configuration(_))
    ));
    assert!(matches!(
        cluster.new_machine(MachineOptions::default()).await,
        Err(Error::Configuration(_))
    ));

    cluster.destroy().await?;
    assert_eq!(std::fs::read_dir(root.path())?.count(), 0);
    Ok(())
}

/// Config whose image tool, hypervisor and DHCP responder are shell stubs,
/// so machines "run" without QEMU or dnsmasq. The hypervisor stub stays in
/// a loop until signaled; its script path identifies it in /proc.
fn stub_config(root: &Path, stubs: &Path) -> (Config, String) {
    let img = common::write_script(
        stubs,
        "qemu-img",
        r#"[ "$1" = info ] && echo '{"format":"raw"}'
exit 0"#,
    );
    let hypervisor = common::write_script(
        stubs,
        "qemu-system-stub",
        r#"[ "$1" = --version ] && { echo "QEMU emulator version 8.2.0"; exit 0; }
while :; do sleep 1; done"#,
    );
    let dnsmasq = common::write_script(stubs, "dnsmasq", "exec sleep 3600");

    let mut config = common::config_in(root);
    config.qemu.img = img.display().to_string();
    config.qemu.binary = Some(hypervisor.display().to_string());
    config.network.dnsmasq = dnsmasq.display().to_string();
    (config, hypervisor.display().to_string())
}

fn skip_stubbed(test: &str) -> bool {
    if !common::is_root() {
        eprintln!("Skipping {} - requires root", test);
        return true;
    }
    for tool in ["ssh-keygen", "ssh-agent", "ssh-add"] {
        if !common::have_tool(tool) {
            eprintln!("Skipping {} - requires {}", test, tool);
            return true;
        }
    }
    false
}

async fn wait_for_processes(marker: &str, count: usize) -> bool {
    for _ in 0..50 {
        if common::processes_matching(marker) == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn sandbox_taps(cluster: &Cluster) -> Result<usize> {
    let out = cluster
        .sandbox()
        .command("ip")?
        .args(["-o", "link", "show"])
        .output()
        .await?;
    Ok(String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter(|l| l.split(": ").nth(1).is_some_and(|n| n.starts_with("tap")))
        .count())
}

#[tokio::test]
async fn test_batch_rollback_stops_started_machines() -> Result<()> {
    if skip_stubbed("test_batch_rollback_stops_started_machines") {
        return Ok(());
    }
    common::init_tracing();
    let root = tempfile::tempdir()?;
    let stubs = tempfile::tempdir()?;
    let (config, hypervisor) = stub_config(root.path(), stubs.path());
    let base = stubs.path().join("base.raw");
    std::fs::write(&base, vec![0u8; 4096])?;

    let cluster = Cluster::new(config).await?;
    let batch = vec![
        MachineOptions::from_image(&base),
        MachineOptions::from_image(stubs.path().join("missing.qcow2")),
        MachineOptions::from_image(&base),
    ];
    let err = cluster.new_machines(batch).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");

    // The siblings were started and then rolled back
    assert!(cluster.machines().await.is_empty());
    assert_eq!(cluster.state().await, ClusterState::ServicesReady);
    assert!(wait_for_processes(&hypervisor, 0).await, "hypervisor stub still running");
    assert_eq!(sandbox_taps(&cluster).await?, 0);

    cluster.destroy().await?;
    assert_eq!(std::fs::read_dir(root.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_destroy_from_populated() -> Result<()> {
    if skip_stubbed("test_destroy_from_populated") {
        return Ok(());
    }
    common::init_tracing();
    let root = tempfile::tempdir()?;
    let stubs = tempfile::tempdir()?;
    let (config, hypervisor) = stub_config(root.path(), stubs.path());
    let base = stubs.path().join("base.raw");
    std::fs::write(&base, vec![0u8; 4096])?;

    let cluster = Cluster::new(config).await?;
    let machines = cluster
        .new_machines(vec![MachineOptions::from_image(&base); 2])
        .await?;
    assert_eq!(cluster.state().await, ClusterState::Populated(2));
    assert!(machines.iter().all(|m| m.is_running()));
    assert_ne!(machines[0].ip(), machines[1].ip());
    assert!(wait_for_processes(&hypervisor, 2).await, "hypervisor stubs not running");
    assert_eq!(sandbox_taps(&cluster).await?, 2);

    // Each machine was handed a config carrying the cluster key
    let staged: Vec<_> = walk(root.path())
        .into_iter()
        .filter(|p| p.file_name().is_some_and(|n| n == "config.ign"))
        .collect();
    assert_eq!(staged.len(), 2);
    for path in &staged {
        assert!(std::fs::read_to_string(path)?.contains(cluster.agent().public_key()));
    }

    cluster.destroy().await?;
    assert_eq!(cluster.state().await, ClusterState::Destroyed);
    assert!(machines.iter().all(|m| !m.is_running()));
    assert_eq!(common::processes_matching(&hypervisor), 0);
    assert_eq!(std::fs::read_dir(root.path())?.count(), 0);
    Ok(())
}

fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
    }
    out
}

#[tokio::test]
#[ignore] // Needs QEMU, KVM and $VMFABRIC_TEST_IMAGE; run with --ignored
async fn test_single_machine_boots_and_answers_ssh() -> Result<()> {
    if skip("test_single_machine_boots_and_answers_ssh") {
        return Ok(());
    }
    let Some(image) = common::test_image() else {
        eprintln!("Skipping - set {} to a bootable image", common::TEST_IMAGE_ENV);
        return Ok(());
    };
    common::init_tracing();
    let root = tempfile::tempdir()?;
    let mut config = common::config_in(root.path());
    config.ssh.retry_secs = 300;

    let cluster = Cluster::new(config).await?;
    // No passwd section: the cluster key is added at launch
    let ignition = serde_json::json!({
        "ignition": { "version": "3.0.0" },
        "storage": { "files": [{
            "path": "/etc/discovery-url",
            "mode": 420,
            "contents": { "source": "data:,$discovery" }
        }]}
    });
    let url = cluster.discovery_url(1).await?;
    let payload = ConfigPayload::firmware(ignition.to_string())
        .substitute(vmfabric::cluster::DISCOVERY_TOKEN, &url);

    let result = async {
        let machine = cluster
            .new_machine(MachineOptions::from_image(&image).with_config(payload))
            .await?;
        assert_eq!(cluster.state().await, ClusterState::Populated(1));
        assert!(machine.is_running());

        cluster.wait_for_ssh(&machine).await?;
        let (out, res) = cluster.ssh(&machine, "hostname").await;
        res?;
        assert!(!out.is_empty());

        let (_, res) = cluster.ssh(&machine, "false").await;
        assert!(matches!(res, Err(Error::ToolFailure { .. })));

        // Console transcript is being written
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!machine.console_text().await?.is_empty());

        cluster.destroy_machine(machine.id()).await?;
        assert!(!machine.is_running());
        assert_eq!(cluster.state().await, ClusterState::ServicesReady);
        anyhow::Ok(())
    }
    .await;

    cluster.destroy().await?;
    assert_eq!(std::fs::read_dir(root.path())?.count(), 0);
    result
}
