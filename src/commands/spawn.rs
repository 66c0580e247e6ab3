use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::{EncodingOpt, SpawnArgs};
use crate::cluster::{Cluster, ConfigPayload, MachineOptions, DISCOVERY_TOKEN};
use crate::config::Config;
use crate::qemu::Arch;
use crate::storage::DiskSpec;

/// Read the payload file and fill in the discovery placeholder.
fn load_payload(data: String, encoding: EncodingOpt, discovery: Option<&str>) -> ConfigPayload {
    let payload = match encoding {
        EncodingOpt::Firmware => ConfigPayload::firmware(data),
        EncodingOpt::Filesystem => ConfigPayload::filesystem(data),
    };
    match discovery {
        Some(url) => payload.substitute(DISCOVERY_TOKEN, url),
        None => payload,
    }
}

pub async fn cmd_spawn(config: Config, args: SpawnArgs) -> Result<()> {
    info!(image = %args.image.display(), count = args.count, "vmfabric spawn");

    let guest = args
        .arch
        .as_deref()
        .map(str::parse::<Arch>)
        .transpose()
        .context("parsing --arch")?;
    let raw = match &args.ignition {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
        ),
        None => None,
    };

    let cluster = Cluster::new(config).await.context("creating cluster")?;
    let result = populate(&cluster, &args, guest, raw).await;

    if result.is_ok() {
        info!("cluster running, press Ctrl-C to tear down");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "waiting for Ctrl-C failed");
        }
    }

    info!("tearing down cluster");
    let destroyed = cluster.destroy().await.context("destroying cluster");
    result.and(destroyed)
}

async fn populate(
    cluster: &Cluster,
    args: &SpawnArgs,
    guest: Option<Arch>,
    raw: Option<String>,
) -> Result<()> {
    let payload = match raw {
        Some(data) => {
            let url = if data.contains(DISCOVERY_TOKEN) {
                Some(cluster.discovery_url(args.count).await?)
            } else {
                None
            };
            Some(load_payload(data, args.encoding, url.as_deref()))
        }
        None => None,
    };

    let mut opts = MachineOptions::from_image(&args.image);
    opts.guest = guest;
    opts.config = payload;
    for size in &args.extra_disk {
        opts = opts.with_disk(DiskSpec::blank(size.clone()));
    }

    let machines = cluster
        .new_machines(vec![opts; args.count])
        .await
        .context("launching machines")?;

    println!("{:<38} {:<16} {:<18} {:<12} {}", "ID", "IP", "MAC", "TAP", "HOSTNAME");
    for m in &machines {
        println!(
            "{:<38} {:<16} {:<18} {:<12} {}",
            m.id(),
            m.ip(),
            m.mac().to_string(),
            m.tap_name(),
            m.hostname()
        );
    }
    println!("ssh agent: SSH_AUTH_SOCK={}", cluster.agent().socket().display());
    println!("discovery: {}", cluster.discovery().endpoint());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PayloadEncoding;

    #[test]
    fn test_load_payload_substitutes_discovery() {
        let p = load_payload(
            r#"{"etcd":{"discovery":"$discovery"}}"#.to_string(),
            EncodingOpt::Filesystem,
            Some("http://10.0.0.1:4001/v2/keys/_etcd/registry/abc"),
        );
        assert_eq!(p.encoding(), PayloadEncoding::Filesystem);
        assert_eq!(
            p.as_str(),
            r#"{"etcd":{"discovery":"http://10.0.0.1:4001/v2/keys/_etcd/registry/abc"}}"#
        );

        let untouched = load_payload("$discovery".to_string(), EncodingOpt::Firmware, None);
        assert_eq!(untouched.as_str(), "$discovery");
    }
}
