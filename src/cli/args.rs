use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "vmfabric", version, about = "Isolated QEMU clusters for integration testing")]
pub struct Cli {
    /// Config file (defaults to the lookup chain, then built-in defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a cluster, print its machines and wait for Ctrl-C
    Spawn(SpawnArgs),
}

#[derive(Args, Debug)]
pub struct SpawnArgs {
    /// Base image every machine boots an overlay of
    pub image: PathBuf,

    /// Number of machines
    #[arg(long, short = 'n', default_value_t = 1)]
    pub count: usize,

    /// Guest architecture (defaults to the host's)
    #[arg(long)]
    pub arch: Option<String>,

    /// First-boot config for every machine. `$discovery` is replaced with a
    /// fresh discovery URL for the cluster.
    #[arg(long)]
    pub ignition: Option<PathBuf>,

    /// How the payload is handed to the guest
    #[arg(long, value_enum, default_value_t = EncodingOpt::Firmware)]
    pub encoding: EncodingOpt,

    /// Extra blank disk per machine, e.g. 10G
    #[arg(long)]
    pub extra_disk: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum EncodingOpt {
    /// Ignition-style, through fw_cfg
    Firmware,
    /// cloud-init style, on a config drive
    Filesystem,
}
