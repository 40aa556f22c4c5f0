use anyhow::Context;
use clap::Parser;
use mvirt_cni::kernel::rtnl::{PSCHED_PATH, SYSCTL_ROOT};
use mvirt_cni::{Ledger, ProvisionRequest, RtnlKernel, provision};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mvirt-cni")]
#[command(about = "Attach a container network namespace to the host with a routed veth pair")]
struct Args {
    /// JSON provisioning request. Read from stdin when omitted.
    #[arg(short, long)]
    request: Option<PathBuf>,

    /// Root of the net.* sysctl tree
    #[arg(long, env = "MVIRT_CNI_SYSCTL_ROOT", default_value = SYSCTL_ROOT)]
    sysctl_root: PathBuf,

    /// Packet scheduler clock parameters
    #[arg(long, env = "MVIRT_CNI_PSCHED", default_value = PSCHED_PATH)]
    psched: PathBuf,
}

async fn read_request(path: Option<&Path>) -> anyhow::Result<ProvisionRequest> {
    let raw = match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut raw = String::new();
            tokio::io::stdin().read_to_string(&mut raw).await?;
            raw
        }
    };
    serde_json::from_str(&raw).context("Invalid provisioning request")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // stdout carries the result; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_cni=info".parse()?))
        .init();

    let args = Args::parse();

    let request = read_request(args.request.as_deref()).await?;
    info!(container_id = %request.container_id, "Request loaded");

    let kernel = RtnlKernel::new(args.sysctl_root.clone(), &args.psched)
        .context("Failed to open host namespace")?;

    let mut ledger = Ledger::new();
    match provision(&kernel, &request, &mut ledger).await {
        Ok(result) => {
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }
        Err(err) => {
            error!(error = %err, resources = ledger.len(), "Provisioning failed");
            eprintln!("{}", serde_json::to_string(&ledger)?);
            Err(err.into())
        }
    }
}
