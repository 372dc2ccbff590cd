use crate::cgroups::setup_cgroups;
use crate::config::{BootstrapConfig, CGROUP_ROOT};
use crate::daemon::{daemon_args, spawn_daemon, wait_until_ready};
use crate::error::BootstrapError;
use crate::host::Host;
use crate::network::setup_bridge;
use crate::storage::select_storage;
use std::path::Path;
use tokio::process::Child;
use tracing::info;

/// Prepare cgroups, storage and networking, returning the daemon's
/// argument list.
pub async fn prepare(host: &impl Host, cfg: &BootstrapConfig) -> Result<Vec<String>, BootstrapError> {
    setup_cgroups(host, Path::new(CGROUP_ROOT))?;

    let storage = select_storage(
        host,
        &cfg.var_lib_docker,
        &cfg.loopback_image,
        cfg.loopback_size_gb,
    )
    .await?;

    let network_flags = match &cfg.network {
        Some(net) => setup_bridge(host, net).await?,
        None => {
            info!("DOCKER_NETWORK_OFFSET unset, daemon keeps its default bridge");
            Vec::new()
        }
    };

    Ok(daemon_args(&cfg.daemon, storage.driver, &network_flags))
}

/// Everything up to a ready daemon. The returned child keeps running after
/// the caller execs the final command.
pub async fn run(host: &impl Host, cfg: &BootstrapConfig) -> Result<Child, BootstrapError> {
    let args = prepare(host, cfg).await?;
    let mut daemon = spawn_daemon(&cfg.daemon, &args)?;
    wait_until_ready(host, &mut daemon, cfg.daemon.ready_timeout, cfg.daemon.poll_interval).await?;
    Ok(daemon)
}
