//! pvcd - the PVC node daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use tracing::{info, warn};

use pvc_config::Config;
use pvc_daemon::node::NodeInstance;
use pvc_daemon::{keepalive, state};
use pvc_fencing::{verify_ipmi, IpmiBmc};
use pvc_store::{Handle, Store, ZkStore};
use pvc_vm::LibvirtHypervisor;

const STORE_TIMEOUT: Duration = Duration::from_secs(15);

fn main() {
    // configuration errors are fatal before logging is even up
    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("pvcd: invalid configuration: {err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = pvc_log::init_logger(pvc_config::LOG_ENV, default_log_level(&config)) {
        eprintln!("pvcd: failed to initialize logging: {err:#}");
        std::process::exit(1);
    }

    match run(config) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            warn!("daemon failed: {err:#}");
            std::process::exit(1);
        }
    }
}

fn default_log_level(config: &Config) -> pvc_log::LevelFilter {
    if config.file.logging.debug_logging {
        pvc_log::LevelFilter::DEBUG
    } else {
        pvc_log::LevelFilter::INFO
    }
}

fn run(config: Arc<Config>) -> Result<(), Error> {
    info!(
        node = %config.node_name,
        cluster = %config.file.cluster.name,
        "starting PVC node daemon"
    );
    config
        .prepare_directories()
        .context("failed to prepare runtime directories")?;

    let store = ZkStore::connect(&config.zookeeper_connect_string(), STORE_TIMEOUT)
        .context("failed to connect to the coordination store")?;
    let handle = Handle::new(Arc::new(store.clone()) as Arc<dyn Store>)
        .context("failed to negotiate the store schema")?;

    let hypervisor = Arc::new(LibvirtHypervisor::new());
    let (node, events) = NodeInstance::new(
        Arc::clone(&config),
        handle,
        hypervisor,
        Arc::from(IpmiBmc::factory()),
    );

    node.register().context("failed to register this node")?;
    node.bind_underlay_addresses()
        .context("failed to bring up underlay addresses")?;

    // IPMI self-check; fencing participation is pointless on a node whose
    // own BMC is unreachable
    let bmc = IpmiBmc::new(
        &config.ipmi_hostname,
        &config.file.fencing.ipmi.username,
        &config.file.fencing.ipmi.password,
    );
    if !verify_ipmi(&bmc) {
        warn!("IPMI connectivity check failed for {}", config.ipmi_hostname);
        if config.file.fencing.disable_on_ipmi_failure {
            warn!("disabling fencing participation on this node");
            node.fencing_enabled
                .store(false, std::sync::atomic::Ordering::Release);
        }
    }

    if config.file.guest_networking.sriov_enable {
        pvc_network::setup_pf_devices(&config.file.guest_networking.sriov_device)
            .context("failed to provision SR-IOV devices")?;
    }

    node.start_monitoring()
        .context("failed to start the monitoring instance")?;
    node.install_watches().context("failed to install watches")?;
    node.spawn_dispatcher(events)?;
    node.initial_sync().context("initial sync failed")?;

    {
        let node = Arc::clone(&node);
        std::thread::Builder::new()
            .name("pvc-keepalive".to_owned())
            .spawn(move || keepalive::keepalive_loop(node))
            .context("failed to spawn keepalive loop")?;
    }
    {
        let node = Arc::clone(&node);
        std::thread::Builder::new()
            .name("pvc-monitoring".to_owned())
            .spawn(move || keepalive::monitoring_loop(node))
            .context("failed to spawn monitoring loop")?;
    }

    info!("node daemon running");
    wait_for_shutdown()?;

    node.shutdown();
    store.close();
    Ok(())
}

/// Park the main thread on the signal-driven shutdown future.
fn wait_for_shutdown() -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build the signal runtime")?;
    runtime.block_on(async {
        state::catch_shutdown_signals()?;
        state::shutdown_future().await;
        Ok::<(), Error>(())
    })
}
