//! machine-config-controller - renders MachineConfigPools into MachineConfigs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, CommandFactory, Parser, Subcommand};
use futures::{Stream, StreamExt};
use kube::runtime::reflector::{self, reflector};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mcfg_common::crd::{ControllerConfig, MachineConfig, MachineConfigPool};
use mcfg_common::events::KubeEventPublisher;
use mcfg_common::kube_utils::{create_client, wait_for_crd};
use mcfg_common::telemetry::{init_telemetry, TelemetryConfig};
use mcfg_common::{ControllerVersion, CONTROLLER_CONFIG_NAME};
use mcfg_render::bootstrap::bootstrap_dir;
use mcfg_render::store::{KubeConfigWriter, ReflectorLister};
use mcfg_render::{run_workers, Context, Handlers, RenderControllerConfig};

const CONTROLLER_NAME: &str = "machine-config-controller";

const CRD_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Machine config render controller
#[derive(Parser, Debug)]
#[command(name = "machine-config-controller", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch pools and MachineConfigs and keep every pool's rendered config current
    Controller(ControllerArgs),

    /// Render every pool from manifests on disk, before the cluster exists
    Bootstrap(BootstrapArgs),
}

#[derive(Args, Debug)]
struct VersionArgs {
    /// Release version this controller belongs to; defaults to the build's
    #[arg(long, env = "MCFG_VERSION_RAW")]
    version_raw: Option<String>,

    /// Build hash stamped on generated MachineConfigs; defaults to the build's
    #[arg(long, env = "MCFG_VERSION_HASH")]
    version_hash: Option<String>,
}

impl VersionArgs {
    fn resolve(&self) -> ControllerVersion {
        let mut version = ControllerVersion::from_build();
        if let Some(raw) = &self.version_raw {
            version.raw = raw.clone();
        }
        if let Some(hash) = &self.version_hash {
            version.hash = hash.clone();
        }
        version
    }
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Path to a kubeconfig; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Number of pools synced concurrently
    #[arg(long, env = "MCFG_WORKERS", default_value_t = 5)]
    workers: usize,

    /// Seconds to wait after a change before rendering, to batch bursts
    #[arg(long, env = "MCFG_RENDER_DELAY_SECS", default_value_t = 5)]
    render_delay_secs: u64,

    #[command(flatten)]
    version: VersionArgs,
}

#[derive(Args, Debug)]
struct BootstrapArgs {
    /// Directory of pool, MachineConfig and ControllerConfig manifests
    #[arg(long)]
    manifests: PathBuf,

    /// Directory to write rendered configs and pools to
    #[arg(long)]
    dest: PathBuf,

    #[command(flatten)]
    version: VersionArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install the aws-lc-rs crypto provider"))?;

    let cli = Cli::parse();

    if cli.crd {
        let crds = [
            serde_yaml::to_string(&MachineConfig::crd())?,
            serde_yaml::to_string(&MachineConfigPool::crd())?,
            serde_yaml::to_string(&ControllerConfig::crd())?,
        ];
        println!("{}", crds.join("---\n"));
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        Some(Commands::Bootstrap(args)) => run_bootstrap(args),
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

fn run_bootstrap(args: BootstrapArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::offline("machine-config-bootstrap"))?;
    let version = args.version.resolve();

    let output = bootstrap_dir(&args.manifests, &args.dest, &version)
        .with_context(|| format!("bootstrap of {} failed", args.manifests.display()))?;
    info!(
        pools = output.pools.len(),
        dest = %args.dest.display(),
        "bootstrap complete"
    );
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::default())?;
    let version = args.version.resolve();
    info!(version = %version, "machine-config-controller starting");

    let client = create_client(args.kubeconfig.as_deref())
        .await
        .context("failed to create Kubernetes client")?;

    for crd in [
        MachineConfig::crd_name(),
        MachineConfigPool::crd_name(),
        ControllerConfig::crd_name(),
    ] {
        wait_for_crd(&client, crd, CRD_WAIT_TIMEOUT)
            .await
            .with_context(|| format!("CRD {} is not installed", crd))?;
    }

    let config = RenderControllerConfig {
        workers: args.workers,
        render_delay: Duration::from_secs(args.render_delay_secs),
        ..Default::default()
    };
    let queue = config.new_queue();
    let shutdown = CancellationToken::new();

    let (pools, pools_writer) = reflector::store::<MachineConfigPool>();
    let (configs, configs_writer) = reflector::store::<MachineConfig>();
    let (controller_configs, cc_writer) = reflector::store::<ControllerConfig>();
    let lister = ReflectorLister::new(pools, configs, controller_configs);
    let handlers = Handlers::new(Arc::new(lister.clone()), queue.clone(), config.render_delay);

    let pool_events = reflector(
        pools_writer,
        watcher(Api::<MachineConfigPool>::all(client.clone()), watcher::Config::default()),
    )
    .default_backoff();
    let h = handlers.clone();
    tokio::spawn(dispatch(pool_events, "MachineConfigPool", shutdown.clone(), move |e| {
        h.on_pool_event(e)
    }));

    let config_events = reflector(
        configs_writer,
        watcher(Api::<MachineConfig>::all(client.clone()), watcher::Config::default()),
    )
    .default_backoff();
    let h = handlers.clone();
    tokio::spawn(dispatch(config_events, "MachineConfig", shutdown.clone(), move |e| {
        h.on_machine_config_event(e)
    }));

    // Pools waiting on the ControllerConfig requeue themselves; no routing needed.
    let cc_events = reflector(
        cc_writer,
        watcher(
            Api::<ControllerConfig>::all(client.clone()),
            watcher::Config::default().fields(&format!("metadata.name={}", CONTROLLER_CONFIG_NAME)),
        ),
    )
    .default_backoff();
    tokio::spawn(dispatch(cc_events, "ControllerConfig", shutdown.clone(), |_| {}));

    lister
        .wait_until_ready()
        .await
        .context("caches failed to sync")?;
    info!("caches synced");

    let ctx = Arc::new(Context::new(
        Arc::new(lister),
        Arc::new(KubeConfigWriter::new(client.clone())),
        Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
        version,
        config,
    ));

    tokio::spawn(shutdown_on_signal(shutdown.clone()));
    run_workers(ctx, queue, shutdown).await;

    info!("machine-config-controller stopped");
    Ok(())
}

/// Feed watch events to `on_event` until the stream ends or `shutdown` fires
async fn dispatch<K, S, F>(stream: S, kind: &'static str, shutdown: CancellationToken, mut on_event: F)
where
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
    F: FnMut(&Event<K>),
{
    let mut stream = std::pin::pin!(stream);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(event)) => on_event(&event),
                Some(Err(e)) => warn!(kind, error = %e, "watch error"),
                None => break,
            },
        }
    }
    info!(kind, "watch stopped");
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown requested");
    shutdown.cancel();
}
