use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use haproxy_ingress::config::{ControllerConfig, DEFAULT_CFG_DIR};
use haproxy_ingress::controller::{
    channel, default_handlers, run_worker, Controller, ControllerSettings, HaproxyProcess,
    ServiceAction, ServiceControl, SyncEvent,
};
use haproxy_ingress::haproxy::{MemoryClient, ProxyConfig};
use haproxy_ingress::source::ManifestSource;
use haproxy_ingress::store::Store;
use haproxy_ingress::{environment, Error};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SNAPSHOT_FILE: &str = "haproxy.json";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ingress controller
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Do not require an HAProxy binary and never start or signal it
    #[arg(long, env = "TEST_MODE")]
    test: bool,

    /// HAProxy binary
    #[arg(long, env = "HAPROXY_BINARY")]
    program: Option<PathBuf>,

    /// HAProxy configuration directory
    #[arg(long, env = "HAPROXY_CFG_DIR", default_value = DEFAULT_CFG_DIR)]
    cfg_dir: PathBuf,

    /// HAProxy configuration file (defaults to haproxy.cfg in the configuration directory)
    #[arg(long, env = "HAPROXY_CFG_FILE")]
    cfg_file: Option<PathBuf>,

    #[arg(long, env = "HAPROXY_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    #[arg(long, env = "HAPROXY_MAP_DIR")]
    map_dir: Option<PathBuf>,

    #[arg(long, env = "HAPROXY_ERRORFILE_DIR")]
    errorfile_dir: Option<PathBuf>,

    /// Server-state directory
    #[arg(long, env = "HAPROXY_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[arg(long, env = "HAPROXY_RUNTIME_SOCKET")]
    runtime_socket: Option<PathBuf>,

    #[arg(long, env = "HAPROXY_PID_FILE")]
    pid_file: Option<PathBuf>,

    /// Directory for transaction files and the configuration snapshot
    #[arg(long, env = "HAPROXY_TRANSACTION_DIR")]
    transaction_dir: Option<PathBuf>,

    #[arg(long, env = "DISABLE_IPV4")]
    disable_ipv4: bool,

    #[arg(long, env = "DISABLE_IPV6")]
    disable_ipv6: bool,

    #[arg(long, env = "IPV4_BIND_ADDRESS", default_value = "0.0.0.0")]
    ipv4_bind_address: String,

    #[arg(long, env = "IPV6_BIND_ADDRESS", default_value = "::")]
    ipv6_bind_address: String,

    #[arg(long, env = "DISABLE_HTTP")]
    disable_http: bool,

    #[arg(long, env = "DISABLE_HTTPS")]
    disable_https: bool,

    #[arg(long, env = "HTTP_BIND_PORT", default_value_t = 80)]
    http_bind_port: u16,

    #[arg(long, env = "HTTPS_BIND_PORT", default_value_t = 443)]
    https_bind_port: u16,

    /// Service receiving unmatched traffic, as namespace/name
    #[arg(long, env = "DEFAULT_BACKEND_SERVICE")]
    default_backend_service: Option<String>,

    /// ConfigMap holding global annotations, as namespace/name
    #[arg(long, env = "CONFIGMAP")]
    configmap: Option<String>,

    /// Only watch these namespaces
    #[arg(long, env = "NAMESPACE_WHITELIST", value_delimiter = ',')]
    namespace_whitelist: Vec<String>,

    /// Never watch these namespaces
    #[arg(long, env = "NAMESPACE_BLACKLIST", value_delimiter = ',')]
    namespace_blacklist: Vec<String>,

    /// Capacity of the sync event queue
    #[arg(long, env = "SYNC_QUEUE_CAPACITY", default_value_t = 600)]
    queue_capacity: usize,

    /// Multi-document YAML file of Kubernetes objects to serve
    #[arg(long, env = "MANIFESTS")]
    manifests: Option<PathBuf>,

    /// Seconds between two reads of the manifest file
    #[arg(long, env = "SYNC_PERIOD", default_value_t = 5)]
    sync_period: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl RunArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            test: self.test,
            program: self.program.clone(),
            cfg_dir: self.cfg_dir.clone(),
            cfg_file: self.cfg_file.clone(),
            cert_dir: self.cert_dir.clone(),
            map_dir: self.map_dir.clone(),
            errorfile_dir: self.errorfile_dir.clone(),
            state_dir: self.state_dir.clone(),
            runtime_socket: self.runtime_socket.clone(),
            pid_file: self.pid_file.clone(),
            transaction_dir: self.transaction_dir.clone(),
            disable_ipv4: self.disable_ipv4,
            disable_ipv6: self.disable_ipv6,
            ipv4_bind_addr: self.ipv4_bind_address.clone(),
            ipv6_bind_addr: self.ipv6_bind_address.clone(),
            disable_http: self.disable_http,
            disable_https: self.disable_https,
            http_bind_port: self.http_bind_port,
            https_bind_port: self.https_bind_port,
            default_backend_service: self.default_backend_service.clone(),
            configmap: self.configmap.clone(),
            namespace_whitelist: self.namespace_whitelist.clone(),
            namespace_blacklist: self.namespace_blacklist.clone(),
            queue_capacity: self.queue_capacity,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("HAProxy Ingress Controller v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_controller(run_args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
    }
}

async fn run_controller(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!(
        "Starting HAProxy Ingress Controller v{}",
        env!("CARGO_PKG_VERSION")
    );
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    info!("Running on {}", host);

    let config = args.controller_config();
    config.validate()?;
    let paths = environment::initialize(&config)?;
    info!("HAProxy configuration file: {}", paths.cfg_file.display());

    let process = HaproxyProcess::new(&paths, config.test);
    if !config.test {
        match process.version().await {
            Ok(version) => info!("{}", version),
            Err(e) => warn!("Cannot read HAProxy version: {}", e),
        }
    }
    process.control(ServiceAction::Start).await?;
    info!("HAProxy started");

    let store = Store::new(config.namespace_filter(), config.main_config_map()?);
    let mut client = MemoryClient::new(ProxyConfig::base());
    if let Some(dir) = &paths.transaction_dir {
        client = client.with_snapshot(dir.join(SNAPSHOT_FILE));
    }

    let settings = ControllerSettings::from_config(&config);
    let mut controller = Controller::new(store, client, Arc::new(process), settings.clone());
    for handler in default_handlers(&settings) {
        controller.register_handler(handler);
    }
    controller.handle_binds()?;

    let (tx, rx) = channel(config.queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // without a manifest file the queue is only fed once; keep it open until shutdown
    let mut idle_sender = None;
    match &args.manifests {
        Some(path) => {
            let source = ManifestSource::new(path, Duration::from_secs(args.sync_period));
            tokio::spawn(source.run(tx, shutdown_rx.clone()));
        }
        None => {
            warn!("No manifest file configured, running a single sync cycle");
            if tx.send(SyncEvent::Resync).await.is_err() {
                error!("Sync queue closed before startup completed");
            }
            idle_sender = Some(tx);
        }
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!("Cannot listen for shutdown signal: {}", e);
                // dropping the sender would stop the worker
                std::future::pending::<()>().await;
            }
        }
    });

    let stats = run_worker(&mut controller, rx, shutdown_rx).await;
    drop(idle_sender);
    info!(
        "Controller stopped after {} events and {} sync cycles ({} failed)",
        stats.events, stats.cycles, stats.failed_cycles
    );
    Ok(())
}
