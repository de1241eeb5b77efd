//! LocalCan daemon - main entry point

use anyhow::{Context, Result};
use clap::Parser;
use localcan::config::{default_data_dir, parse_watch_list, Settings};
use localcan::{api, Collaborators, Core};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// LocalCan - local domains, local TLS and a reverse proxy for dev servers
#[derive(Parser, Debug)]
#[command(name = "localcan")]
#[command(author = "LocalCan Contributors")]
#[command(version)]
#[command(about = "Local development domain manager")]
struct Args {
    /// Data directory (database, certificates, service scripts)
    #[arg(long, env = "LOCALCAN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HTTP port the proxy listens on
    #[arg(long, env = "HTTP_PORT", default_value = "80")]
    http_port: u16,

    /// HTTPS port the proxy listens on
    #[arg(long, env = "HTTPS_PORT", default_value = "443")]
    https_port: u16,

    /// Enable the HTTPS listener
    #[arg(long, env = "ENABLE_HTTPS", default_value = "false")]
    enable_https: bool,

    /// Control API port (loopback only)
    #[arg(long, env = "CONTROL_PORT", default_value = "7878")]
    control_port: u16,

    /// Do not start the proxy at boot
    #[arg(long)]
    no_proxy: bool,

    /// Dev servers to watch, as framework:port,framework:port
    #[arg(long, env = "WATCH", default_value = "")]
    watch: String,

    /// Seconds between process and service refreshes
    #[arg(long, env = "REFRESH_SECS", default_value = "5")]
    refresh_secs: u64,

    /// Upstream response timeout in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value = "30")]
    upstream_timeout_secs: u64,

    /// Largest request body the proxy forwards, in MiB
    #[arg(long, env = "MAX_BODY_MB", default_value = "64")]
    max_body_mb: usize,

    /// Hosts file to manage instead of the system one
    #[arg(long, env = "LOCALCAN_HOSTS_FILE")]
    hosts_file: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_settings(self) -> Result<Settings> {
        Ok(Settings {
            data_dir: self.data_dir.unwrap_or_else(default_data_dir),
            http_port: self.http_port,
            https_port: self.https_port,
            enable_https: self.enable_https,
            control_port: self.control_port,
            start_proxy: !self.no_proxy,
            watch: parse_watch_list(&self.watch)?,
            refresh_interval: Duration::from_secs(self.refresh_secs.max(1)),
            upstream_timeout: Duration::from_secs(self.upstream_timeout_secs.max(1)),
            max_body_bytes: self.max_body_mb.max(1) * 1024 * 1024,
            hosts_path: self.hosts_file,
            ..Settings::default()
        })
    }
}

fn main() -> Result<()> {
    // The SCM expects a service process to reach the dispatcher right away
    #[cfg(windows)]
    {
        if scm::try_run_as_service() {
            return Ok(());
        }
    }

    let args = Args::parse();
    init_logging(&args.log_level, None)?;
    let settings = args.into_settings()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(settings, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for shutdown signal: {}", e);
        }
    }))
}

/// Log to stdout, or to `log_file` when running without a console
fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("localcan={}", level.to_lowercase())));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

/// Run the daemon until `shutdown` resolves
async fn run(settings: Settings, shutdown: impl Future<Output = ()>) -> Result<()> {
    info!("Starting LocalCan v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", settings.data_dir.display());

    let parts = Collaborators::system(&settings).context("cannot initialize OS collaborators")?;
    let core = Arc::new(Core::open(&settings, parts)?);

    let mut tasks = core.spawn_background(settings.refresh_interval);

    if settings.start_proxy {
        match core.start_proxy(None).await {
            Ok(status) => info!("Proxy running on port {:?}", status.port),
            Err(e) => warn!("Proxy not started: {}", e),
        }
    }

    let control_addr = SocketAddr::from(([127, 0, 0, 1], settings.control_port));
    let listener = TcpListener::bind(control_addr)
        .await
        .with_context(|| format!("cannot bind control API on {control_addr}"))?;
    tasks.push(tokio::spawn(api::serve(listener, Arc::clone(&core))));

    info!("LocalCan started successfully");

    shutdown.await;

    info!("Shutting down");
    core.stop_proxy().await?;
    for task in tasks {
        task.abort();
    }

    Ok(())
}

#[cfg(windows)]
mod scm {
    use super::{init_logging, run, Args};
    use clap::Parser;
    use localcan::platform::{SERVICE_LOG_FILE, SERVICE_NAME};
    use std::ffi::OsString;
    use std::sync::Mutex;
    use std::time::Duration;
    use windows_service::service::{
        ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus, ServiceType,
    };
    use windows_service::service_control_handler::{self, ServiceControlHandlerResult, ServiceStatusHandle};
    use windows_service::{define_windows_service, service_dispatcher};

    define_windows_service!(ffi_service_main, service_main);

    /// False when the process was not started by the SCM
    pub fn try_run_as_service() -> bool {
        service_dispatcher::start(SERVICE_NAME, ffi_service_main).is_ok()
    }

    fn service_main(_arguments: Vec<OsString>) {
        if let Err(e) = run_service() {
            tracing::error!("Service failed: {:#}", e);
        }
    }

    fn report(handle: ServiceStatusHandle, state: ServiceState, exit_code: u32) {
        let controls_accepted = if state == ServiceState::Running {
            ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN
        } else {
            ServiceControlAccept::empty()
        };

        let _ = handle.set_service_status(ServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state: state,
            controls_accepted,
            exit_code: ServiceExitCode::Win32(exit_code),
            checkpoint: 0,
            wait_hint: Duration::from_secs(10),
            process_id: None,
        });
    }

    fn run_service() -> anyhow::Result<()> {
        // Launch arguments registered at install time arrive on the command line
        let args = Args::try_parse()?;
        let log_level = args.log_level.clone();
        let settings = args.into_settings()?;
        init_logging(&log_level, Some(&settings.service_dir().join(SERVICE_LOG_FILE)))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let shutdown_tx = Mutex::new(Some(shutdown_tx));

        let handle = service_control_handler::register(SERVICE_NAME, move |event| match event {
            ServiceControl::Stop | ServiceControl::Shutdown => {
                if let Ok(mut guard) = shutdown_tx.lock() {
                    if let Some(tx) = guard.take() {
                        let _ = tx.send(());
                    }
                }
                ServiceControlHandlerResult::NoError
            }
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            _ => ServiceControlHandlerResult::NotImplemented,
        })?;

        report(handle, ServiceState::StartPending, 0);
        let rt = tokio::runtime::Runtime::new()?;
        report(handle, ServiceState::Running, 0);

        let result = rt.block_on(run(settings, async {
            let _ = shutdown_rx.await;
        }));

        report(handle, ServiceState::Stopped, if result.is_ok() { 0 } else { 1 });
        result
    }
}
