//! shroudd - shroud network plugin daemon.
//!
//! Serves the container runtime's remote network-driver protocol on a Unix
//! socket and routes the traffic of every network it creates through an
//! anonymizing proxy.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use shroud_common::ShroudPaths;
use shroud_common::paths::{SHROUD_PID_FILE, SHROUD_PLUGIN_DIR};
use shroud_network::config::{DEFAULT_DNS_PORT, DEFAULT_PROXY_CONTAINER, DEFAULT_TRANS_PORT};
use shroud_network::{Backends, Driver, DriverConfig};
use tokio::net::UnixListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod pidfile;

use pidfile::PidFile;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run in debug mode
    #[arg(short, long)]
    debug: bool,

    /// Path to use for the plugin's PID file; empty disables it
    #[arg(long, default_value_os_t = SHROUD_PID_FILE.clone())]
    pidfile: PathBuf,

    /// Directory the container runtime discovers plugin sockets in
    #[arg(long, default_value_os_t = SHROUD_PLUGIN_DIR.clone())]
    plugin_dir: PathBuf,

    /// Plugin name, also the socket file name
    #[arg(long, default_value = "tor")]
    plugin_name: String,

    /// Container running the proxy
    #[arg(long, default_value = DEFAULT_PROXY_CONTAINER)]
    proxy_container: String,

    /// Proxy address, skipping the container lookup
    #[arg(long)]
    proxy_ip: Option<IpAddr>,

    /// Proxy port for redirected TCP connections
    #[arg(long, default_value_t = DEFAULT_TRANS_PORT)]
    trans_port: u16,

    /// Proxy port for redirected DNS queries
    #[arg(long, default_value_t = DEFAULT_DNS_PORT)]
    dns_port: u16,

    /// Drop UDP other than DNS
    #[arg(long)]
    block_udp: bool,

    /// Drop TCP between containers of the same network
    #[arg(long)]
    disable_icc: bool,
}

impl Args {
    fn driver_config(&self) -> DriverConfig {
        let mut config = DriverConfig::default()
            .with_proxy_container(self.proxy_container.as_str())
            .with_proxy_ports(self.trans_port, self.dns_port)
            .with_icc(!self.disable_icc);
        if let Some(ip) = self.proxy_ip {
            config = config.with_proxy_ip(ip);
        }
        if self.block_udp {
            config = config.with_block_udp();
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _pidfile = if args.pidfile.as_os_str().is_empty() {
        None
    } else {
        Some(PidFile::create(&args.pidfile)?)
    };

    let config = args.driver_config();
    if config.enable_ip_forward {
        shroud_network::enable_ip_forwarding()?;
    }
    let backends = Backends::host(&config)?;
    let driver = Arc::new(Driver::new(config, backends));

    let paths = ShroudPaths::new()
        .with_plugin_dir(&args.plugin_dir)
        .with_pid_file(&args.pidfile);
    paths
        .create_dirs()
        .with_context(|| format!("creating {}", paths.plugin_dir.display()))?;
    let socket = paths.plugin_socket(&args.plugin_name);
    match std::fs::remove_file(&socket) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            return Err(e).with_context(|| format!("removing stale socket {}", socket.display()));
        }
        _ => {}
    }

    let listener = UnixListener::bind(&socket)
        .with_context(|| format!("binding {}", socket.display()))?;
    tracing::info!(socket = %socket.display(), "shroudd listening");

    axum::serve(listener, api::server::app(driver))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = std::fs::remove_file(&socket) {
        tracing::warn!(socket = %socket.display(), error = %e, "Failed to remove socket");
    }
    tracing::info!("shroudd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("Shutting down");
}
