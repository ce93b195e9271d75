use std::str::FromStr;

use clap::{ArgAction, Parser};
use tracing::{error, info};

use zap_accel::controller::{wait_for_start_condition, Controller, Outcome};
use zap_core::Shutdown;
use zap_kubehub::ClusterStatusProbe;

#[derive(Parser, Debug)]
#[command(
    name = "install-accelerator",
    version,
    about = "Applies post-provisioning manifests while the cluster installs"
)]
struct Cli {
    /// Skip waiting for the start condition
    #[arg(long = "override", action = ArgAction::SetTrue)]
    override_start: bool,
}

fn init_tracing() {
    let env = std::env::var("ZAP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ZAP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ZAP_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = match zap_kubehub::get_kube_client().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "kube client construction failed");
            std::process::exit(1);
        }
    };

    if !cli.override_start {
        let probe = ClusterStatusProbe::new(client.clone());
        if let Err(e) = wait_for_start_condition(&probe).await {
            error!(error = %e, "end condition determined when waiting for start condition - exiting");
            std::process::exit(1);
        }
    }

    info!("starting installation of custom resources");
    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.trigger();
            }
        });
    }

    let controller = Controller::new(client);
    match controller.run(shutdown).await {
        Ok(Outcome::Converged) => std::process::exit(0),
        Ok(Outcome::Aborted) => std::process::exit(1),
        Err(e) => {
            error!(error = %e, "install accelerator failed");
            std::process::exit(1);
        }
    }
}
