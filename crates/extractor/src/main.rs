use std::str::FromStr;

use tracing::{error, info, warn};

use zap_core::RETRY_TIME;
use zap_extractor::Extractor;

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

    let client = match zap_kubehub::get_kube_client().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "kube client construction failed");
            std::process::exit(1);
        }
    };

    let extractor = Extractor::new(client);
    info!("watching ManagedClusters");
    loop {
        if let Err(e) = extractor.watch_managed_clusters().await {
            warn!(error = %e, "managed cluster watcher exited, will retry in {}s", RETRY_TIME.as_secs());
            tokio::time::sleep(RETRY_TIME).await;
        }
    }
}
