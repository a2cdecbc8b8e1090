use std::str::FromStr;

use kprov_api::ProvisionerFacade;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

fn init_tracing() {
    let env = std::env::var("KPROV_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    let addr = std::env::var("KPROV_METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:9464".to_string());
    let builder = match addr.parse() {
        Ok(socket_addr) => PrometheusBuilder::new().with_http_listener(socket_addr),
        Err(e) => {
            error!(error = %e, addr, "invalid KPROV_METRICS_ADDR, metrics exporter disabled");
            return;
        }
    };
    if let Err(e) = builder.install() {
        error!(error = %e, "failed to install prometheus metrics exporter");
    }
}

/// Long-running host process: one `ProvisionerFacade` per process, multiplexing every kernel
/// this instance has launched. There is no wire protocol here yet - embedders (a gateway, the
/// CLI in single-process mode) link against `kprov-api` directly and drive the facade in the
/// same address space. This binary exists to give that facade somewhere to live with proper
/// tracing/metrics wiring and a clean shutdown path.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    init_metrics();

    let facade = ProvisionerFacade::bind_from_env().await?;
    let _facade = std::sync::Arc::new(facade);

    info!("kprov daemon ready");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, exiting");
    Ok(())
}
