use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!("portfolio_loads_total", "Number of portfolio loads started.");
    describe_counter!(
        "portfolio_load_failures_total",
        "Number of loads or backfills aborted by a provider failure."
    );
    describe_counter!(
        "portfolio_history_backfills_total",
        "Number of history backfill runs started."
    );
    describe_counter!(
        "portfolio_history_patch_chains_total",
        "Number of chains patched with historical prices."
    );
    describe_gauge!("portfolio_net_worth", "Net worth of the last published view (USD).");
    describe_counter!("portfolio_api_requests_total", "Number of provider API requests made.");
    describe_counter!("portfolio_api_errors_total", "Number of provider API requests that failed after retries.");
    describe_histogram!("portfolio_api_latency_ms", "Provider API request latency in milliseconds.");
    describe_histogram!(
        "portfolio_store_latency_ms",
        "Local store operation latency in milliseconds."
    );
    describe_counter!(
        "portfolio_store_errors_total",
        "Number of local store operations that failed."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}
