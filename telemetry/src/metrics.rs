use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Installs the global metrics recorder and serves it on `listen_addr` at `/metrics`.
///
/// `labels` are attached to every series, typically the source table and destination.
pub fn init_metrics(listen_addr: SocketAddr, labels: &[(&str, String)]) -> Result<(), BuildError> {
    let mut builder = PrometheusBuilder::new().with_http_listener(listen_addr);
    for (key, value) in labels {
        builder = builder.add_global_label(*key, value.clone());
    }

    builder.install()
}
