//! Prometheus metrics plus the HTTP endpoints serving them and the
//! health/readiness probes.

use std::{net::SocketAddr, sync::Arc};

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use snafu::{ResultExt, Snafu};
use tracing::info;
use warp::Filter;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to register metric {name:?}"))]
    RegisterMetric {
        source: prometheus::Error,
        name: &'static str,
    },
}

pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "konflux_operator_reconciliations_total",
                "Total number of successful reconcile passes",
            ),
            &["controller"],
        )
        .context(RegisterMetricSnafu {
            name: "konflux_operator_reconciliations_total",
        })?;
        registry
            .register(Box::new(reconciliations.clone()))
            .context(RegisterMetricSnafu {
                name: "konflux_operator_reconciliations_total",
            })?;

        let reconcile_failures = IntCounterVec::new(
            Opts::new(
                "konflux_operator_reconcile_errors_total",
                "Total number of failed reconcile passes",
            ),
            &["controller"],
        )
        .context(RegisterMetricSnafu {
            name: "konflux_operator_reconcile_errors_total",
        })?;
        registry
            .register(Box::new(reconcile_failures.clone()))
            .context(RegisterMetricSnafu {
                name: "konflux_operator_reconcile_errors_total",
            })?;

        Ok(Metrics {
            registry,
            reconciliations,
            reconcile_failures,
        })
    }

    pub fn observe_reconcile(&self, controller: &str) {
        self.reconciliations.with_label_values(&[controller]).inc();
    }

    pub fn observe_reconcile_failure(&self, controller: &str) {
        self.reconcile_failures
            .with_label_values(&[controller])
            .inc();
    }

    fn render(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        // Encoding into a Vec cannot fail.
        let _ = encoder.encode(&self.registry.gather(), &mut buffer);
        buffer
    }
}

/// Serves `/metrics`. TLS is enabled when both a certificate and a key path
/// are given.
pub async fn serve_metrics(
    metrics: Arc<Metrics>,
    addr: SocketAddr,
    tls_cert: Option<String>,
    tls_key: Option<String>,
) {
    let route = warp::path("metrics").map(move || {
        warp::reply::with_header(
            metrics.render(),
            "content-type",
            "text/plain; version=0.0.4",
        )
    });

    match (tls_cert, tls_key) {
        (Some(cert), Some(key)) => {
            info!(%addr, "serving metrics over TLS");
            warp::serve(route)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .run(addr)
                .await;
        }
        _ => {
            info!(%addr, "serving metrics");
            warp::serve(route).run(addr).await;
        }
    }
}

/// Serves `/healthz` and `/readyz`. Always plaintext, so kubelet probes work
/// even when the metrics endpoint has TLS enabled.
pub async fn serve_health(addr: SocketAddr) {
    let healthz = warp::path("healthz").map(|| "ok");
    let readyz = warp::path("readyz").map(|| "ok");
    info!(%addr, "serving health probes");
    warp::serve(healthz.or(readyz)).run(addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_with_controller_labels() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_reconcile("build-service");
        metrics.observe_reconcile("build-service");
        metrics.observe_reconcile_failure("ui");

        let rendered = String::from_utf8(metrics.render()).unwrap();
        assert!(rendered.contains(
            "konflux_operator_reconciliations_total{controller=\"build-service\"} 2"
        ));
        assert!(rendered
            .contains("konflux_operator_reconcile_errors_total{controller=\"ui\"} 1"));
    }

    #[test]
    fn unknown_labels_start_absent() {
        let metrics = Metrics::new().unwrap();
        let rendered = String::from_utf8(metrics.render()).unwrap();
        assert!(!rendered.contains("controller=\"rbac\""));
    }
}
