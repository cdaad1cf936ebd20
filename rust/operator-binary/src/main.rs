//! Operator binary: runs the Konflux platform controllers, or dumps the
//! embedded manifest sets for inspection.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tracing::info;

use crate::{
    driver::Ctx,
    leader_election::{LeaderElectionConfig, LeaderStatus},
    metrics::Metrics,
};

mod cluster_info;
mod conditions;
mod controller;
mod crd;
mod driver;
mod leader_election;
mod manifests;
mod metrics;
mod pipelines;
mod telemetry;
mod tracking;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser)]
#[command(author, version, about)]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the operator.
    Run(RunArgs),
    /// Print the embedded manifest sets and exit.
    DumpManifests,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Address the metrics endpoint binds to.
    #[arg(
        long,
        env = "KONFLUX_OPERATOR_METRICS_BIND_ADDRESS",
        default_value = "0.0.0.0:8080"
    )]
    metrics_bind_address: SocketAddr,

    /// Address the health and readiness probes bind to. Always plaintext.
    #[arg(
        long,
        env = "KONFLUX_OPERATOR_HEALTH_PROBE_BIND_ADDRESS",
        default_value = "0.0.0.0:8081"
    )]
    health_probe_bind_address: SocketAddr,

    /// TLS certificate for the metrics endpoint. TLS is enabled when both
    /// the certificate and the key are set.
    #[arg(long, env = "KONFLUX_OPERATOR_TLS_CERT")]
    tls_cert: Option<String>,

    /// TLS key for the metrics endpoint.
    #[arg(long, env = "KONFLUX_OPERATOR_TLS_KEY")]
    tls_key: Option<String>,

    /// Enable leader election. Required when running more than one replica.
    #[arg(long, env = "KONFLUX_OPERATOR_LEADER_ELECT")]
    leader_elect: bool,

    /// Namespace the leader election lease lives in.
    #[arg(
        long,
        env = "KONFLUX_OPERATOR_LEADER_ELECTION_NAMESPACE",
        default_value = "konflux-operator"
    )]
    leader_election_namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.command {
        Command::Run(args) => run(args).await,
        Command::DumpManifests => {
            dump_manifests();
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    telemetry::init();
    info!(
        version = built_info::PKG_VERSION,
        built_at = built_info::BUILT_TIME_UTC,
        "starting {}",
        built_info::PKG_NAME
    );

    let client = Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);

    tokio::spawn(metrics::serve_metrics(
        metrics.clone(),
        args.metrics_bind_address,
        args.tls_cert,
        args.tls_key,
    ));
    tokio::spawn(metrics::serve_health(args.health_probe_bind_address));

    let leader = LeaderStatus::default();
    if args.leader_elect {
        let holder_id = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| format!("konflux-operator-{}", std::process::id()));
        let config = LeaderElectionConfig {
            lease_name: "konflux-operator-leader".to_string(),
            namespace: args.leader_election_namespace,
            holder_id,
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        };
        tokio::spawn(leader_election::run(client.clone(), config, leader.clone()));
        info!("waiting for leadership");
        while !leader.is_leader() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    } else {
        leader.force_leader();
    }

    let ctx = Arc::new(Ctx { client, metrics });
    tokio::select! {
        _ = controller::run_all(ctx) => {}
        _ = watch_leadership_loss(leader) => {
            // A replica that lost its lease must stop reconciling at once.
            anyhow::bail!("lost leadership, shutting down");
        }
    }
    Ok(())
}

async fn watch_leadership_loss(leader: LeaderStatus) {
    loop {
        if !leader.is_leader() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn dump_manifests() {
    for (component, raw) in manifests::ALL_MANIFEST_SETS {
        println!("# component: {component}");
        println!("{}", raw.trim_end());
        println!("---");
    }
}
