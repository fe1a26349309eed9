use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use skipmesh::{
    Element, JoinOutcome, MemoryMonitor, Node, OperationConfig, Propagation, RangeQuery, SimConfig,
    SimNetwork, TracingMonitor,
};

#[derive(Parser, Debug)]
#[command(name = "skipmesh")]
#[command(author, version, about = "Run search and update operations over a simulated skip-graph overlay", long_about = None)]
struct Args {
    /// Peers to create and join.
    #[arg(short, long, default_value = "16")]
    peers: usize,

    /// Attribute dimensions per peer.
    #[arg(short, long, default_value = "2")]
    dimensions: usize,

    /// Searches to run once every peer has announced its elements.
    #[arg(short, long, default_value = "20")]
    searches: usize,

    /// Stop each search after this many owners (0 = all).
    #[arg(short, long, default_value = "0")]
    k: usize,

    /// Answer searches with parallel instead of serial propagation.
    #[arg(long)]
    parallel: bool,

    /// Peers taken offline after the overlay has formed.
    #[arg(long, default_value = "0")]
    offline: usize,

    #[arg(long, default_value = "10")]
    latency_ms: u64,

    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    #[arg(long, default_value = "42")]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, exiting");
            Ok(())
        }
        result = run(args) => result,
    }
}

async fn run(args: Args) -> Result<()> {
    let monitor = Arc::new(MemoryMonitor::new());
    let config = SimConfig {
        latency: Duration::from_millis(args.latency_ms),
        propagation: if args.parallel {
            Propagation::Parallel
        } else {
            Propagation::Serial
        },
        seed: args.seed,
        operation: OperationConfig::default().with_timeout(Duration::from_secs(args.timeout_secs)),
        ..SimConfig::default()
    };
    let network = SimNetwork::with_monitor(config, Arc::new((TracingMonitor, monitor.clone())));
    let mut rng = StdRng::seed_from_u64(args.seed);

    let nodes: Vec<Node> = (0..args.peers)
        .map(|i| network.add_peer(&format!("peer-{i}")))
        .collect();

    for node in &nodes {
        match network.join(node).await {
            Ok(JoinOutcome::FirstNode) => info!(peer = %node.contact().identity, "started overlay"),
            Ok(JoinOutcome::Joined { entry }) => {
                info!(peer = %node.contact().identity, entry = %entry.identity, "joined overlay")
            }
            Err(e) => warn!(peer = %node.contact().identity, error = %e, "join failed"),
        }
    }
    info!(population = network.population(), "overlay formed");

    let dimensions: Vec<String> = (0..args.dimensions).map(|d| format!("dim-{d}")).collect();
    for node in &nodes {
        let adds = dimensions
            .iter()
            .map(|d| Element::new(d.clone(), rng.gen_range(0..100), node.contact()))
            .collect();
        if let Err(e) = node.update(adds, vec![]).await {
            warn!(peer = %node.contact().identity, error = %e, "announcement failed");
        }
    }

    let mut shuffled = nodes.clone();
    shuffled.shuffle(&mut rng);
    for node in shuffled.iter().take(args.offline) {
        network.set_online(&node.contact().identity, false);
        info!(peer = %node.contact().identity, "peer went offline");
    }

    let requesters: Vec<&Node> = shuffled.iter().skip(args.offline).collect();
    for _ in 0..args.searches {
        let requester = requesters
            .choose(&mut rng)
            .context("every peer is offline")?;
        let queries = dimensions
            .iter()
            .map(|d| {
                let lower = rng.gen_range(0..60);
                RangeQuery::new(d.clone(), lower, Some(lower + 40))
            })
            .collect();
        match requester.search(queries, args.k).await {
            Ok(found) => info!(peer = %requester.contact().identity, owners = found.len(), "search finished"),
            Err(e) => warn!(peer = %requester.contact().identity, error = %e, "search failed"),
        }
    }

    let searches = monitor.searches();
    let succeeded = searches.iter().filter(|r| r.success).count();
    let hops: usize = searches.iter().map(|r| r.hops.total).sum();
    info!(
        searches = searches.len(),
        succeeded,
        mean_hops = if searches.is_empty() { 0.0 } else { hops as f64 / searches.len() as f64 },
        updates = monitor.updates().len(),
        joins = monitor.joins().len(),
        "summary"
    );
    for (kind, usage) in network.bandwidth() {
        info!(kind, messages = usage.messages, bytes = usage.bytes, "bandwidth");
    }

    Ok(())
}
