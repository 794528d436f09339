use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::info;

use driver_core::cluster::{Cluster, ClusterSetting};
use driver_core::config::{PolicyKind, TopologyConfig};
use driver_core::control::state::ConnectionState;
use driver_core::ext::init_logger_with_filter;
use driver_core::host::Host;
use driver_core::simulation::{eventually, SimCluster};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
enum Scenario {
    /// Three nodes, a foreign node takes over the address of a stopped one.
    A,
    /// Two nodes, the control host fails after the other address was reused.
    B,
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(value_enum, default_value = "a")]
    scenario: Scenario,
    /// Seconds to watch the cluster once the address is reused.
    #[arg(long, default_value = "30")]
    observe: u64,
    /// TOML file layered over the embedded defaults.
    #[arg(short, long)]
    config: Option<String>,
    /// Millisecond intervals instead of the configured ones.
    #[arg(long)]
    quick: bool,
    #[arg(long)]
    json: bool,
    #[arg(long, default_value = "info,driver_core=debug")]
    log: String,
}

#[derive(Debug, Serialize)]
struct Outcome {
    scenario: Scenario,
    up_hosts: usize,
    max_up_hosts: usize,
    control_state: ConnectionState,
    control_open: bool,
    hosts: Vec<Host>,
    retired: Vec<Host>,
}

fn node(index: u8) -> SocketAddr {
    SocketAddr::from(([127, 0, 1, index], 9042))
}

fn load_config(args: &Args) -> anyhow::Result<TopologyConfig> {
    let mut builder = TopologyConfig::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::with_name(path));
    }
    let builder = builder.add_source(config::Environment::with_prefix("TOPOLOGY").separator("__"));
    let mut config = builder.build()?;
    if args.quick {
        config.reconnection.policy = PolicyKind::Constant;
        config.reconnection.base_delay = Duration::from_millis(100);
        config.reconnection.max_delay = Duration::from_millis(500);
        config.reconciliation.interval = Duration::from_millis(200);
    }
    Ok(config)
}

async fn connect(
    sim: &SimCluster,
    config: TopologyConfig,
    contact_points: Vec<SocketAddr>,
) -> anyhow::Result<Cluster> {
    let setting = ClusterSetting::builder()
        .connector(Arc::new(sim.clone()))
        .contact_points(contact_points)
        .config(config)
        .build();
    Cluster::connect(setting).await
}

/// Largest up count seen while watching for `window`.
async fn watch(cluster: &Cluster, window: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + window;
    let mut max_up_hosts = cluster.up_host_count();
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        max_up_hosts = max_up_hosts.max(cluster.up_host_count());
    }
    max_up_hosts
}

fn outcome(scenario: Scenario, cluster: &Cluster, max_up_hosts: usize) -> Outcome {
    let control = cluster.control();
    Outcome {
        scenario,
        up_hosts: cluster.up_host_count(),
        max_up_hosts,
        control_state: control.connection_state(),
        control_open: control.is_open(),
        hosts: cluster.snapshot().iter().cloned().collect(),
        retired: cluster.registry().retired(),
    }
}

async fn foreign_reuse(
    sim: &SimCluster,
    config: TopologyConfig,
    observe: Duration,
) -> anyhow::Result<Outcome> {
    for index in 1..=3 {
        sim.add_node("main", node(index));
    }
    let cluster = connect(sim, config, vec![node(2), node(3)]).await?;
    info!("stopping {}", node(1));
    sim.stop(node(1));
    let went_down = eventually(observe, || {
        cluster
            .registry()
            .get(&node(1))
            .is_some_and(|host| host.is_down())
    })
    .await;
    if !went_down {
        bail!("{} was never reported down", node(1));
    }
    let foreign = sim.recommission(node(1), "other");
    sim.leak_into(node(1), "main");
    info!("{} now answers as other/{}", node(1), foreign);
    let max_up_hosts = watch(&cluster, observe).await;
    let outcome = outcome(Scenario::A, &cluster, max_up_hosts);
    cluster.close().await;
    Ok(outcome)
}

async fn control_failover(
    sim: &SimCluster,
    config: TopologyConfig,
    observe: Duration,
) -> anyhow::Result<Outcome> {
    sim.add_node("main", node(1));
    sim.add_node("main", node(2));
    sim.stop(node(1));
    let cluster = connect(sim, config, vec![node(1), node(2)]).await?;
    let foreign = sim.recommission(node(1), "other");
    sim.leak_into(node(1), "main");
    info!("{} now answers as other/{}, stopping {}", node(1), foreign, node(2));
    sim.stop(node(2));
    let max_up_hosts = watch(&cluster, observe).await;
    let outcome = outcome(Scenario::B, &cluster, max_up_hosts);
    cluster.close().await;
    Ok(outcome)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logger_with_filter(args.log.as_str());
    let config = load_config(&args)?;
    let observe = Duration::from_secs(args.observe);
    let sim = SimCluster::new();
    let outcome = match args.scenario {
        Scenario::A => foreign_reuse(&sim, config, observe).await?,
        Scenario::B => control_failover(&sim, config, observe).await?,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("scenario {:?}", outcome.scenario);
        println!("up hosts: {} (max {})", outcome.up_hosts, outcome.max_up_hosts);
        println!("control connection: {} (open: {})", outcome.control_state, outcome.control_open);
        for host in &outcome.hosts {
            println!("  {}", host);
        }
        for host in &outcome.retired {
            println!("  retired {}", host);
        }
    }
    Ok(())
}
