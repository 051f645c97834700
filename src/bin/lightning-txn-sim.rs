use clap::{Arg, ArgAction, ArgMatches, Command};
use lightning_txn::{
    init_logging, DistributedCoordinator, EngineConfig, InMemoryStore,
    InProcessNetwork, MessageHandler, TransactionId, TransactionManager, TransactionOptions,
    Transport,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lightning transaction simulator
///
/// Runs in-process clusters to exercise the coordination engine:
/// - commit: one distributed transaction across N nodes
/// - deadlock: two local transactions locking in opposite order
/// - status: cluster status after the initial election

#[tokio::main]
async fn main() {
    let matches = create_cli().get_matches();

    if let Err(e) = run_command(matches).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn create_cli() -> Command {
    Command::new("lightning-txn-sim")
        .about("Lightning transaction coordination simulator")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .help("Engine configuration file (JSON)")
                .long("config")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .help("Log level, overridden by RUST_LOG")
                .long("log-level")
                .global(true),
        )
        .arg(
            Arg::new("json-logs")
                .help("Emit logs as JSON")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("commit")
                .about("Run a distributed transaction through two-phase commit")
                .arg(nodes_arg())
                .arg(
                    Arg::new("abort-on")
                        .help("Participant whose branch aborts before prepare, e.g. node-2")
                        .long("abort-on"),
                ),
        )
        .subcommand(
            Command::new("deadlock")
                .about("Form a two-transaction lock cycle and let detection break it"),
        )
        .subcommand(
            Command::new("status")
                .about("Start a cluster, wait for an election and print its status")
                .arg(nodes_arg()),
        )
}

fn nodes_arg() -> Arg {
    Arg::new("nodes")
        .help("Number of nodes")
        .long("nodes")
        .value_parser(clap::value_parser!(usize))
        .default_value("3")
}

async fn run_command(matches: ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => simulation_config(),
    };
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if matches.get_flag("json-logs") {
        config.logging.json = true;
    }
    init_logging(config.logging.tracing_level()?, config.logging.json);

    match matches.subcommand() {
        Some(("commit", sub_matches)) => cmd_commit(&config, sub_matches).await,
        Some(("deadlock", _)) => cmd_deadlock(&config).await,
        Some(("status", sub_matches)) => cmd_status(&config, sub_matches).await,
        _ => Err("unknown command".into()),
    }
}

/// Defaults scaled down so a run finishes in seconds
fn simulation_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.transactions.lock_timeout = Duration::from_secs(2);
    config.transactions.deadlock_check_interval = Duration::from_millis(200);
    config.cluster.heartbeat_interval = Duration::from_millis(100);
    config.cluster.failure_timeout = Duration::from_millis(600);
    config.cluster.election_timeout = Duration::from_millis(400);
    config.cluster.election_jitter = Duration::from_millis(100);
    config.cluster.prepare_timeout = Duration::from_secs(2);
    config.cluster.recovery_timeout = Duration::from_secs(1);
    config.cluster.retry_backoff = Duration::from_millis(20);
    config.logging.level = "warn".to_string();
    config
}

async fn build_cluster(
    config: &EngineConfig,
    nodes: usize,
) -> Result<(Arc<InProcessNetwork>, Vec<Arc<DistributedCoordinator>>), Box<dyn std::error::Error>>
{
    let network = Arc::new(InProcessNetwork::new());
    let transport: Arc<dyn Transport> = network.clone();
    let ids: Vec<String> = (1..=nodes).map(|i| format!("node-{}", i)).collect();

    let mut coordinators = Vec::with_capacity(nodes);
    for id in &ids {
        let tm = TransactionManager::new(
            config.transactions.clone(),
            Arc::new(InMemoryStore::new()),
        );
        tm.start();

        let mut cluster = config.cluster.clone();
        cluster.node_id = id.clone();
        cluster.endpoint = format!("local://{}", id);
        let coordinator = DistributedCoordinator::new(cluster, tm, transport.clone())?;

        let handler: Arc<dyn MessageHandler> = coordinator.clone();
        network.register(id.clone(), Arc::downgrade(&handler));
        coordinators.push(coordinator);
    }

    for coordinator in &coordinators {
        for id in &ids {
            if id != coordinator.node_id() {
                coordinator.add_node(id.clone(), format!("local://{}", id))?;
            }
        }
    }
    Ok((network, coordinators))
}

async fn cmd_commit(
    config: &EngineConfig,
    matches: &ArgMatches,
) -> Result<(), Box<dyn std::error::Error>> {
    let nodes = matches.get_one::<usize>("nodes").copied().unwrap_or(3).max(2);
    let abort_on = matches.get_one::<String>("abort-on").cloned();
    let (_network, cluster) = build_cluster(config, nodes).await?;

    let coordinator = &cluster[0];
    let participants: Vec<String> = cluster[1..].iter().map(|c| c.node_id().clone()).collect();
    let tx_id = coordinator
        .begin_distributed_transaction(Some(TransactionId::new()), participants)
        .await?;
    coordinator
        .transaction_manager()
        .write(&tx_id, "order:1", "placed")
        .await?;

    for participant in &cluster[1..] {
        let tm = participant.transaction_manager();
        participant
            .join_transaction(tx_id.clone(), coordinator.node_id())
            .await?;
        tm.write(&tx_id, &format!("stock:{}", participant.node_id()), "reserved")
            .await?;
        if abort_on.as_deref() == Some(participant.node_id().as_str()) {
            tm.abort_transaction(&tx_id, "forced by simulator").await?;
            println!("{} aborted its branch before prepare", participant.node_id());
        }
    }

    let started = Instant::now();
    let result = coordinator
        .transaction_manager()
        .commit_transaction(&tx_id)
        .await;
    match &result {
        Ok(()) => println!("Transaction {} committed in {:?}", tx_id, started.elapsed()),
        Err(e) => println!("Transaction {} aborted: {}", tx_id, e),
    }

    // Decisions reach participants asynchronously
    tokio::time::sleep(Duration::from_millis(100)).await;
    for node in &cluster {
        let state = node.transaction_manager().transaction_state(&tx_id).await;
        println!("  {:<8} {:?}", node.node_id(), state);
    }

    for node in &cluster {
        node.shutdown().await?;
    }
    Ok(())
}

async fn cmd_deadlock(config: &EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(InMemoryStore::new());
    let tm = TransactionManager::new(config.transactions.clone(), store);
    tm.start();

    let t1 = tm
        .begin_transaction(Some("t1".into()), TransactionOptions::default())
        .await?;
    let t2 = tm
        .begin_transaction(Some("t2".into()), TransactionOptions::default())
        .await?;
    tm.write(&t1, "a", "from t1").await?;
    tm.write(&t2, "b", "from t2").await?;

    let first = {
        let tm = tm.clone();
        let t1 = t1.clone();
        tokio::spawn(async move { tm.write(&t1, "b", "from t1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = tm.write(&t2, "a", "from t2").await;
    let first = first.await?;

    for (tx_id, result) in [(&t1, first), (&t2, second)] {
        match result {
            Ok(()) => {
                tm.commit_transaction(tx_id).await?;
                println!("{} proceeded and committed", tx_id);
            }
            Err(e) => println!("{} chosen as victim: {}", tx_id, e),
        }
    }
    println!("{}", serde_json::to_string_pretty(&tm.metrics())?);
    tm.shutdown().await?;
    Ok(())
}

async fn cmd_status(
    config: &EngineConfig,
    matches: &ArgMatches,
) -> Result<(), Box<dyn std::error::Error>> {
    let nodes = matches.get_one::<usize>("nodes").copied().unwrap_or(3).max(1);
    let (_network, cluster) = build_cluster(config, nodes).await?;
    for node in &cluster {
        node.start()?;
    }

    let settle = config.cluster.election_timeout * 2 + config.cluster.election_jitter * 2;
    tokio::time::sleep(settle).await;

    let statuses: Vec<_> = cluster.iter().map(|c| c.get_cluster_status()).collect();
    println!("{}", serde_json::to_string_pretty(&statuses)?);

    for node in &cluster {
        node.shutdown().await?;
    }
    Ok(())
}
