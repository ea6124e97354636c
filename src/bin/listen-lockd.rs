use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use listen_lock::{
    open_store, ClusterLock, LeaseView, NodeId, Owner, RenewalScheduler,
    ServiceConfig, SessionId, SessionRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "listen-lockd", version, about, long_about = None)]
struct Cli {
    /// TOML config file; LISTEN_LOCK_* environment variables override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show who holds the lease for a key
    Peek { key: String },
    /// Run a failover drill: several nodes contend for one key and the
    /// holder is killed every round
    Simulate {
        #[arg(long, default_value_t = 3)]
        nodes: usize,
        #[arg(long, default_value = "mbox:42")]
        key: String,
        /// Lease ttl; defaults to the configured one
        #[arg(long)]
        ttl_ms: Option<u64>,
        #[arg(long, default_value_t = 3)]
        rounds: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let store = open_store(&config.store)?;

    match cli.command {
        Commands::Peek { key } => {
            let engine = ClusterLock::new(store, config.lock);
            match engine.peek(&key).await? {
                LeaseView::Owned(value) => {
                    let remaining = value.remaining(engine.now_nanos());
                    println!("{key}: held by {value}, {}ms left", remaining.as_millis());
                }
                LeaseView::Unowned => println!("{key}: unowned"),
                LeaseView::Corrupt => println!("{key}: corrupt value"),
            }
        }
        Commands::Simulate {
            nodes,
            key,
            ttl_ms,
            rounds,
        } => {
            let ttl = ttl_ms.map_or(config.lock.default_ttl(), Duration::from_millis);
            let registry = Arc::new(SessionRegistry::new());
            let engine = Arc::new(
                ClusterLock::new(store, config.lock.clone()).with_oracle(registry.clone()),
            );
            simulate(engine, registry, &key, nodes.max(2), ttl, rounds).await?;
        }
    }

    Ok(())
}

async fn simulate(
    engine: Arc<ClusterLock>,
    registry: Arc<SessionRegistry>,
    key: &str,
    nodes: usize,
    ttl: Duration,
    rounds: usize,
) -> anyhow::Result<()> {
    let mut owners: Vec<Owner> = (0..nodes)
        .map(|i| Owner::new(NodeId::new(format!("node-{i}")), SessionId::random()))
        .collect();
    for owner in &owners {
        registry.register(owner);
    }
    info!(key, nodes, ?ttl, rounds, "starting failover drill");

    for round in 1..=rounds {
        let started = tokio::time::Instant::now();
        // Every node keeps trying for three windows. The winner's session stays
        // registered meanwhile, so an unrenewed but live lease must hold up.
        let attempts = owners
            .iter()
            .map(|owner| engine.acquire(key, owner, ttl, ttl * 3));
        let results = join_all(attempts).await;

        let mut winner = None;
        for result in results {
            match result {
                Ok(held) if winner.is_none() => winner = Some(held),
                Ok(held) => {
                    error!(key, owner = %held.owner(), "second winner in one epoch");
                    anyhow::bail!("mutual exclusion violated in round {round}");
                }
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(e.into()),
            }
        }
        let Some(held) = winner else {
            warn!(key, round, "nobody acquired the lease this round");
            continue;
        };

        let holder = held.owner().clone();
        info!(
            round,
            holder = %holder,
            token = held.fencing_token(),
            waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "lease acquired"
        );

        let renewal = RenewalScheduler::start(engine.clone(), held, |reason| {
            warn!(?reason, "holder lost its lease");
        });
        tokio::time::sleep(ttl).await;

        // Crash the holder node: renewals stop and all its sessions disappear
        renewal.abandon().await;
        let evicted = registry.evict_node(&holder.node);
        owners.retain(|owner| owner != &holder);
        let replacement = Owner::new(holder.node.clone(), SessionId::random());
        registry.register(&replacement);
        owners.push(replacement);
        info!(round, holder = %holder, evicted, "holder crashed");
    }

    let view = engine.peek(key).await?;
    info!(key, ?view, "failover drill finished");
    Ok(())
}
