use anyhow::Context;
use clap::Parser;
use log::{info, warn, LevelFilter};
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use tokio::signal;
use tokio::sync::broadcast;

use floodmesh::{config, kv, MemoryStore, Node};

#[derive(Parser)]
#[command(author, version, about = "floodmesh flood-search overlay node")]
struct Cli {
    #[arg(long, default_value = "floodmesh.toml")]
    config: PathBuf,

    /// Listen address, ip:port
    #[arg(short, long)]
    listen: Option<SocketAddrV4>,

    /// Key/value file answered by this node
    #[arg(short = 'f', long)]
    kv_file: Option<PathBuf>,

    /// Key to search for periodically
    #[arg(short, long)]
    search: Option<String>,

    /// Bootstrap peer, ip:port
    #[arg(short, long)]
    bootstrap: Option<SocketAddrV4>,

    /// Neighbors advertised per PONG (1-5)
    #[arg(short = 'p', long)]
    peer_ad: Option<usize>,

    /// Only connect to the bootstrap peer, never to discovered ones
    #[arg(short = 'j', long, default_value_t = false)]
    no_auto_join: bool,

    /// Suppress routine network logs
    #[arg(long, default_value_t = false)]
    quiet_net: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet_net {
        logger.filter_module("floodmesh::network", LevelFilter::Warn);
        logger.filter_module("floodmesh::overlay", LevelFilter::Warn);
    }
    logger.init();

    let mut cfg = if Path::new(&cli.config).exists() {
        config::load(&cli.config)?
    } else {
        info!("🗂️  No config at {}, using defaults", cli.config.display());
        config::Config::default()
    };
    if let Some(listen) = cli.listen {
        cfg.node.listen = listen;
    }
    if let Some(path) = cli.kv_file {
        cfg.node.kv_file = Some(path);
    }
    if let Some(key) = cli.search {
        cfg.node.search_key = Some(key);
    }
    if let Some(peer) = cli.bootstrap {
        cfg.node.bootstrap = Some(peer);
    }
    if let Some(n) = cli.peer_ad {
        cfg.node.max_peer_ad = n;
    }
    if cli.no_auto_join {
        cfg.node.auto_join = false;
    }
    let cfg = cfg.validate().context("invalid command line")?;

    let store = match &cfg.node.kv_file {
        Some(path) => {
            let store = kv::load(path)?;
            info!("🗄️  Loaded {} keys from {}", store.len(), path.display());
            store
        }
        None => {
            warn!("⚠️  No key/value file, this node will not answer queries");
            MemoryStore::new()
        }
    };

    let mut node = Node::bind(&cfg, Box::new(store)).await?;
    if let Some(peer) = cfg.node.bootstrap {
        node.add_bootstrap(peer);
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("🛑 Ctrl-C received"),
            Err(e) => {
                warn!("⚠️  Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(());
    });

    node.run(shutdown_rx).await
}
