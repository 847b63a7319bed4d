//! rcoin — Bitcoin P2P networking node
//!
//! Minimal node wiring the pool to the in-memory reference chain: it
//! connects out, syncs headers/blocks, and relays. Storage-backed
//! chains plug in through the same `Chain` trait.

use clap::Parser;
use rcoin::chain::{MemChain, MemMempool, Mempool};
use rcoin::crypto::{Identity, identity_address};
use rcoin::net::auth::AuthDb;
use rcoin::net::pool::{Pool, PoolEvent, PoolOptions};
use rcoin::net::types::Network;
use rcoin::types::hash_to_hex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "rcoin", version, about = "Bitcoin P2P networking node")]
struct Args {
    /// Network: main, testnet, regtest
    #[arg(short, long, default_value = "main")]
    network: Network,

    /// Listen port (defaults to the network port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Accept inbound connections
    #[arg(short, long)]
    listen: bool,

    /// Static peers (comma-separated host:port)
    #[arg(short, long)]
    connect: Option<String>,

    /// Run as an SPV client (bloom-filtered blocks)
    #[arg(long)]
    spv: bool,

    /// Enable the encrypted transport
    #[arg(long)]
    encrypted: bool,

    /// Identity secret key file (32 bytes, hex); enables auth
    #[arg(long)]
    identity_file: Option<PathBuf>,

    /// known-peers file (hostname[,ip] HEX33 per line)
    #[arg(long)]
    known_peers: Option<PathBuf>,

    /// authorized-peers file (HEX33 per line)
    #[arg(long)]
    authorized_peers: Option<PathBuf>,

    /// Data directory for the address book
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Maximum outbound connections
    #[arg(long, default_value = "8")]
    max_outbound: usize,
}

fn parse_nodes(arg: &Option<String>) -> Vec<SocketAddr> {
    let Some(arg) = arg else {
        return Vec::new();
    };
    arg.split(',')
        .filter_map(|s| match s.trim().parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("skipping bad --connect entry {s:?}: {e}");
                None
            }
        })
        .collect()
}

fn load_identity(path: &PathBuf) -> Result<Identity, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let bytes = hex::decode(text.trim())?;
    Ok(Identity::from_secret_bytes(&bytes)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rcoin=info".into()),
        )
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.data_dir)?;

    let mut opts = PoolOptions::new(args.network);
    if args.spv {
        opts = opts.spv();
    }
    opts.listen = args.listen;
    if let Some(port) = args.port {
        opts.port = port;
    }
    opts.nodes = parse_nodes(&args.connect);
    opts.max_outbound = args.max_outbound;
    opts.encryption = args.encrypted;
    opts.hosts_path = Some(args.data_dir.join("hosts.dat"));

    let chain = Arc::new(MemChain::new(args.network));
    let mempool = Arc::new(MemMempool::new());

    let (pool, mut events) = match &args.identity_file {
        Some(path) => {
            let identity = load_identity(path)?;
            info!("identity address: {}", identity_address(&identity.public_key()));
            let auth_db = AuthDb::open(
                args.known_peers.as_deref(),
                args.authorized_peers.as_deref(),
            )?;
            Pool::new_with_auth(
                opts,
                chain.clone(),
                Some(mempool.clone() as Arc<dyn Mempool>),
                identity,
                auth_db,
            )
        }
        None => Pool::new(opts, chain.clone(), Some(mempool.clone() as Arc<dyn Mempool>)),
    };

    pool.open().await?;
    pool.connect().await?;
    info!("rcoin started on {:?}", args.network);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    PoolEvent::Listening(addr) => info!("listening on {addr}"),
                    PoolEvent::PeerOpen { id, addr } => {
                        info!("peer {} open ({})", id, addr.hostname());
                    }
                    PoolEvent::PeerClose { id, addr } => {
                        info!("peer {} closed ({})", id, addr.hostname());
                    }
                    PoolEvent::Loader { id } => info!("loader: peer {id}"),
                    PoolEvent::Block { hash, height } => {
                        info!("block {} at height {}", hash_to_hex(&hash), height);
                    }
                    PoolEvent::Full => info!("chain is synced"),
                    PoolEvent::Ban { addr } => warn!("banned {}", addr.hostname()),
                    PoolEvent::Error(e) => error!("{e}"),
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    pool.close().await;
    Ok(())
}
