//! End-to-end pool scenarios over localhost sockets.
//!
//! Each test stands up one listening pool and one connecting pool with
//! in-memory chains and drives real TCP traffic between them.

use rcoin::chain::{Chain, MemChain, MemMempool, Mempool};
use rcoin::crypto::Identity;
use rcoin::net::auth::AuthDb;
use rcoin::net::pool::{Pool, PoolEvent, PoolOptions};
use rcoin::net::types::{Checkpoint, Network, SERVICE_NETWORK};
use rcoin::primitives::{Block, BlockHeader, OutPoint, Tx, TxIn, TxOut, merkle_root};
use rcoin::types::Hash;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn base_opts() -> PoolOptions {
    let mut opts = PoolOptions::new(Network::Regtest);
    opts.discover = false;
    opts.required_services = SERVICE_NETWORK;
    opts.host = IpAddr::V4(Ipv4Addr::LOCALHOST);
    opts.port = 0; // ephemeral
    opts
}

struct Node {
    pool: Arc<Pool>,
    events: UnboundedReceiver<PoolEvent>,
    chain: Arc<MemChain>,
    mempool: Arc<MemMempool>,
}

async fn listener_node(mut opts: PoolOptions) -> Node {
    opts.listen = true;
    let chain = Arc::new(MemChain::new(Network::Regtest));
    let mempool = Arc::new(MemMempool::new());
    let (pool, events) =
        Pool::new(opts, chain.clone(), Some(mempool.clone() as Arc<dyn Mempool>));
    pool.open().await.unwrap();
    pool.connect().await.unwrap();
    Node { pool, events, chain, mempool }
}

async fn dialer_node(mut opts: PoolOptions, target: SocketAddr) -> Node {
    opts.nodes = vec![target];
    opts.max_outbound = 1;
    let chain = Arc::new(MemChain::new(Network::Regtest));
    let mempool = Arc::new(MemMempool::new());
    let (pool, events) =
        Pool::new(opts, chain.clone(), Some(mempool.clone() as Arc<dyn Mempool>));
    pool.open().await.unwrap();
    pool.connect().await.unwrap();
    Node { pool, events, chain, mempool }
}

/// Wait until `pred` matches an event, or panic on timeout.
async fn wait_for<F>(events: &mut UnboundedReceiver<PoolEvent>, what: &str, mut pred: F) -> PoolEvent
where
    F: FnMut(&PoolEvent) -> bool,
{
    let deadline = Duration::from_secs(15);
    tokio::time::timeout(deadline, async {
        loop {
            let Some(event) = events.recv().await else {
                panic!("event channel closed while waiting for {what}");
            };
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

fn coinbase_like_tx(tag: u8) -> Tx {
    Tx {
        version: 2,
        inputs: vec![TxIn {
            prevout: OutPoint { hash: [tag; 32], index: 0xffff_ffff },
            script: vec![tag, 0x51],
            sequence: 0xffff_ffff,
            witness: Vec::new(),
        }],
        outputs: vec![TxOut { value: 50_000_000, script: vec![0x51] }],
        locktime: 0,
    }
}

fn block_on(prev: Hash, tag: u8) -> Block {
    let tx = coinbase_like_tx(tag);
    Block {
        header: BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: merkle_root(&[tx.txid()]),
            time: 1_700_000_000 + tag as u32,
            bits: 0x207f_ffff,
            nonce: tag as u32,
        },
        txs: vec![tx],
    }
}

/// Extend a chain with `count` blocks; returns the block hashes.
fn grow_chain(chain: &MemChain, count: u8) -> Vec<Hash> {
    let mut prev = chain.tip().hash;
    let mut hashes = Vec::new();
    for i in 0..count {
        let block = block_on(prev, i + 1);
        prev = block.hash();
        hashes.push(prev);
        chain.add(block, 0).unwrap().unwrap();
    }
    hashes
}

#[tokio::test]
async fn plaintext_handshake_opens_both_sides() {
    let mut server = listener_node(base_opts()).await;
    let addr = server.pool.listen_addr().await.unwrap();

    let mut client = dialer_node(base_opts(), addr).await;

    wait_for(&mut client.events, "client PeerOpen", |e| {
        matches!(e, PoolEvent::PeerOpen { .. })
    })
    .await;
    wait_for(&mut server.events, "server PeerOpen", |e| {
        matches!(e, PoolEvent::PeerOpen { .. })
    })
    .await;

    // Exactly one outbound on the client, one inbound on the server,
    // and the client promoted its peer to loader.
    assert_eq!(client.pool.peer_count().await, (1, 0));
    assert_eq!(server.pool.peer_count().await, (0, 1));
    assert!(client.pool.loader_id().await.is_some());
    assert!(server.pool.loader_id().await.is_none());

    client.pool.close().await;
    server.pool.close().await;
}

#[tokio::test]
async fn encrypted_handshake_opens_both_sides() {
    let mut server_opts = base_opts();
    server_opts.encryption = true;
    let mut server = listener_node(server_opts).await;
    let addr = server.pool.listen_addr().await.unwrap();

    let mut client_opts = base_opts();
    client_opts.encryption = true;
    let mut client = dialer_node(client_opts, addr).await;

    wait_for(&mut client.events, "client PeerOpen (encrypted)", |e| {
        matches!(e, PoolEvent::PeerOpen { .. })
    })
    .await;
    wait_for(&mut server.events, "server PeerOpen (encrypted)", |e| {
        matches!(e, PoolEvent::PeerOpen { .. })
    })
    .await;

    client.pool.close().await;
    server.pool.close().await;
}

#[tokio::test]
async fn authenticated_handshake_opens_both_sides() {
    let server_id = Identity::generate();
    let client_id = Identity::generate();
    let server_pub = server_id.public_key();
    let client_pub = client_id.public_key();

    // The server authorizes the client's key.
    let mut server_db = AuthDb::new();
    server_db.add_authorized(client_pub);

    let mut server_opts = base_opts();
    server_opts.listen = true;
    let server_chain = Arc::new(MemChain::new(Network::Regtest));
    let (server_pool, mut server_events) = Pool::new_with_auth(
        server_opts,
        server_chain.clone(),
        None,
        server_id,
        server_db,
    );
    server_pool.open().await.unwrap();
    server_pool.connect().await.unwrap();
    let addr = server_pool.listen_addr().await.unwrap();

    // The client must know the server's identity by hostname.
    let mut client_db = AuthDb::new();
    client_db.add_known(&addr.to_string(), server_pub);

    let mut client_opts = base_opts();
    client_opts.nodes = vec![addr];
    client_opts.max_outbound = 1;
    let client_chain = Arc::new(MemChain::new(Network::Regtest));
    let (client_pool, mut client_events) = Pool::new_with_auth(
        client_opts,
        client_chain.clone(),
        None,
        client_id,
        client_db,
    );
    client_pool.open().await.unwrap();
    client_pool.connect().await.unwrap();

    wait_for(&mut client_events, "client PeerOpen (authed)", |e| {
        matches!(e, PoolEvent::PeerOpen { .. })
    })
    .await;
    wait_for(&mut server_events, "server PeerOpen (authed)", |e| {
        matches!(e, PoolEvent::PeerOpen { .. })
    })
    .await;

    client_pool.close().await;
    server_pool.close().await;
}

#[tokio::test]
async fn checkpoint_sync_downloads_the_chain() {
    // Server has thirty blocks; the client trusts a checkpoint at
    // height twenty and must finish the rest via getblocks.
    let server = listener_node(base_opts()).await;
    let hashes = grow_chain(&server.chain, 30);
    let addr = server.pool.listen_addr().await.unwrap();

    let mut client_opts = base_opts();
    client_opts.checkpoints =
        Some(vec![Checkpoint { height: 20, hash: hashes[19] }]);
    let mut client = dialer_node(client_opts, addr).await;

    wait_for(&mut client.events, "block at height 30", |e| {
        matches!(e, PoolEvent::Block { height: 30, .. })
    })
    .await;

    assert_eq!(client.chain.height(), 30);
    assert_eq!(client.chain.tip().hash, hashes[29]);

    client.pool.close().await;
    server.pool.close().await;
}

#[tokio::test]
async fn getblocks_sync_without_checkpoints() {
    let server = listener_node(base_opts()).await;
    let hashes = grow_chain(&server.chain, 12);
    let addr = server.pool.listen_addr().await.unwrap();

    let mut client = dialer_node(base_opts(), addr).await;

    wait_for(&mut client.events, "block at height 12", |e| {
        matches!(e, PoolEvent::Block { height: 12, .. })
    })
    .await;
    assert_eq!(client.chain.tip().hash, hashes[11]);

    client.pool.close().await;
    server.pool.close().await;
}

#[tokio::test]
async fn broadcast_tx_resolves_on_fetch() {
    let mut server = listener_node(base_opts()).await;
    let addr = server.pool.listen_addr().await.unwrap();
    let mut client = dialer_node(base_opts(), addr).await;

    wait_for(&mut client.events, "client PeerOpen", |e| {
        matches!(e, PoolEvent::PeerOpen { .. })
    })
    .await;
    wait_for(&mut server.events, "server PeerOpen", |e| {
        matches!(e, PoolEvent::PeerOpen { .. })
    })
    .await;

    let tx = coinbase_like_tx(0x77);
    let txid = tx.txid();
    let waiter = client.pool.broadcast_tx(tx).await;

    // The server requests it, receives it, and accepts it into its
    // mempool; the waiter resolves true after the ack delay.
    wait_for(&mut server.events, "server Tx event", |e| {
        matches!(e, PoolEvent::Tx { hash } if *hash == txid)
    })
    .await;
    let result = tokio::time::timeout(Duration::from_secs(10), waiter)
        .await
        .expect("broadcast ack timed out")
        .expect("broadcast waiter dropped");
    assert_eq!(result, Ok(true));
    assert!(server.mempool.has(&txid));

    client.pool.close().await;
    server.pool.close().await;
}

#[tokio::test]
async fn inbound_rejected_when_banned() {
    let server = listener_node(base_opts()).await;
    let addr = server.pool.listen_addr().await.unwrap();

    // Ban localhost on the server, then try to connect.
    server.pool.ban_host("127.0.0.1").await;

    let mut client = dialer_node(base_opts(), addr).await;
    // The client's connection is dropped before any handshake: a close
    // event (with no preceding open) arrives once the socket dies.
    wait_for(&mut client.events, "client PeerClose", |e| {
        matches!(e, PoolEvent::PeerClose { .. })
    })
    .await;
    assert_eq!(server.pool.peer_count().await, (0, 0));

    client.pool.close().await;
    server.pool.close().await;
}
