use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use mvsd_network::channel::Channel;
use mvsd_network::hosts::{BanList, HostPool};
use mvsd_network::messages::{
    decode_frame_header, encode_frame, verify_checksum, Address, Command, Message,
    NetworkAddress, Pong, Version, FRAME_HEADER_SIZE, NODE_NETWORK,
};
use mvsd_network::sessions::{PendingNonces, Session, SessionKind};
use mvsd_network::settings::NetworkSettings;
use mvsd_network::NetError;
use mvsd_node::{
    BlockChain, HeaderQueue, MemoryBlockChain, ProtocolBlockSync, Reservations,
    SessionBlockSync, DEFAULT_RATE_FACTOR,
};
use mvsd_primitives::{Block, BlockHeader, Hash256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

fn sync_settings() -> Arc<NetworkSettings> {
    Arc::new(NetworkSettings {
        connect_timeout_seconds: 2,
        channel_handshake_seconds: 2,
        channel_block_seconds: 1,
        channel_heartbeat_seconds: 60,
        regulator_interval_seconds: 5,
        ..NetworkSettings::default()
    })
}

fn build_blocks(count: u32) -> Vec<Block> {
    (0..count)
        .map(|height| {
            Block::new(
                BlockHeader {
                    version: 4,
                    previous: [height as u8; 32],
                    merkle_root: [0x33; 32],
                    timestamp: 1_600_000_000 + height,
                    bits: 0x1d00ffff,
                    nonce: height,
                },
                vec![0x00],
            )
        })
        .collect()
}

fn queue_of(blocks: &[Block]) -> HeaderQueue {
    let queue = HeaderQueue::new();
    for (height, block) in blocks.iter().enumerate() {
        queue.enqueue(block.hash(), height as u32).expect("enqueue");
    }
    queue
}

fn make_session(settings: &Arc<NetworkSettings>, hosts: &Arc<HostPool>) -> Session {
    Session::new(
        SessionKind::BlockSync,
        Arc::clone(settings),
        Arc::clone(hosts),
        Arc::new(BanList::new(Vec::new())),
        Arc::new(PendingNonces::default()),
        Arc::new(AtomicU64::new(0)),
    )
}

async fn write_message<W>(stream: &mut W, settings: &NetworkSettings, message: &Message)
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(settings.magic(), message);
    stream.write_all(&frame).await.expect("write frame");
}

async fn try_read_message<R>(stream: &mut R, settings: &NetworkSettings) -> Option<Message>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        stream.read_exact(&mut header).await.ok()?;
        let frame = decode_frame_header(settings.magic(), &header).expect("frame header");
        let mut payload = vec![0u8; frame.length];
        stream.read_exact(&mut payload).await.ok()?;
        assert!(verify_checksum(&payload, frame.checksum));
        let Some(command) = Command::from_wire(&frame.command) else {
            continue;
        };
        return Some(Message::decode(command, &payload).expect("decode"));
    }
}

async fn respond_handshake<S>(stream: &mut S, settings: &NetworkSettings)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = Version {
        value: settings.protocol_version,
        services: NODE_NETWORK,
        timestamp: 1_700_000_000,
        address_receiver: NetworkAddress::unspecified(),
        address_sender: NetworkAddress::unspecified(),
        nonce: rand::random(),
        user_agent: "/peer:1.0/".to_string(),
        start_height: 1_000,
        relay: false,
    };
    write_message(stream, settings, &Message::Version(version)).await;
    write_message(stream, settings, &Message::Verack).await;
}

/// A block-serving peer; with `stall` it completes the handshake and the
/// keepalive but never answers `getdata`.
async fn run_block_peer(
    listener: TcpListener,
    settings: Arc<NetworkSettings>,
    blocks: Arc<HashMap<Hash256, Block>>,
    stall: bool,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let settings = Arc::clone(&settings);
        let blocks = Arc::clone(&blocks);
        tokio::spawn(async move {
            let mut stream = stream;
            while let Some(message) = try_read_message(&mut stream, &settings).await {
                match message {
                    Message::Version(_) => respond_handshake(&mut stream, &settings).await,
                    Message::Ping(ping) => {
                        write_message(
                            &mut stream,
                            &settings,
                            &Message::Pong(Pong { nonce: ping.nonce }),
                        )
                        .await
                    }
                    Message::GetAddress => {
                        write_message(
                            &mut stream,
                            &settings,
                            &Message::Address(Address::default()),
                        )
                        .await
                    }
                    Message::GetData(inventory) if !stall => {
                        for vector in inventory.inventories {
                            if let Some(block) = blocks.get(&vector.hash) {
                                write_message(
                                    &mut stream,
                                    &settings,
                                    &Message::Block(block.clone()),
                                )
                                .await;
                            }
                        }
                    }
                    _ => {}
                }
            }
        });
    }
}

async fn spawn_peer(
    settings: &Arc<NetworkSettings>,
    blocks: &Arc<HashMap<Hash256, Block>>,
    stall: bool,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let authority = listener.local_addr().expect("addr");
    tokio::spawn(run_block_peer(
        listener,
        Arc::clone(settings),
        Arc::clone(blocks),
        stall,
    ));
    authority
}

#[tokio::test]
async fn empty_header_queue_completes_immediately() {
    let settings = sync_settings();
    let hosts = Arc::new(HostPool::new(1000));
    let chain = Arc::new(MemoryBlockChain::new());
    let reservations = Arc::new(Reservations::new(
        &HeaderQueue::new(),
        Arc::clone(&chain) as Arc<dyn BlockChain>,
        2,
        DEFAULT_RATE_FACTOR,
    ));
    let session = SessionBlockSync::new(make_session(&settings, &hosts), reservations);
    assert_eq!(session.start().await, Ok(()));
    assert!(chain.is_empty());
}

/// Two slots, one healthy peer and one that stalls after the handshake. The
/// stalled slot must be retried on a fresh connection and every block must
/// reach the chain exactly once, in height order.
#[tokio::test]
async fn two_slot_sync_retries_the_stalled_slot() {
    let settings = sync_settings();
    let blocks = build_blocks(10);
    let by_hash: Arc<HashMap<Hash256, Block>> = Arc::new(
        blocks
            .iter()
            .map(|block| (block.hash(), block.clone()))
            .collect(),
    );

    let good = spawn_peer(&settings, &by_hash, false).await;
    let stall = spawn_peer(&settings, &by_hash, true).await;

    let hosts = Arc::new(HostPool::new(1000));
    hosts.store(NetworkAddress::from_socket_addr(good, NODE_NETWORK, 1));
    hosts.store(NetworkAddress::from_socket_addr(stall, NODE_NETWORK, 2));

    let chain = Arc::new(MemoryBlockChain::new());
    let queue = queue_of(&blocks);
    let reservations = Arc::new(Reservations::new(
        &queue,
        Arc::clone(&chain) as Arc<dyn BlockChain>,
        2,
        DEFAULT_RATE_FACTOR,
    ));
    assert_eq!(reservations.size(), 2);

    let session = SessionBlockSync::new(make_session(&settings, &hosts), reservations);
    let result = timeout(Duration::from_secs(60), session.start())
        .await
        .expect("sync finished");
    assert_eq!(result, Ok(()));

    // Strictly increasing heights, no duplicates, nothing missing.
    assert_eq!(chain.heights(), (0..10).collect::<Vec<u32>>());
    for (height, block) in blocks.iter().enumerate() {
        assert_eq!(chain.hash_at(height as u32), Some(block.hash()));
    }
    session.stop();
}

/// A slot whose work was pruned away completes `NotSatisfied` instead of
/// success, so the session can retire it without removing headers.
#[tokio::test]
async fn stolen_slot_completes_not_satisfied() {
    let settings = sync_settings();
    let blocks = build_blocks(4);
    let chain = Arc::new(MemoryBlockChain::new());
    let queue = queue_of(&blocks);
    let reservations = Arc::new(Reservations::new(
        &queue,
        Arc::clone(&chain) as Arc<dyn BlockChain>,
        2,
        DEFAULT_RATE_FACTOR,
    ));
    let slot = reservations.table()[0].clone();

    let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
    let channel = Channel::spawn(
        ours,
        "203.0.113.9:5251".parse().unwrap(),
        Arc::clone(&settings),
        Arc::new(BanList::new(Vec::new())),
    );

    channel.begin();
    let protocol = ProtocolBlockSync::new(
        Arc::clone(&channel),
        Arc::clone(&settings),
        Arc::clone(&reservations),
        Arc::clone(&slot),
    );
    let handle = tokio::spawn(protocol.start());

    // Read the getdata, mark the slot stolen, then serve one block so the
    // protocol wakes up and observes the theft.
    let message = try_read_message(&mut theirs, &settings).await.expect("getdata");
    let Message::GetData(inventory) = message else {
        panic!("expected getdata");
    };
    slot.toggle_partitioned();
    let first = inventory.inventories[0].hash;
    let served = blocks
        .iter()
        .find(|block| block.hash() == first)
        .expect("known hash");
    write_message(&mut theirs, &settings, &Message::Block(served.clone())).await;

    let result = timeout(Duration::from_secs(5), handle)
        .await
        .expect("protocol finished")
        .expect("join");
    assert_eq!(result, Err(NetError::NotSatisfied));
    assert!(!slot.partitioned());
}
