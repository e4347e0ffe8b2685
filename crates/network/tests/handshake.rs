mod common;

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use mvsd_network::channel::Channel;
use mvsd_network::hosts::{BanList, HostPool};
use mvsd_network::messages::{Message, NetworkAddress, Version, NODE_NETWORK};
use mvsd_network::protocols::{version_factory, ProtocolVersion};
use mvsd_network::sessions::{PendingNonces, Session, SessionKind};
use mvsd_network::settings::NetworkSettings;
use mvsd_network::NetError;
use tokio::io::DuplexStream;

use common::{read_message, settings, write_message};

fn authority() -> SocketAddr {
    "203.0.113.1:5251".parse().unwrap()
}

fn peer_version(nonce: u64, start_height: i32) -> Version {
    Version {
        value: 70012,
        services: NODE_NETWORK,
        timestamp: 1_700_000_000,
        address_receiver: NetworkAddress::unspecified(),
        address_sender: NetworkAddress::unspecified(),
        nonce,
        user_agent: "/other:1.0/".to_string(),
        start_height,
        relay: true,
    }
}

fn make_session(
    settings: &Arc<NetworkSettings>,
    hosts: &Arc<HostPool>,
    pending: &Arc<PendingNonces>,
) -> Session {
    Session::new(
        SessionKind::Outbound,
        Arc::clone(settings),
        Arc::clone(hosts),
        Arc::new(BanList::new(Vec::new())),
        Arc::clone(pending),
        Arc::new(AtomicU64::new(100)),
    )
}

/// Scripted remote: answers our version with its own version plus verack,
/// then reads the verack we owe it. `echo_nonce` simulates a self-connect.
async fn scripted_peer(
    mut stream: DuplexStream,
    settings: Arc<NetworkSettings>,
    nonce: Option<u64>,
) {
    let Message::Version(ours) = read_message(&mut stream, &settings).await else {
        panic!("expected version first");
    };
    let nonce = nonce.unwrap_or(ours.nonce);
    write_message(
        &mut stream,
        &settings,
        &Message::Version(peer_version(nonce, 100)),
    )
    .await;
    write_message(&mut stream, &settings, &Message::Verack).await;
    // Keep the transport open until the test side hangs up.
    while common::try_read_message(&mut stream, &settings).await.is_some() {}
}

#[tokio::test]
async fn handshake_completes_and_records_peer_version() {
    let settings = settings();
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let bans = Arc::new(BanList::new(Vec::new()));
    let channel = Channel::spawn(ours, authority(), Arc::clone(&settings), bans);
    tokio::spawn(scripted_peer(
        theirs,
        Arc::clone(&settings),
        Some(0xaaaa),
    ));

    let result = ProtocolVersion::new(Arc::clone(&channel), Arc::clone(&settings), 100)
        .start()
        .await;
    assert_eq!(result, Ok(()));
    assert!(!channel.stopped());

    let peer = channel.peer_version().expect("peer version");
    assert_eq!(peer.nonce, 0xaaaa);
    assert_eq!(peer.start_height, 100);
    assert_eq!(peer.user_agent, "/other:1.0/");
}

#[tokio::test]
async fn registration_accepts_a_normal_peer() {
    let settings = settings();
    let hosts = Arc::new(HostPool::new(1000));
    let pending = Arc::new(PendingNonces::default());
    let session = make_session(&settings, &hosts, &pending);

    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let channel = Channel::spawn(
        ours,
        authority(),
        Arc::clone(&settings),
        Arc::new(BanList::new(Vec::new())),
    );
    tokio::spawn(scripted_peer(theirs, Arc::clone(&settings), Some(0xbbbb)));

    assert_eq!(session.register_channel(&channel, false).await, Ok(()));
    assert!(!channel.stopped());
    assert!(!pending.contains(channel.nonce()));
    assert_eq!(session.channel_count(), 1);
}

#[tokio::test]
async fn self_connect_is_rejected_with_accept_failed() {
    let settings = settings();
    let hosts = Arc::new(HostPool::new(1000));
    let pending = Arc::new(PendingNonces::default());
    let session = make_session(&settings, &hosts, &pending);

    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let channel = Channel::spawn(
        ours,
        authority(),
        Arc::clone(&settings),
        Arc::new(BanList::new(Vec::new())),
    );
    // The remote echoes the nonce we dialed with: it is us.
    tokio::spawn(scripted_peer(theirs, Arc::clone(&settings), None));

    assert_eq!(
        session.register_channel(&channel, false).await,
        Err(NetError::AcceptFailed)
    );
    assert!(channel.stopped());
    assert!(!pending.contains(channel.nonce()));
    assert_eq!(hosts.count(), 0);
}

#[tokio::test]
async fn duplicate_nonce_fails_pend() {
    let settings = settings();
    let hosts = Arc::new(HostPool::new(1000));
    let pending = Arc::new(PendingNonces::default());
    let session = make_session(&settings, &hosts, &pending);

    let (ours, _theirs) = tokio::io::duplex(64 * 1024);
    let channel = Channel::spawn(
        ours,
        authority(),
        Arc::clone(&settings),
        Arc::new(BanList::new(Vec::new())),
    );
    assert!(pending.pend(channel.nonce()));

    assert_eq!(
        session.register_channel(&channel, false).await,
        Err(NetError::AcceptFailed)
    );
    assert!(channel.stopped());
}

#[tokio::test]
async fn silent_peer_times_out() {
    let settings = settings();
    let (ours, _theirs) = tokio::io::duplex(64 * 1024);
    let channel = Channel::spawn(
        ours,
        authority(),
        Arc::clone(&settings),
        Arc::new(BanList::new(Vec::new())),
    );

    let result = ProtocolVersion::new(channel, Arc::clone(&settings), 100)
        .start()
        .await;
    assert_eq!(result, Err(NetError::ChannelTimeout));
}

#[test]
fn oversized_start_height_is_rejected() {
    let settings = settings();
    assert!(version_factory(&settings, authority(), 1, (1 << 31) - 1, false).is_ok());
    assert_eq!(
        version_factory(&settings, authority(), 1, 1 << 31, false)
            .err()
            .map(|ec| ec.code()),
        Some(NetError::OperationFailed.code())
    );
}

#[test]
fn quiet_version_advertises_no_services() {
    let settings = settings();
    let version = version_factory(&settings, authority(), 9, 50, true).expect("version");
    assert_eq!(version.services, 0);
    assert!(!version.relay);

    let version = version_factory(&settings, authority(), 9, 50, false).expect("version");
    assert_eq!(version.services, NODE_NETWORK);
}
