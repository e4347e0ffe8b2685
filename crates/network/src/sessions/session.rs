use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tracing::debug;

use crate::acceptor::Acceptor;
use crate::channel::Channel;
use crate::connector::Connector;
use crate::error::{NetError, NetResult};
use crate::hosts::{BanList, HostPool};
use crate::protocols::ProtocolVersion;
use crate::settings::NetworkSettings;

/// Nonces of channels whose handshake has not finished, shared across all
/// sessions. A received version carrying one of these nonces is ourselves.
#[derive(Default)]
pub struct PendingNonces {
    nonces: Mutex<HashSet<u64>>,
}

impl PendingNonces {
    pub fn pend(&self, nonce: u64) -> bool {
        self.nonces
            .lock()
            .map(|mut nonces| nonces.insert(nonce))
            .unwrap_or(false)
    }

    pub fn unpend(&self, nonce: u64) {
        if let Ok(mut nonces) = self.nonces.lock() {
            nonces.remove(&nonce);
        }
    }

    pub fn contains(&self, nonce: u64) -> bool {
        self.nonces
            .lock()
            .map(|nonces| nonces.contains(&nonce))
            .unwrap_or(false)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionKind {
    Seed,
    Outbound,
    Inbound,
    BlockSync,
    Manual,
}

/// Base lifecycle for a set of channels sharing a purpose. Owns the stop
/// latch and runs the registration sequence: pend the channel nonce, drive
/// the handshake, reject self-connections, then hand the channel back
/// started.
pub struct Session {
    kind: SessionKind,
    settings: Arc<NetworkSettings>,
    hosts: Arc<HostPool>,
    bans: Arc<BanList>,
    pending: Arc<PendingNonces>,
    height: Arc<AtomicU64>,
    stopped: AtomicBool,
    stop_signal: watch::Sender<bool>,
    channels: Mutex<Vec<Weak<Channel>>>,
}

impl Session {
    pub fn new(
        kind: SessionKind,
        settings: Arc<NetworkSettings>,
        hosts: Arc<HostPool>,
        bans: Arc<BanList>,
        pending: Arc<PendingNonces>,
        height: Arc<AtomicU64>,
    ) -> Self {
        let (stop_signal, _) = watch::channel(false);
        Self {
            kind,
            settings,
            hosts,
            bans,
            pending,
            height,
            stopped: AtomicBool::new(false),
            stop_signal,
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn settings(&self) -> &Arc<NetworkSettings> {
        &self.settings
    }

    pub fn hosts(&self) -> &Arc<HostPool> {
        &self.hosts
    }

    pub fn bans(&self) -> &Arc<BanList> {
        &self.bans
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// A receiver that flips to true when the session stops.
    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_signal.subscribe()
    }

    /// Stops the session and every channel it registered. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(kind = ?self.kind, "session stopping");
        let _ = self.stop_signal.send(true);
        let channels = self
            .channels
            .lock()
            .map(|mut list| std::mem::take(&mut *list))
            .unwrap_or_default();
        for weak in channels {
            if let Some(channel) = weak.upgrade() {
                channel.stop(NetError::ServiceStopped);
            }
        }
    }

    pub fn connector(&self) -> Connector {
        Connector::new(Arc::clone(&self.settings), Arc::clone(&self.bans))
    }

    pub async fn acceptor(&self, bind_addr: SocketAddr) -> NetResult<Acceptor> {
        Acceptor::bind(bind_addr, Arc::clone(&self.settings), Arc::clone(&self.bans)).await
    }

    /// Registers a new channel: reserves its nonce, drives the handshake
    /// (quiet for sync sessions), rejects self-connections against the
    /// pending set, then tracks the channel for session stop. Any failure
    /// stops the channel with the failing code.
    pub async fn register_channel(&self, channel: &Arc<Channel>, quiet: bool) -> NetResult<()> {
        if self.stopped() {
            channel.stop(NetError::ServiceStopped);
            return Err(NetError::ServiceStopped);
        }
        if !self.pending.pend(channel.nonce()) {
            channel.stop(NetError::AcceptFailed);
            return Err(NetError::AcceptFailed);
        }

        let handshake = {
            let protocol = if quiet {
                ProtocolVersion::new_quiet(
                    Arc::clone(channel),
                    Arc::clone(&self.settings),
                    self.height(),
                )
            } else {
                ProtocolVersion::new(
                    Arc::clone(channel),
                    Arc::clone(&self.settings),
                    self.height(),
                )
            };
            protocol.start().await
        };

        let result = handshake.and_then(|()| match channel.peer_version() {
            Some(peer) if self.pending.contains(peer.nonce) => {
                debug!(authority = %channel.authority(), "connected to self, dropping");
                Err(NetError::AcceptFailed)
            }
            Some(_) => Ok(()),
            None => Err(NetError::OperationFailed),
        });

        self.pending.unpend(channel.nonce());
        match result {
            Ok(()) => {
                self.track(channel);
                Ok(())
            }
            Err(ec) => {
                channel.stop(ec);
                Err(ec)
            }
        }
    }

    fn track(&self, channel: &Arc<Channel>) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.retain(|weak| weak.strong_count() > 0);
            channels.push(Arc::downgrade(channel));
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .map(|channels| {
                channels
                    .iter()
                    .filter(|weak| {
                        weak.upgrade()
                            .map(|channel| !channel.stopped())
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
