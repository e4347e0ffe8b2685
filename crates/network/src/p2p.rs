use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::error::NetResult;
use crate::hosts::{BanList, HostPool};
use crate::messages::NetworkAddress;
use crate::sessions::{
    PendingNonces, Session, SessionInbound, SessionKind, SessionOutbound, SessionSeed,
};
use crate::settings::NetworkSettings;

/// Top-level owner of the networking stack: the host pool, the ban list,
/// the shared pending-nonce set and every session.
pub struct P2p {
    settings: Arc<NetworkSettings>,
    hosts: Arc<HostPool>,
    bans: Arc<BanList>,
    pending: Arc<PendingNonces>,
    height: Arc<AtomicU64>,
    stopped: AtomicBool,
    seed: Mutex<Option<Arc<SessionSeed>>>,
    outbound: Mutex<Option<Arc<SessionOutbound>>>,
    inbound: Mutex<Option<Arc<SessionInbound>>>,
}

impl P2p {
    pub fn new(settings: NetworkSettings) -> Arc<Self> {
        let hosts = Arc::new(HostPool::new(settings.host_pool_capacity));
        let bans = Arc::new(BanList::new(settings.blacklist.clone()));
        Arc::new(Self {
            settings: Arc::new(settings),
            hosts,
            bans,
            pending: Arc::new(PendingNonces::default()),
            height: Arc::new(AtomicU64::new(0)),
            stopped: AtomicBool::new(false),
            seed: Mutex::new(None),
            outbound: Mutex::new(None),
            inbound: Mutex::new(None),
        })
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

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::Relaxed);
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    /// Builds a session sharing this node's pool, bans, nonces and height.
    pub fn session(&self, kind: SessionKind) -> Session {
        Session::new(
            kind,
            Arc::clone(&self.settings),
            Arc::clone(&self.hosts),
            Arc::clone(&self.bans),
            Arc::clone(&self.pending),
            Arc::clone(&self.height),
        )
    }

    /// Runs the seed session to completion, then brings up the outbound
    /// maintainer and, when a bind address is given, the inbound acceptor.
    pub async fn start(self: &Arc<Self>, listen: Option<SocketAddr>) -> NetResult<()> {
        let seed = SessionSeed::new(self.session(SessionKind::Seed));
        let seeded = seed.start().await;
        if let Ok(mut slot) = self.seed.lock() {
            *slot = Some(seed);
        }
        seeded?;

        let outbound = SessionOutbound::new(self.session(SessionKind::Outbound));
        outbound.start();
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = Some(outbound);
        }

        if let Some(bind_addr) = listen {
            let inbound = SessionInbound::new(self.session(SessionKind::Inbound));
            inbound.start(bind_addr).await?;
            if let Ok(mut slot) = self.inbound.lock() {
                *slot = Some(inbound);
            }
        }
        info!("p2p started");
        Ok(())
    }

    /// Stops every session (and through them every channel). Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(slot) = self.seed.lock() {
            if let Some(seed) = slot.as_ref() {
                seed.stop();
            }
        }
        if let Ok(slot) = self.outbound.lock() {
            if let Some(outbound) = slot.as_ref() {
                outbound.stop();
            }
        }
        if let Ok(slot) = self.inbound.lock() {
            if let Some(inbound) = slot.as_ref() {
                inbound.stop();
            }
        }
        info!("p2p stopped");
    }

    pub fn store(&self, address: NetworkAddress) {
        self.hosts.store(address);
    }

    pub fn address_count(&self) -> usize {
        self.hosts.count()
    }

    pub fn fetch_address(&self) -> NetResult<NetworkAddress> {
        self.hosts.fetch_one()
    }
}
