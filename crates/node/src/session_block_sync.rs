use std::sync::{Arc, Mutex};
use std::time::Duration;

use mvsd_network::channel::Channel;
use mvsd_network::connector::Connector;
use mvsd_network::protocols::{ProtocolAddress, ProtocolPing};
use mvsd_network::sessions::Session;
use mvsd_network::synchronizer::{await_final, Synchronizer};
use mvsd_network::{NetError, NetResult};
use tokio::time::{interval, sleep};
use tracing::{debug, info};

use crate::block_sync::ProtocolBlockSync;
use crate::reservation::{Reservation, Reservations};

const HOST_RETRY_SECS: u64 = 1;

/// Runs the parallel download: one channel per reservation slot, the quiet
/// handshake, retry on a fresh peer after any per-slot failure, and a
/// regulator timer that prunes lagging slots every tick.
pub struct SessionBlockSync {
    session: Session,
    reservations: Arc<Reservations>,
}

impl SessionBlockSync {
    pub fn new(session: Session, reservations: Arc<Reservations>) -> Arc<Self> {
        Arc::new(Self {
            session,
            reservations,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn start(self: &Arc<Self>) -> NetResult<()> {
        let table = self.reservations.table();
        if table.is_empty() {
            return Ok(());
        }
        info!(slots = table.len(), "getting blocks");

        let connector = self.session.connector();
        let remaining = Arc::new(Mutex::new(table.len()));
        let (sync, done) = Synchronizer::new(table.len(), "session_block_sync", true);
        for row in table {
            let this = Arc::clone(self);
            let connector = connector.clone();
            let remaining = Arc::clone(&remaining);
            let sync = Arc::clone(&sync);
            tokio::spawn(this.slot_loop(connector, row, remaining, sync));
        }
        let regulator = Arc::clone(self);
        tokio::spawn(regulator.regulate());

        await_final(done).await?;
        let was_stopped = self.session.stopped();
        // Sync is over either way; wind down the regulator and any strays.
        self.session.stop();
        if was_stopped {
            return Err(NetError::ServiceStopped);
        }
        Ok(())
    }

    async fn slot_loop(
        self: Arc<Self>,
        connector: Connector,
        row: Arc<Reservation>,
        remaining: Arc<Mutex<usize>>,
        sync: Arc<Synchronizer>,
    ) {
        loop {
            if self.session.stopped() {
                debug!(slot = row.slot(), "suspending slot");
                sync.set_event(Err(NetError::ServiceStopped));
                return;
            }
            debug!(slot = row.slot(), "starting slot");
            match self.run_slot(&connector, &row).await {
                Ok(()) => {
                    let left = remaining
                        .lock()
                        .map(|mut count| {
                            *count -= 1;
                            *count
                        })
                        .unwrap_or(0);
                    self.reservations.remove(&row);
                    debug!(slot = row.slot(), left, "completed slot");
                    sync.set_event(Ok(()));
                    return;
                }
                Err(NetError::NotSatisfied) => {
                    // Stolen work: retire quietly unless this is the last
                    // outstanding slot, which keeps retrying.
                    let retire = remaining
                        .lock()
                        .map(|mut count| {
                            if *count != 1 {
                                *count -= 1;
                                true
                            } else {
                                false
                            }
                        })
                        .unwrap_or(false);
                    if retire {
                        debug!(slot = row.slot(), "slot retired after theft");
                        sync.set_event(Ok(()));
                        return;
                    }
                }
                Err(ec) => {
                    debug!(slot = row.slot(), code = ec.code(), "slot failed, retrying");
                }
            }
        }
    }

    async fn run_slot(&self, connector: &Connector, row: &Arc<Reservation>) -> NetResult<()> {
        let address = match self.session.hosts().fetch_one() {
            Ok(address) => address,
            Err(ec) => {
                sleep(Duration::from_secs(HOST_RETRY_SECS)).await;
                return Err(ec);
            }
        };
        let authority = address.to_socket_addr();
        let channel = match connector.connect(authority).await {
            Ok(channel) => channel,
            Err(ec) => {
                self.session.hosts().remove(&authority);
                return Err(ec);
            }
        };
        self.session.register_channel(&channel, true).await?;
        debug!(slot = row.slot(), %authority, "connected slot");

        ProtocolPing::new(Arc::clone(&channel), Arc::clone(self.session.settings())).start();
        ProtocolAddress::new(
            Arc::clone(&channel),
            Arc::clone(self.session.settings()),
            Arc::clone(self.session.hosts()),
        )
        .start();

        let result = ProtocolBlockSync::new(
            Arc::clone(&channel),
            Arc::clone(self.session.settings()),
            Arc::clone(&self.reservations),
            Arc::clone(row),
        )
        .start()
        .await;

        finish_channel(&channel, &result);
        if result.is_ok() {
            self.session.hosts().release(&authority);
        }
        result
    }

    async fn regulate(self: Arc<Self>) {
        let mut tick = interval(self.session.settings().regulator_interval());
        let mut session_stop = self.session.subscribe_stop();
        // The first tick fires immediately; skip it.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.session.stopped() {
                        break;
                    }
                    self.reservations.prune();
                }
                _ = session_stop.changed() => break,
            }
        }
    }

    pub fn stop(&self) {
        self.session.stop();
    }
}

fn finish_channel(channel: &Arc<Channel>, result: &NetResult<()>) {
    let code = match result {
        Ok(()) => NetError::ChannelStopped,
        Err(ec) => *ec,
    };
    channel.stop(code);
}
