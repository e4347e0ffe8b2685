use std::sync::Arc;

use tracing::{debug, error, info};

use crate::connector::Connector;
use crate::error::{NetError, NetResult};
use crate::protocols::{ProtocolPing, ProtocolSeed};
use crate::sessions::session::Session;
use crate::settings::Endpoint;
use crate::synchronizer::{await_final, Synchronizer};

/// Bootstrap session: one outbound connection per configured seed to
/// populate an empty host pool. Individual seed failures are suppressed;
/// the session succeeds iff the pool grew.
pub struct SessionSeed {
    session: Session,
}

impl SessionSeed {
    pub fn new(session: Session) -> Arc<Self> {
        Arc::new(Self { session })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn start(self: &Arc<Self>) -> NetResult<()> {
        let settings = self.session.settings();
        if settings.host_pool_capacity == 0 {
            info!("not configured to populate an address pool");
            return Ok(());
        }
        let start_count = self.session.hosts().count();
        if start_count != 0 {
            debug!(cached = start_count, "seeding not required");
            return Ok(());
        }
        if settings.seeds.is_empty() {
            error!("seeding required but no seeds configured");
            return Err(NetError::OperationFailed);
        }

        let connector = self.session.connector();
        let seeds = settings.seeds.clone();
        let (sync, done) = Synchronizer::new(seeds.len(), "session_seed", true);
        for seed in seeds {
            let this = Arc::clone(self);
            let connector = connector.clone();
            let sync = Arc::clone(&sync);
            tokio::spawn(async move {
                let result = this.start_seed(&connector, &seed).await;
                if let Err(ec) = result {
                    info!(%seed, code = ec.code(), "seed connection failed");
                }
                sync.set_event(result);
            });
        }
        let _ = await_final(done).await;

        let final_count = self.session.hosts().count();
        info!(start = start_count, end = final_count, "session_seed complete");
        if final_count > start_count {
            Ok(())
        } else {
            Err(NetError::OperationFailed)
        }
    }

    async fn start_seed(&self, connector: &Connector, seed: &Endpoint) -> NetResult<()> {
        if self.session.stopped() {
            debug!("suspended seed connection");
            return Err(NetError::ChannelStopped);
        }
        info!(%seed, "contacting seed");
        let channel = connector.connect_endpoint(seed).await?;
        info!(%seed, authority = %channel.authority(), "connected seed");
        self.session.register_channel(&channel, false).await?;

        ProtocolPing::new(
            Arc::clone(&channel),
            Arc::clone(self.session.settings()),
        )
        .start();
        ProtocolSeed::new(
            channel,
            Arc::clone(self.session.settings()),
            Arc::clone(self.session.hosts()),
        )
        .start()
        .await
    }

    pub fn stop(&self) {
        self.session.stop();
    }
}
