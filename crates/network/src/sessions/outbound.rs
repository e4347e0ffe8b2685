use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::connector::Connector;
use crate::error::NetResult;
use crate::protocols::{ProtocolAddress, ProtocolPing};
use crate::sessions::session::Session;

const CONNECT_RETRY_SECS: u64 = 5;

/// Maintains up to `outbound_connections` channels drawn from the host
/// pool, re-dialing with a fresh host whenever a channel stops.
pub struct SessionOutbound {
    session: Session,
}

impl SessionOutbound {
    pub fn new(session: Session) -> Arc<Self> {
        Arc::new(Self { session })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn start(self: &Arc<Self>) {
        let slots = self.session.settings().outbound_connections;
        for _ in 0..slots {
            let this = Arc::clone(self);
            tokio::spawn(this.maintain());
        }
    }

    async fn maintain(self: Arc<Self>) {
        let connector = self.session.connector();
        let mut session_stop = self.session.subscribe_stop();
        loop {
            if self.session.stopped() {
                break;
            }
            match self.connect_one(&connector).await {
                Ok(channel) => {
                    let mut stop_rx = channel.subscribe_stop();
                    tokio::select! {
                        _ = &mut stop_rx => {
                            // The host is dialable again.
                            self.session.hosts().release(&channel.authority());
                        }
                        _ = session_stop.changed() => break,
                    }
                }
                Err(_) => {
                    tokio::select! {
                        _ = sleep(Duration::from_secs(CONNECT_RETRY_SECS)) => {}
                        _ = session_stop.changed() => break,
                    }
                }
            }
        }
    }

    async fn connect_one(&self, connector: &Connector) -> NetResult<Arc<Channel>> {
        let address = self.session.hosts().fetch_one()?;
        let authority = address.to_socket_addr();
        let channel = match connector.connect(authority).await {
            Ok(channel) => channel,
            Err(ec) => {
                self.session.hosts().remove(&authority);
                return Err(ec);
            }
        };
        match self.session.register_channel(&channel, false).await {
            Ok(()) => {
                info!(%authority, "outbound channel started");
                ProtocolPing::new(
                    Arc::clone(&channel),
                    Arc::clone(self.session.settings()),
                )
                .start();
                ProtocolAddress::new(
                    Arc::clone(&channel),
                    Arc::clone(self.session.settings()),
                    Arc::clone(self.session.hosts()),
                )
                .start();
                Ok(channel)
            }
            Err(ec) => {
                debug!(%authority, code = ec.code(), "outbound registration failed");
                self.session.hosts().remove(&authority);
                Err(ec)
            }
        }
    }

    pub fn stop(&self) {
        self.session.stop();
    }
}
