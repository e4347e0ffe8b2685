use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::acceptor::Acceptor;
use crate::error::{NetError, NetResult};
use crate::protocols::{ProtocolAddress, ProtocolPing};
use crate::sessions::session::Session;

const ACCEPT_BACKOFF_SECS: u64 = 1;

/// Accept loop honoring the inbound connection cap and the ban list.
pub struct SessionInbound {
    session: Session,
    live: AtomicUsize,
}

impl SessionInbound {
    pub fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            session,
            live: AtomicUsize::new(0),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn start(self: &Arc<Self>, bind_addr: SocketAddr) -> NetResult<()> {
        if self.session.settings().inbound_connections == 0 {
            info!("not configured to accept incoming connections");
            return Ok(());
        }
        let acceptor = self.session.acceptor(bind_addr).await?;
        let this = Arc::clone(self);
        tokio::spawn(this.run(acceptor));
        Ok(())
    }

    async fn run(self: Arc<Self>, acceptor: Acceptor) {
        let cap = self.session.settings().inbound_connections as usize;
        let mut session_stop = self.session.subscribe_stop();
        loop {
            let channel = tokio::select! {
                accepted = acceptor.accept() => match accepted {
                    Ok(channel) => channel,
                    Err(NetError::AddressBlocked) => continue,
                    Err(_) => {
                        sleep(Duration::from_secs(ACCEPT_BACKOFF_SECS)).await;
                        continue;
                    }
                },
                _ = session_stop.changed() => break,
            };
            if self.live.load(Ordering::SeqCst) >= cap {
                debug!(authority = %channel.authority(), "inbound capacity reached, dropping");
                channel.stop(NetError::AcceptFailed);
                continue;
            }
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if this.session.register_channel(&channel, false).await.is_ok() {
                    info!(authority = %channel.authority(), "inbound channel started");
                    this.live.fetch_add(1, Ordering::SeqCst);
                    ProtocolPing::new(
                        Arc::clone(&channel),
                        Arc::clone(this.session.settings()),
                    )
                    .start();
                    ProtocolAddress::new(
                        Arc::clone(&channel),
                        Arc::clone(this.session.settings()),
                        Arc::clone(this.session.hosts()),
                    )
                    .start();
                    let _ = channel.subscribe_stop().await;
                    this.live.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }
    }

    pub fn stop(&self) {
        self.session.stop();
    }
}
