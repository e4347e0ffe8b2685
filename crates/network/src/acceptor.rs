use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::error::{NetError, NetResult};
use crate::hosts::BanList;
use crate::settings::NetworkSettings;

/// Inbound listener producing channels.
pub struct Acceptor {
    listener: TcpListener,
    settings: Arc<NetworkSettings>,
    bans: Arc<BanList>,
}

impl Acceptor {
    pub async fn bind(
        bind_addr: SocketAddr,
        settings: Arc<NetworkSettings>,
        bans: Arc<BanList>,
    ) -> NetResult<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|err| {
            debug!(%bind_addr, %err, "listener bind failed");
            NetError::OperationFailed
        })?;
        if let Ok(local) = listener.local_addr() {
            info!(%local, "p2p listening");
        }
        Ok(Self {
            listener,
            settings,
            bans,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accepts one connection; a blocked remote is dropped with
    /// `AddressBlocked` and never becomes a channel.
    pub async fn accept(&self) -> NetResult<Arc<Channel>> {
        let (stream, authority) = self
            .listener
            .accept()
            .await
            .map_err(|_| NetError::OperationFailed)?;
        if self.bans.blocked(&authority) {
            debug!(%authority, "inbound refused, address blocked");
            return Err(NetError::AddressBlocked);
        }
        Ok(Channel::spawn(
            stream,
            authority,
            Arc::clone(&self.settings),
            Arc::clone(&self.bans),
        ))
    }
}
