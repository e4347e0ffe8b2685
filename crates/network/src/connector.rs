use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::channel::Channel;
use crate::error::{NetError, NetResult};
use crate::hosts::BanList;
use crate::settings::{Endpoint, NetworkSettings};

/// Outbound dialer producing channels. Banned and blacklisted authorities
/// fail `AddressBlocked` before any socket is opened.
#[derive(Clone)]
pub struct Connector {
    settings: Arc<NetworkSettings>,
    bans: Arc<BanList>,
}

impl Connector {
    pub fn new(settings: Arc<NetworkSettings>, bans: Arc<BanList>) -> Self {
        Self { settings, bans }
    }

    pub async fn connect(&self, authority: SocketAddr) -> NetResult<Arc<Channel>> {
        if self.bans.blocked(&authority) {
            debug!(%authority, "dial refused, address blocked");
            return Err(NetError::AddressBlocked);
        }
        let stream = match timeout(
            self.settings.connect_timeout(),
            TcpStream::connect(authority),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(%authority, %err, "connect failed");
                return Err(NetError::OperationFailed);
            }
            Err(_) => return Err(NetError::ChannelTimeout),
        };
        Ok(Channel::spawn(
            stream,
            authority,
            Arc::clone(&self.settings),
            Arc::clone(&self.bans),
        ))
    }

    /// Resolves a configured endpoint and dials its addresses until one
    /// connects.
    pub async fn connect_endpoint(&self, endpoint: &Endpoint) -> NetResult<Arc<Channel>> {
        let resolved = lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|err| {
                debug!(%endpoint, %err, "endpoint resolution failed");
                NetError::OperationFailed
            })?;
        let mut last = NetError::OperationFailed;
        for authority in resolved {
            match self.connect(authority).await {
                Ok(channel) => return Ok(channel),
                Err(ec) => last = ec,
            }
        }
        Err(last)
    }
}
