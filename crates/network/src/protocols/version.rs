use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::timeout;
use tracing::trace;

use crate::channel::Channel;
use crate::error::{NetError, NetResult};
use crate::messages::{Command, Message, NetworkAddress, Version};
use crate::settings::NetworkSettings;

fn time_stamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as u32)
        .unwrap_or(0)
}

/// The authority we advertise, or the unspecified sentinel when the
/// configured self endpoint is not an address or carries port 0.
pub(crate) fn self_network_address(settings: &NetworkSettings) -> NetworkAddress {
    if !settings.advertises_self() {
        return NetworkAddress::unspecified();
    }
    match settings.self_endpoint.host.parse::<std::net::IpAddr>() {
        Ok(ip) => NetworkAddress::from_socket_addr(
            SocketAddr::new(ip, settings.self_endpoint.port),
            settings.services,
            unix_now(),
        ),
        Err(_) => NetworkAddress::unspecified(),
    }
}

/// Builds our version message. Heights past the 32-bit signed range are
/// rejected; the wire field cannot carry them.
pub fn version_factory(
    settings: &NetworkSettings,
    authority: SocketAddr,
    nonce: u64,
    height: u64,
    quiet: bool,
) -> NetResult<Version> {
    if height >= (1u64 << 31) {
        // Time to upgrade the protocol.
        return Err(NetError::OperationFailed);
    }
    let services = if quiet { 0 } else { settings.services };
    Ok(Version {
        value: settings.protocol_version,
        services,
        timestamp: time_stamp(),
        address_receiver: NetworkAddress::from_socket_addr(authority, services, 0),
        address_sender: self_network_address(settings),
        nonce,
        user_agent: settings.user_agent.clone(),
        start_height: height as i32,
        relay: !quiet && settings.relay_transactions,
    })
}

/// The version handshake: send our `version`, then require the peer's
/// `version` (acknowledged with our `verack`) and the peer's `verack`, both
/// within the handshake deadline. The quiet variant advertises no services
/// and no relay, for sync channels.
pub struct ProtocolVersion {
    channel: Arc<Channel>,
    settings: Arc<NetworkSettings>,
    height: u64,
    quiet: bool,
}

impl ProtocolVersion {
    pub fn new(channel: Arc<Channel>, settings: Arc<NetworkSettings>, height: u64) -> Self {
        Self {
            channel,
            settings,
            height,
            quiet: false,
        }
    }

    pub fn new_quiet(channel: Arc<Channel>, settings: Arc<NetworkSettings>, height: u64) -> Self {
        Self {
            channel,
            settings,
            height,
            quiet: true,
        }
    }

    pub async fn start(self) -> NetResult<()> {
        let mut version_rx = self.channel.subscribe(Command::Version);
        let mut verack_rx = self.channel.subscribe(Command::Verack);
        let mut stop_rx = self.channel.subscribe_stop();
        // Subscriptions are in place; let the reader loose.
        self.channel.begin();
        let own = version_factory(
            &self.settings,
            self.channel.authority(),
            self.channel.nonce(),
            self.height,
            self.quiet,
        )?;

        let handshake = async {
            self.channel.send(Message::Version(own)).await?;
            let mut have_version = false;
            let mut have_verack = false;
            while !(have_version && have_verack) {
                tokio::select! {
                    message = version_rx.recv() => {
                        let Some(Message::Version(version)) = message else {
                            return Err(self.channel.reason());
                        };
                        trace!(
                            authority = %self.channel.authority(),
                            value = version.value,
                            services = version.services,
                            agent = %version.user_agent,
                            "peer version"
                        );
                        self.channel.set_peer_version(version);
                        self.channel.send(Message::Verack).await?;
                        have_version = true;
                    }
                    message = verack_rx.recv() => {
                        if message.is_none() {
                            return Err(self.channel.reason());
                        }
                        have_verack = true;
                    }
                    reason = &mut stop_rx => {
                        return Err(reason.unwrap_or(NetError::ChannelStopped));
                    }
                }
            }
            Ok(())
        };

        match timeout(self.settings.channel_handshake(), handshake).await {
            Ok(result) => result,
            Err(_) => Err(NetError::ChannelTimeout),
        }
    }
}
