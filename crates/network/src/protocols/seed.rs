use std::sync::Arc;

use tokio::time::timeout;
use tracing::trace;

use crate::channel::Channel;
use crate::error::{NetError, NetResult};
use crate::hosts::HostPool;
use crate::messages::{Address, Command, Message};
use crate::protocols::version::self_network_address;
use crate::settings::NetworkSettings;
use crate::synchronizer::Synchronizer;

/// One-shot address harvest from a seed channel. Three events complete the
/// protocol: our own address sent (or skipped when not advertised),
/// `getaddr` sent, and an inbound `addr` batch stored. The channel is
/// dropped voluntarily afterwards.
pub struct ProtocolSeed {
    channel: Arc<Channel>,
    settings: Arc<NetworkSettings>,
    hosts: Arc<HostPool>,
}

impl ProtocolSeed {
    pub fn new(
        channel: Arc<Channel>,
        settings: Arc<NetworkSettings>,
        hosts: Arc<HostPool>,
    ) -> Self {
        Self {
            channel,
            settings,
            hosts,
        }
    }

    pub async fn start(self) -> NetResult<()> {
        if self.settings.host_pool_capacity == 0 {
            return Err(NetError::NotFound);
        }
        let (sync, mut done) = Synchronizer::new(3, "seed", false);
        let mut addr_rx = self.channel.subscribe(Command::Address);
        let mut stop_rx = self.channel.subscribe_stop();

        let germinate = async {
            // 1 of 3: advertise ourselves, skipped when not configured.
            if self.settings.advertises_self() {
                let own = self_network_address(&self.settings);
                sync.set_event(
                    self.channel
                        .send(Message::Address(Address {
                            addresses: vec![own],
                        }))
                        .await,
                );
            } else {
                sync.set_event(Ok(()));
            }
            // 2 of 3: request the seed's view.
            sync.set_event(self.channel.send(Message::GetAddress).await);
            // 3 of 3: store the reply.
            loop {
                tokio::select! {
                    message = addr_rx.recv() => {
                        let Some(Message::Address(address)) = message else {
                            return Err(self.channel.reason());
                        };
                        let stored = self.hosts.store_many(&address.addresses);
                        trace!(
                            authority = %self.channel.authority(),
                            received = address.addresses.len(),
                            stored,
                            "storing addresses from seed"
                        );
                        sync.set_event(Ok(()));
                    }
                    result = &mut done => {
                        return match result {
                            Ok(outcome) => outcome,
                            Err(_) => Err(NetError::OperationFailed),
                        };
                    }
                    reason = &mut stop_rx => {
                        return Err(reason.unwrap_or(NetError::ChannelStopped));
                    }
                }
            }
        };

        let result = match timeout(self.settings.channel_germination(), germinate).await {
            Ok(result) => result,
            Err(_) => Err(NetError::ChannelTimeout),
        };
        // Seeding is complete either way; retire the channel.
        self.channel.stop(match result {
            Ok(()) => NetError::ChannelStopped,
            Err(ec) => ec,
        });
        result
    }
}
