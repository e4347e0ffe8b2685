use std::sync::Arc;

use tracing::trace;

use crate::channel::Channel;
use crate::hosts::HostPool;
use crate::messages::{Address, Command, Message, MAX_ADDRESSES};
use crate::protocols::version::self_network_address;
use crate::settings::NetworkSettings;

/// Address gossip: advertises our own authority when configured, requests
/// the peer's view once, stores inbound `addr` batches into the host pool
/// and serves `getaddr` from a pool sample.
pub struct ProtocolAddress {
    channel: Arc<Channel>,
    settings: Arc<NetworkSettings>,
    hosts: Arc<HostPool>,
}

impl ProtocolAddress {
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

    pub fn start(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let mut addr_rx = self.channel.subscribe(Command::Address);
        let mut getaddr_rx = self.channel.subscribe(Command::GetAddress);
        let mut stop_rx = self.channel.subscribe_stop();

        if self.settings.advertises_self() {
            let own = self_network_address(&self.settings);
            if !own.is_unspecified()
                && self
                    .channel
                    .send(Message::Address(Address {
                        addresses: vec![own],
                    }))
                    .await
                    .is_err()
            {
                return;
            }
        }
        if self.channel.send(Message::GetAddress).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                message = addr_rx.recv() => {
                    let Some(Message::Address(address)) = message else { break };
                    let stored = self.hosts.store_many(&address.addresses);
                    trace!(
                        authority = %self.channel.authority(),
                        received = address.addresses.len(),
                        stored,
                        "address gossip"
                    );
                }
                message = getaddr_rx.recv() => {
                    if message.is_none() {
                        break;
                    }
                    let sample = self.hosts.sample(MAX_ADDRESSES);
                    if self
                        .channel
                        .send(Message::Address(Address { addresses: sample }))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                _ = &mut stop_rx => break,
            }
        }
    }
}
