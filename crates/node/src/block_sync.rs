use std::collections::HashSet;
use std::sync::Arc;

use mvsd_network::channel::Channel;
use mvsd_network::messages::{Command, Inventory, InventoryVector, Message};
use mvsd_network::settings::NetworkSettings;
use mvsd_network::{NetError, NetResult};
use mvsd_primitives::Hash256;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::reservation::{Reservation, Reservations};

const GETDATA_BATCH: usize = 128;

/// Downloads the blocks of one reservation slot over one channel: batched
/// `getdata` requests sized by remaining slot depth, a per-block arrival
/// deadline, misbehavior on unsolicited blocks. An emptied slot first tries
/// to steal work; with nothing left to steal the protocol completes. A slot
/// pruned away completes `NotSatisfied`.
pub struct ProtocolBlockSync {
    channel: Arc<Channel>,
    settings: Arc<NetworkSettings>,
    reservations: Arc<Reservations>,
    slot: Arc<Reservation>,
}

impl ProtocolBlockSync {
    pub fn new(
        channel: Arc<Channel>,
        settings: Arc<NetworkSettings>,
        reservations: Arc<Reservations>,
        slot: Arc<Reservation>,
    ) -> Self {
        Self {
            channel,
            settings,
            reservations,
            slot,
        }
    }

    pub async fn start(self) -> NetResult<()> {
        let result = self.run().await;
        // Whatever happened to this channel, its in-flight markers die with
        // it so a successor or a thief can pick the hashes up.
        self.slot.clear_requested();
        result
    }

    async fn run(&self) -> NetResult<()> {
        let mut block_rx = self.channel.subscribe(Command::Block);
        let mut stop_rx = self.channel.subscribe_stop();

        loop {
            if self.stolen() {
                return Err(NetError::NotSatisfied);
            }
            if self.slot.is_empty() && !self.reservations.populate(self.slot.as_ref()) {
                debug!(slot = self.slot.slot(), "slot drained");
                return Ok(());
            }

            let request = self.slot.request_hashes(GETDATA_BATCH);
            if request.is_empty() {
                // Pruned away between the emptiness check and the request.
                continue;
            }
            let inventories = request.iter().copied().map(InventoryVector::block).collect();
            self.channel
                .send(Message::GetData(Inventory { inventories }))
                .await?;
            trace!(
                slot = self.slot.slot(),
                requested = request.len(),
                "requested blocks"
            );

            let mut outstanding: HashSet<Hash256> = request.into_iter().collect();
            while !outstanding.is_empty() {
                if self.stolen() {
                    return Err(NetError::NotSatisfied);
                }
                let message = tokio::select! {
                    message = block_rx.recv() => message,
                    reason = &mut stop_rx => {
                        return Err(reason.unwrap_or(NetError::ChannelStopped));
                    }
                    _ = sleep(self.settings.channel_block()) => {
                        debug!(slot = self.slot.slot(), "block deadline expired");
                        return Err(NetError::ChannelTimeout);
                    }
                };
                let Some(Message::Block(block)) = message else {
                    return Err(self.channel.reason());
                };
                let hash = block.hash();
                if self.reservations.import(self.slot.as_ref(), &block) {
                    outstanding.remove(&hash);
                } else if self.stolen() {
                    return Err(NetError::NotSatisfied);
                } else {
                    trace!(slot = self.slot.slot(), "unsolicited block");
                    if self.channel.misbehaving(1) {
                        return Err(NetError::BadStream);
                    }
                }
            }
        }
    }

    fn stolen(&self) -> bool {
        if self.slot.partitioned() {
            self.slot.toggle_partitioned();
            return true;
        }
        false
    }
}
