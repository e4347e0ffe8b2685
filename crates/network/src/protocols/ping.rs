use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::error::NetError;
use crate::messages::{Command, Message, Ping, Pong};
use crate::settings::NetworkSettings;

/// Keepalive: pings on every heartbeat, answers inbound pings, and stops the
/// channel when a pong fails to arrive before the next beat or carries the
/// wrong nonce.
pub struct ProtocolPing {
    channel: Arc<Channel>,
    settings: Arc<NetworkSettings>,
}

impl ProtocolPing {
    pub fn new(channel: Arc<Channel>, settings: Arc<NetworkSettings>) -> Self {
        Self { channel, settings }
    }

    pub fn start(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let mut ping_rx = self.channel.subscribe(Command::Ping);
        let mut pong_rx = self.channel.subscribe(Command::Pong);
        let mut stop_rx = self.channel.subscribe_stop();
        let mut beat = tokio::time::interval(self.settings.channel_heartbeat());
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut outstanding: Option<u64> = None;

        loop {
            tokio::select! {
                _ = beat.tick() => {
                    if outstanding.is_some() {
                        debug!(authority = %self.channel.authority(), "ping unanswered");
                        self.channel.stop(NetError::ChannelTimeout);
                        break;
                    }
                    let nonce = rand::random();
                    if self.channel.send(Message::Ping(Ping { nonce })).await.is_err() {
                        break;
                    }
                    outstanding = Some(nonce);
                }
                message = ping_rx.recv() => {
                    let Some(Message::Ping(ping)) = message else { break };
                    if self
                        .channel
                        .send(Message::Pong(Pong { nonce: ping.nonce }))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                message = pong_rx.recv() => {
                    let Some(Message::Pong(pong)) = message else { break };
                    if Some(pong.nonce) == outstanding {
                        trace!(authority = %self.channel.authority(), "pong");
                        outstanding = None;
                    } else {
                        debug!(authority = %self.channel.authority(), "pong nonce mismatch");
                        self.channel.stop(NetError::BadStream);
                        break;
                    }
                }
                _ = &mut stop_rx => break,
            }
        }
    }
}
