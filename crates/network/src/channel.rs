use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::error::{io_to_net, NetError, NetResult};
use crate::hosts::BanList;
use crate::messages::{
    decode_frame_header, encode_frame, verify_checksum, Command, Message, Version,
    FRAME_HEADER_SIZE,
};
use crate::settings::NetworkSettings;

const SEND_QUEUE_DEPTH: usize = 64;

struct Outgoing {
    message: Message,
    done: oneshot::Sender<NetResult<()>>,
}

/// A full-duplex framed connection to one peer. The channel exclusively owns
/// its transport: a reader task parses frames and fans them out to
/// subscribers in registration order, a writer task drains the send queue in
/// submission order. `stop` is a one-way latch; after it fires no handler
/// runs again and pending sends complete with an error.
pub struct Channel {
    nonce: u64,
    authority: SocketAddr,
    settings: Arc<NetworkSettings>,
    bans: Arc<BanList>,
    peer_version: Mutex<Option<Version>>,
    misbehavior: AtomicI32,
    stopped: AtomicBool,
    reason: Mutex<Option<NetError>>,
    begin: watch::Sender<bool>,
    cancel: watch::Sender<bool>,
    outgoing: mpsc::Sender<Outgoing>,
    subscribers: Mutex<HashMap<Command, Vec<mpsc::UnboundedSender<Message>>>>,
    stop_waiters: Mutex<Option<Vec<oneshot::Sender<NetError>>>>,
}

impl Channel {
    pub fn spawn<S>(
        stream: S,
        authority: SocketAddr,
        settings: Arc<NetworkSettings>,
        bans: Arc<BanList>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (begin, begin_rx) = watch::channel(false);
        let (cancel, cancel_rx) = watch::channel(false);
        let (outgoing, outgoing_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let channel = Arc::new(Self {
            nonce: rand::random(),
            authority,
            settings,
            bans,
            peer_version: Mutex::new(None),
            misbehavior: AtomicI32::new(0),
            stopped: AtomicBool::new(false),
            reason: Mutex::new(None),
            begin,
            cancel,
            outgoing,
            subscribers: Mutex::new(HashMap::new()),
            stop_waiters: Mutex::new(Some(Vec::new())),
        });
        tokio::spawn(run_io(
            Arc::clone(&channel),
            stream,
            outgoing_rx,
            begin_rx,
            cancel_rx,
        ));
        channel
    }

    /// Releases the reader. Inbound frames stay in the transport until the
    /// first protocol has subscribed, so an eager peer's version message
    /// cannot slip past the handshake. Idempotent.
    pub fn begin(&self) {
        let _ = self.begin.send(true);
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn authority(&self) -> SocketAddr {
        self.authority
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The code the channel stopped with, defaulting to the voluntary code.
    pub fn reason(&self) -> NetError {
        self.reason
            .lock()
            .ok()
            .and_then(|reason| *reason)
            .unwrap_or(NetError::ChannelStopped)
    }

    pub fn set_peer_version(&self, version: Version) {
        if let Ok(mut slot) = self.peer_version.lock() {
            *slot = Some(version);
        }
    }

    pub fn peer_version(&self) -> Option<Version> {
        self.peer_version.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn peer_start_height(&self) -> Option<i32> {
        self.peer_version().map(|version| version.start_height)
    }

    /// Queues a message for transmission; resolves once the frame has been
    /// written out, in submission order.
    pub async fn send(&self, message: Message) -> NetResult<()> {
        if self.stopped() {
            return Err(self.reason());
        }
        let (done, done_rx) = oneshot::channel();
        self.outgoing
            .send(Outgoing { message, done })
            .await
            .map_err(|_| self.reason())?;
        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.reason()),
        }
    }

    /// Registers for inbound messages with the given command. Messages are
    /// fanned out in registration order; dropping the receiver detaches.
    pub fn subscribe(&self, command: Command) -> mpsc::UnboundedReceiver<Message> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if !self.stopped() {
            if let Ok(mut subscribers) = self.subscribers.lock() {
                subscribers.entry(command).or_default().push(sender);
            }
        }
        receiver
    }

    /// Resolves exactly once with the stop code, immediately when the
    /// channel has already stopped.
    pub fn subscribe_stop(&self) -> oneshot::Receiver<NetError> {
        let (sender, receiver) = oneshot::channel();
        let mut immediate = None;
        if let Ok(mut waiters) = self.stop_waiters.lock() {
            match waiters.as_mut() {
                Some(list) => list.push(sender),
                None => immediate = Some(sender),
            }
        }
        if let Some(sender) = immediate {
            let _ = sender.send(self.reason());
        }
        receiver
    }

    pub fn stop(&self, ec: NetError) {
        self.latch(ec);
    }

    /// Adds to the misbehavior score; crossing the threshold bans the
    /// authority and stops the channel with `BadStream`. Returns whether the
    /// channel was stopped.
    pub fn misbehaving(&self, amount: i32) -> bool {
        let total = self
            .misbehavior
            .fetch_add(amount, Ordering::Relaxed)
            .saturating_add(amount);
        if total >= self.settings.misbehavior_threshold {
            warn!(authority = %self.authority, score = total, "misbehavior threshold crossed, banning peer");
            self.bans.ban(self.authority);
            self.stop(NetError::BadStream);
            return true;
        }
        false
    }

    fn latch(&self, ec: NetError) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Ok(mut reason) = self.reason.lock() {
            *reason = Some(ec);
        }
        let _ = self.cancel.send(true);
        true
    }

    fn dispatch(&self, message: Message) {
        let command = message.command();
        trace!(authority = %self.authority, command = command.as_str(), "inbound message");
        if let Ok(mut subscribers) = self.subscribers.lock() {
            if let Some(list) = subscribers.get_mut(&command) {
                list.retain(|sender| sender.send(message.clone()).is_ok());
            }
        }
    }

    /// Invoked by the io supervisor once both halves have wound down; fires
    /// stop subscriptions after all pending completions have resolved.
    fn notify_stopped(&self) {
        let reason = self.reason();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
        let waiters = self
            .stop_waiters
            .lock()
            .ok()
            .and_then(|mut waiters| waiters.take());
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(reason);
            }
        }
        debug!(authority = %self.authority, code = reason.code(), "channel stopped");
    }
}

async fn run_io<S>(
    channel: Arc<Channel>,
    stream: S,
    outgoing_rx: mpsc::Receiver<Outgoing>,
    mut begin_rx: watch::Receiver<bool>,
    cancel_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let magic = channel.settings.magic();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut writer = tokio::spawn(write_loop(
        Arc::clone(&channel),
        write_half,
        outgoing_rx,
        magic,
        cancel_rx.clone(),
    ));
    let mut reader_cancel = cancel_rx;

    let begun = tokio::select! {
        changed = begin_rx.changed() => changed.is_ok(),
        _ = reader_cancel.changed() => false,
        joined = &mut writer => {
            let reason = joined.ok().flatten().unwrap_or(NetError::ChannelStopped);
            channel.latch(reason);
            false
        }
    };
    if begun {
        tokio::select! {
            reason = read_loop(&channel, read_half, magic, &mut reader_cancel) => {
                channel.latch(reason);
            }
            joined = &mut writer => {
                let reason = joined
                    .ok()
                    .flatten()
                    .unwrap_or(NetError::ChannelStopped);
                channel.latch(reason);
            }
        }
    } else {
        channel.latch(NetError::ChannelStopped);
    }
    if !writer.is_finished() {
        let _ = writer.await;
    }
    channel.notify_stopped();
}

async fn read_loop<R>(
    channel: &Channel,
    mut read: R,
    magic: [u8; 4],
    cancel: &mut watch::Receiver<bool>,
) -> NetError
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.changed() => return channel.reason(),
            result = read_message(&mut read, magic) => match result {
                Ok(Some(message)) => channel.dispatch(message),
                // Unknown command, skipped.
                Ok(None) => {}
                Err(ec) => return ec,
            }
        }
    }
}

async fn read_message<R>(read: &mut R, magic: [u8; 4]) -> NetResult<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    read.read_exact(&mut header)
        .await
        .map_err(|err| io_to_net(&err))?;
    let frame = decode_frame_header(magic, &header)?;
    let mut payload = vec![0u8; frame.length];
    read.read_exact(&mut payload)
        .await
        .map_err(|err| io_to_net(&err))?;
    if !verify_checksum(&payload, frame.checksum) {
        return Err(NetError::BadStream);
    }
    let Some(command) = Command::from_wire(&frame.command) else {
        trace!("skipping unknown command");
        return Ok(None);
    };
    Ok(Some(Message::decode(command, &payload)?))
}

async fn write_loop<W>(
    channel: Arc<Channel>,
    mut write: W,
    mut outgoing_rx: mpsc::Receiver<Outgoing>,
    magic: [u8; 4],
    mut cancel: watch::Receiver<bool>,
) -> Option<NetError>
where
    W: AsyncWrite + Unpin,
{
    let mut failure = None;
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            item = outgoing_rx.recv() => {
                let Some(Outgoing { message, done }) = item else { break };
                let frame = encode_frame(magic, &message);
                match write.write_all(&frame).await {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                    }
                    Err(err) => {
                        let ec = io_to_net(&err);
                        let _ = done.send(Err(ec));
                        failure = Some(ec);
                        break;
                    }
                }
            }
        }
    }
    // Fail whatever is still queued before the stop notification fires.
    outgoing_rx.close();
    let reason = failure.unwrap_or_else(|| channel.reason());
    while let Ok(Outgoing { done, .. }) = outgoing_rx.try_recv() {
        let _ = done.send(Err(reason));
    }
    failure
}
