#![allow(dead_code)]

use std::sync::Arc;

use mvsd_network::messages::{
    decode_frame_header, encode_frame, verify_checksum, Command, Message, FRAME_HEADER_SIZE,
};
use mvsd_network::settings::NetworkSettings;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub fn settings() -> Arc<NetworkSettings> {
    Arc::new(NetworkSettings {
        connect_timeout_seconds: 2,
        channel_handshake_seconds: 2,
        channel_germination_seconds: 2,
        channel_heartbeat_seconds: 60,
        channel_block_seconds: 1,
        ..NetworkSettings::default()
    })
}

pub async fn write_message<W>(stream: &mut W, settings: &NetworkSettings, message: &Message)
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(settings.magic(), message);
    stream.write_all(&frame).await.expect("write frame");
}

/// Reads the next known message, skipping unknown commands; `None` once the
/// stream closes.
pub async fn try_read_message<R>(stream: &mut R, settings: &NetworkSettings) -> Option<Message>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        stream.read_exact(&mut header).await.ok()?;
        let frame = decode_frame_header(settings.magic(), &header).expect("frame header");
        let mut payload = vec![0u8; frame.length];
        stream.read_exact(&mut payload).await.ok()?;
        assert!(verify_checksum(&payload, frame.checksum));
        let Some(command) = Command::from_wire(&frame.command) else {
            continue;
        };
        return Some(Message::decode(command, &payload).expect("decode message"));
    }
}

pub async fn read_message<R>(stream: &mut R, settings: &NetworkSettings) -> Message
where
    R: AsyncRead + Unpin,
{
    try_read_message(stream, settings)
        .await
        .expect("stream closed")
}
