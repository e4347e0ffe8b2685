use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use mvsd_primitives::{sha256d, Block, Decoder, Encoder, EncodingError, Hash256};

use crate::error::NetError;
use crate::settings::PROTOCOL_VERSION_RELAY;

pub const NODE_NETWORK: u64 = 1;
pub const NODE_UTXO: u64 = 2;
pub const BLOOM_FILTERS: u64 = 4;

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;

pub const FRAME_HEADER_SIZE: usize = 24;
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
pub const MAX_ADDRESSES: usize = 1000;
pub const MAX_INVENTORY: usize = 50_000;
pub const MAX_LOCATOR: usize = 500;
pub const MAX_USER_AGENT_LEN: usize = 256;
const MAX_REJECT_MESSAGE_LEN: usize = 12;
const MAX_REJECT_REASON_LEN: usize = 111;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    GetAddress,
    Address,
    GetBlocks,
    GetData,
    Block,
    Inventory,
    Reject,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::GetAddress => "getaddr",
            Command::Address => "addr",
            Command::GetBlocks => "getblocks",
            Command::GetData => "getdata",
            Command::Block => "block",
            Command::Inventory => "inv",
            Command::Reject => "reject",
        }
    }

    pub fn from_wire(raw: &[u8; 12]) -> Option<Self> {
        let end = raw.iter().position(|byte| *byte == 0).unwrap_or(12);
        match &raw[..end] {
            b"version" => Some(Command::Version),
            b"verack" => Some(Command::Verack),
            b"ping" => Some(Command::Ping),
            b"pong" => Some(Command::Pong),
            b"getaddr" => Some(Command::GetAddress),
            b"addr" => Some(Command::Address),
            b"getblocks" => Some(Command::GetBlocks),
            b"getdata" => Some(Command::GetData),
            b"block" => Some(Command::Block),
            b"inv" => Some(Command::Inventory),
            b"reject" => Some(Command::Reject),
            _ => None,
        }
    }

    fn to_wire(self) -> [u8; 12] {
        let mut out = [0u8; 12];
        let name = self.as_str().as_bytes();
        out[..name.len()].copy_from_slice(name);
        out
    }
}

/// A peer address as gossiped: services bitmask, IPv6-mapped IP and port.
/// The all-zero address with port 0 is the unspecified sentinel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetworkAddress {
    pub timestamp: u32,
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    pub fn unspecified() -> Self {
        Self {
            timestamp: 0,
            services: 0,
            ip: [0u8; 16],
            port: 0,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.ip == [0u8; 16] && self.port == 0
    }

    pub fn from_socket_addr(addr: SocketAddr, services: u64, timestamp: u32) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            timestamp,
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        let ip6 = Ipv6Addr::from(self.ip);
        let ip = match ip6.to_ipv4_mapped() {
            Some(ip4) => IpAddr::V4(ip4),
            None => IpAddr::V6(ip6),
        };
        SocketAddr::new(ip, self.port)
    }

    pub fn encode(&self, encoder: &mut Encoder, with_timestamp: bool) {
        if with_timestamp {
            encoder.write_u32_le(self.timestamp);
        }
        encoder.write_u64_le(self.services);
        encoder.write_bytes(&self.ip);
        encoder.write_u16_be(self.port);
    }

    pub fn decode(decoder: &mut Decoder<'_>, with_timestamp: bool) -> Result<Self, EncodingError> {
        let timestamp = if with_timestamp {
            decoder.read_u32_le()?
        } else {
            0
        };
        Ok(Self {
            timestamp,
            services: decoder.read_u64_le()?,
            ip: decoder.read_fixed::<16>()?,
            port: decoder.read_u16_be()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Version {
    pub value: u32,
    pub services: u64,
    pub timestamp: i64,
    pub address_receiver: NetworkAddress,
    pub address_sender: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ping {
    pub nonce: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Pong {
    pub nonce: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Address {
    pub addresses: Vec<NetworkAddress>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetBlocks {
    pub version: u32,
    pub locator: Vec<Hash256>,
    pub stop_hash: Hash256,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InventoryVector {
    pub inv_type: u32,
    pub hash: Hash256,
}

impl InventoryVector {
    pub fn block(hash: Hash256) -> Self {
        Self {
            inv_type: MSG_BLOCK,
            hash,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Inventory {
    pub inventories: Vec<InventoryVector>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reject {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Version(Version),
    Verack,
    Ping(Ping),
    Pong(Pong),
    GetAddress,
    Address(Address),
    GetBlocks(GetBlocks),
    GetData(Inventory),
    Block(Block),
    Inventory(Inventory),
    Reject(Reject),
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::Verack => Command::Verack,
            Message::Ping(_) => Command::Ping,
            Message::Pong(_) => Command::Pong,
            Message::GetAddress => Command::GetAddress,
            Message::Address(_) => Command::Address,
            Message::GetBlocks(_) => Command::GetBlocks,
            Message::GetData(_) => Command::GetData,
            Message::Block(_) => Command::Block,
            Message::Inventory(_) => Command::Inventory,
            Message::Reject(_) => Command::Reject,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            Message::Version(version) => {
                encoder.write_u32_le(version.value);
                encoder.write_u64_le(version.services);
                encoder.write_i64_le(version.timestamp);
                version.address_receiver.encode(&mut encoder, false);
                version.address_sender.encode(&mut encoder, false);
                encoder.write_u64_le(version.nonce);
                encoder.write_var_str(&version.user_agent);
                encoder.write_i32_le(version.start_height);
                if version.value >= PROTOCOL_VERSION_RELAY {
                    encoder.write_u8(version.relay as u8);
                }
            }
            Message::Verack | Message::GetAddress => {}
            Message::Ping(ping) => encoder.write_u64_le(ping.nonce),
            Message::Pong(pong) => encoder.write_u64_le(pong.nonce),
            Message::Address(address) => {
                encoder.write_varint(address.addresses.len() as u64);
                for entry in &address.addresses {
                    entry.encode(&mut encoder, true);
                }
            }
            Message::GetBlocks(get_blocks) => {
                encoder.write_u32_le(get_blocks.version);
                encoder.write_varint(get_blocks.locator.len() as u64);
                for hash in &get_blocks.locator {
                    encoder.write_hash(hash);
                }
                encoder.write_hash(&get_blocks.stop_hash);
            }
            Message::GetData(inventory) | Message::Inventory(inventory) => {
                encoder.write_varint(inventory.inventories.len() as u64);
                for vector in &inventory.inventories {
                    encoder.write_u32_le(vector.inv_type);
                    encoder.write_hash(&vector.hash);
                }
            }
            Message::Block(block) => encoder.write_bytes(&block.consensus_encode()),
            Message::Reject(reject) => {
                encoder.write_var_str(&reject.message);
                encoder.write_u8(reject.code);
                encoder.write_var_str(&reject.reason);
                encoder.write_bytes(&reject.data);
            }
        }
        encoder.into_inner()
    }

    pub fn decode(command: Command, payload: &[u8]) -> Result<Self, EncodingError> {
        let mut decoder = Decoder::new(payload);
        let message = match command {
            Command::Version => {
                let value = decoder.read_u32_le()?;
                let services = decoder.read_u64_le()?;
                let timestamp = decoder.read_i64_le()?;
                let address_receiver = NetworkAddress::decode(&mut decoder, false)?;
                let address_sender = NetworkAddress::decode(&mut decoder, false)?;
                let nonce = decoder.read_u64_le()?;
                let user_agent = decoder.read_var_str(MAX_USER_AGENT_LEN)?;
                let start_height = decoder.read_i32_le()?;
                let relay = if value >= PROTOCOL_VERSION_RELAY && !decoder.is_empty() {
                    decoder.read_u8()? != 0
                } else {
                    false
                };
                Message::Version(Version {
                    value,
                    services,
                    timestamp,
                    address_receiver,
                    address_sender,
                    nonce,
                    user_agent,
                    start_height,
                    relay,
                })
            }
            Command::Verack => Message::Verack,
            Command::Ping => Message::Ping(Ping {
                nonce: decoder.read_u64_le()?,
            }),
            Command::Pong => Message::Pong(Pong {
                nonce: decoder.read_u64_le()?,
            }),
            Command::GetAddress => Message::GetAddress,
            Command::Address => {
                let count = read_count(&mut decoder, MAX_ADDRESSES)?;
                let mut addresses = Vec::with_capacity(count);
                for _ in 0..count {
                    addresses.push(NetworkAddress::decode(&mut decoder, true)?);
                }
                Message::Address(Address { addresses })
            }
            Command::GetBlocks => {
                let version = decoder.read_u32_le()?;
                let count = read_count(&mut decoder, MAX_LOCATOR)?;
                let mut locator = Vec::with_capacity(count);
                for _ in 0..count {
                    locator.push(decoder.read_hash()?);
                }
                Message::GetBlocks(GetBlocks {
                    version,
                    locator,
                    stop_hash: decoder.read_hash()?,
                })
            }
            Command::GetData | Command::Inventory => {
                let count = read_count(&mut decoder, MAX_INVENTORY)?;
                let mut inventories = Vec::with_capacity(count);
                for _ in 0..count {
                    inventories.push(InventoryVector {
                        inv_type: decoder.read_u32_le()?,
                        hash: decoder.read_hash()?,
                    });
                }
                let inventory = Inventory { inventories };
                if command == Command::GetData {
                    Message::GetData(inventory)
                } else {
                    Message::Inventory(inventory)
                }
            }
            Command::Block => Message::Block(Block::consensus_decode(payload)?),
            Command::Reject => {
                let message = decoder.read_var_str(MAX_REJECT_MESSAGE_LEN)?;
                let code = decoder.read_u8()?;
                let reason = decoder.read_var_str(MAX_REJECT_REASON_LEN)?;
                let data = decoder.read_bytes(decoder.remaining())?.to_vec();
                Message::Reject(Reject {
                    message,
                    code,
                    reason,
                    data,
                })
            }
        };
        Ok(message)
    }
}

fn read_count(decoder: &mut Decoder<'_>, max: usize) -> Result<usize, EncodingError> {
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| EncodingError::Oversized)?;
    if count > max {
        return Err(EncodingError::Oversized);
    }
    Ok(count)
}

/// Serializes a message into a complete wire frame: magic, null-padded
/// command, payload length, leading 4 bytes of dSHA256, payload.
pub fn encode_frame(magic: [u8; 4], message: &Message) -> Vec<u8> {
    let payload = message.encode_payload();
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&magic);
    frame.extend_from_slice(&message.command().to_wire());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = sha256d(&payload);
    frame.extend_from_slice(&checksum[..4]);
    frame.extend_from_slice(&payload);
    frame
}

#[derive(Clone, Copy, Debug)]
pub struct FrameHeader {
    pub command: [u8; 12],
    pub length: usize,
    pub checksum: [u8; 4],
}

pub fn decode_frame_header(magic: [u8; 4], header: &[u8; 24]) -> Result<FrameHeader, NetError> {
    if header[..4] != magic {
        return Err(NetError::BadStream);
    }
    let mut command = [0u8; 12];
    command.copy_from_slice(&header[4..16]);
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(NetError::BadStream);
    }
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&header[20..24]);
    Ok(FrameHeader {
        command,
        length,
        checksum,
    })
}

pub fn verify_checksum(payload: &[u8], checksum: [u8; 4]) -> bool {
    sha256d(payload)[..4] == checksum
}

#[cfg(test)]
mod tests {
    use super::*;
    use mvsd_primitives::BlockHeader;
    use std::net::Ipv6Addr;

    fn sample_version(value: u32) -> Version {
        Version {
            value,
            services: NODE_NETWORK,
            timestamp: 1_700_000_000,
            address_receiver: NetworkAddress::from_socket_addr(
                "203.0.113.7:5251".parse().unwrap(),
                NODE_NETWORK,
                0,
            ),
            address_sender: NetworkAddress::unspecified(),
            nonce: 0xfeed_beef_dead_c0de,
            user_agent: "/metaverse:0.1.0/".to_string(),
            start_height: 1_234_567,
            relay: true,
        }
    }

    fn roundtrip(message: Message) {
        let payload = message.encode_payload();
        let decoded = Message::decode(message.command(), &payload).expect("decode");
        assert_eq!(decoded, message);
        assert_eq!(decoded.encode_payload(), payload);
    }

    #[test]
    fn version_roundtrip_is_bit_identical() {
        roundtrip(Message::Version(sample_version(70012)));
    }

    #[test]
    fn version_relay_omitted_before_70001() {
        let mut version = sample_version(70000);
        version.relay = false;
        let with_relay = sample_version(70012);
        let old = Message::Version(version.clone()).encode_payload();
        let new = Message::Version(with_relay).encode_payload();
        assert_eq!(new.len(), old.len() + 1);
        roundtrip(Message::Version(version));
    }

    #[test]
    fn address_roundtrip() {
        let entries = (0..3)
            .map(|index| NetworkAddress {
                timestamp: 1_700_000_000 + index,
                services: NODE_NETWORK | NODE_UTXO,
                ip: Ipv6Addr::from([0, 0, 0, 0, 0, 0xffff, 0xc000, 0x0200 + index as u16])
                    .octets(),
                port: 5251 + index as u16,
            })
            .collect();
        roundtrip(Message::Address(Address { addresses: entries }));
    }

    #[test]
    fn getblocks_getdata_inv_reject_roundtrip() {
        roundtrip(Message::GetBlocks(GetBlocks {
            version: 70012,
            locator: vec![[0xaa; 32], [0xbb; 32]],
            stop_hash: [0u8; 32],
        }));
        roundtrip(Message::GetData(Inventory {
            inventories: vec![InventoryVector::block([0x0f; 32])],
        }));
        roundtrip(Message::Inventory(Inventory {
            inventories: vec![InventoryVector {
                inv_type: MSG_TX,
                hash: [0x07; 32],
            }],
        }));
        roundtrip(Message::Reject(Reject {
            message: "block".to_string(),
            code: 0x10,
            reason: "invalid".to_string(),
            data: vec![0x11; 32],
        }));
    }

    #[test]
    fn block_roundtrip() {
        let block = Block::new(
            BlockHeader {
                version: 4,
                previous: [1u8; 32],
                merkle_root: [2u8; 32],
                timestamp: 1_600_000_000,
                bits: 0x1d00ffff,
                nonce: 7,
            },
            vec![0x00],
        );
        roundtrip(Message::Block(block));
    }

    #[test]
    fn oversized_counts_are_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_varint((MAX_ADDRESSES + 1) as u64);
        let payload = encoder.into_inner();
        assert_eq!(
            Message::decode(Command::Address, &payload),
            Err(EncodingError::Oversized)
        );
    }

    #[test]
    fn frame_header_validates_magic_length_and_checksum() {
        let magic = [0x4d, 0x56, 0x53, 0x4d];
        let frame = encode_frame(magic, &Message::Ping(Ping { nonce: 99 }));
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);

        let parsed = decode_frame_header(magic, &header).expect("header");
        assert_eq!(&parsed.command[..4], b"ping");
        assert_eq!(parsed.length, 8);
        assert!(verify_checksum(&frame[FRAME_HEADER_SIZE..], parsed.checksum));
        assert!(!verify_checksum(&[0u8; 8], parsed.checksum));

        assert!(matches!(
            decode_frame_header([0u8; 4], &header),
            Err(NetError::BadStream)
        ));
    }

    #[test]
    fn network_address_socket_mapping() {
        let addr: SocketAddr = "198.51.100.4:8820".parse().unwrap();
        let entry = NetworkAddress::from_socket_addr(addr, NODE_NETWORK, 5);
        assert_eq!(entry.to_socket_addr(), addr);
        assert!(!entry.is_unspecified());
        assert!(NetworkAddress::unspecified().is_unspecified());
    }
}
