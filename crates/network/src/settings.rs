use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Advertised protocol version.
pub const PROTOCOL_VERSION: u32 = 70012;
/// First protocol version carrying the version relay flag.
pub const PROTOCOL_VERSION_RELAY: u32 = 70001;

pub const USER_AGENT: &str = concat!("/metaverse:", env!("CARGO_PKG_VERSION"), "/");

const MAINNET_IDENTIFIER: u32 = 0x4d53_564d;
const MAINNET_PORT: u16 = 5251;

/// A peer endpoint as configured: an unresolved host name plus port.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| format!("endpoint {value} missing port"))?;
        let port = port
            .parse::<u16>()
            .map_err(|err| format!("endpoint {value}: {err}"))?;
        if host.is_empty() {
            return Err(format!("endpoint {value} missing host"));
        }
        Ok(Self::new(host, port))
    }
}

/// One CIDR range of the configured blacklist.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub network: IpAddr,
    pub prefix_len: u8,
}

impl Subnet {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                let prefix = self.prefix_len.min(32) as u32;
                if prefix == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - prefix);
                (u32::from(network) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                let prefix = self.prefix_len.min(128) as u32;
                if prefix == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - prefix);
                (u128::from(network) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (network, prefix) = value
            .split_once('/')
            .ok_or_else(|| format!("subnet {value} missing prefix"))?;
        let network = network
            .parse::<IpAddr>()
            .map_err(|err| format!("subnet {value}: {err}"))?;
        let prefix_len = prefix
            .parse::<u8>()
            .map_err(|err| format!("subnet {value}: {err}"))?;
        Ok(Self {
            network,
            prefix_len,
        })
    }
}

/// Network configuration consumed by the core. The binary fills this in;
/// nothing here parses files or flags.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub identifier: u32,
    pub protocol_version: u32,
    pub services: u64,
    pub user_agent: String,
    pub relay_transactions: bool,
    pub host_pool_capacity: u32,
    pub seeds: Vec<Endpoint>,
    /// The authority advertised to peers; port 0 means "don't advertise".
    pub self_endpoint: Endpoint,
    pub outbound_connections: u32,
    pub inbound_connections: u32,
    pub manual_attempt_limit: u32,
    pub blacklist: Vec<Subnet>,
    pub misbehavior_threshold: i32,
    pub connect_timeout_seconds: u64,
    pub channel_handshake_seconds: u64,
    pub channel_germination_seconds: u64,
    pub channel_heartbeat_seconds: u64,
    pub channel_block_seconds: u64,
    pub regulator_interval_seconds: u64,
}

impl NetworkSettings {
    pub fn magic(&self) -> [u8; 4] {
        self.identifier.to_le_bytes()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn channel_handshake(&self) -> Duration {
        Duration::from_secs(self.channel_handshake_seconds)
    }

    pub fn channel_germination(&self) -> Duration {
        Duration::from_secs(self.channel_germination_seconds)
    }

    pub fn channel_heartbeat(&self) -> Duration {
        Duration::from_secs(self.channel_heartbeat_seconds)
    }

    pub fn channel_block(&self) -> Duration {
        Duration::from_secs(self.channel_block_seconds)
    }

    pub fn regulator_interval(&self) -> Duration {
        Duration::from_secs(self.regulator_interval_seconds)
    }

    pub fn advertises_self(&self) -> bool {
        self.self_endpoint.port != 0
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            identifier: MAINNET_IDENTIFIER,
            protocol_version: PROTOCOL_VERSION,
            services: crate::messages::NODE_NETWORK,
            user_agent: USER_AGENT.to_string(),
            relay_transactions: true,
            host_pool_capacity: 1000,
            seeds: Vec::new(),
            self_endpoint: Endpoint::new("0.0.0.0", 0),
            outbound_connections: 8,
            inbound_connections: 32,
            manual_attempt_limit: 0,
            blacklist: Vec::new(),
            misbehavior_threshold: 100,
            connect_timeout_seconds: 5,
            channel_handshake_seconds: 30,
            channel_germination_seconds: 30,
            channel_heartbeat_seconds: 60,
            channel_block_seconds: 5,
            regulator_interval_seconds: 5,
        }
    }
}

impl NetworkSettings {
    pub fn default_port() -> u16 {
        MAINNET_PORT
    }
}
