//! Peer-to-peer networking: framed channels, protocol state machines,
//! sessions and the host pool.

pub mod acceptor;
pub mod channel;
pub mod connector;
pub mod error;
pub mod hosts;
pub mod messages;
pub mod p2p;
pub mod protocols;
pub mod sessions;
pub mod settings;
pub mod synchronizer;

pub use acceptor::Acceptor;
pub use channel::Channel;
pub use connector::Connector;
pub use error::{success_envelope, NetError, NetResult};
pub use hosts::{BanList, HostPool};
pub use p2p::P2p;
pub use sessions::{PendingNonces, Session, SessionKind};
pub use settings::{Endpoint, NetworkSettings, Subnet, PROTOCOL_VERSION, USER_AGENT};
pub use synchronizer::Synchronizer;
