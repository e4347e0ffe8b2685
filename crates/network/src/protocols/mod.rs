pub mod address;
pub mod ping;
pub mod seed;
pub mod version;

pub use address::ProtocolAddress;
pub use ping::ProtocolPing;
pub use seed::ProtocolSeed;
pub use version::{version_factory, ProtocolVersion};
