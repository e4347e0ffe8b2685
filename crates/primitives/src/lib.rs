//! Core block types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;

pub type Hash256 = [u8; 32];

pub use block::{Block, BlockHeader};
pub use encoding::{Decoder, Encoder, EncodingError};
pub use hash::{sha256, sha256d};
