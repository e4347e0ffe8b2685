use crate::encoding::{Decoder, Encoder, EncodingError};
use crate::hash::sha256d;
use crate::Hash256;

pub const HEADER_SIZE: usize = 80;

/// Bitcoin-family 80-byte block header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: u32,
    pub previous: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_hash(&self.previous);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.timestamp);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            version: decoder.read_u32_le()?,
            previous: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            timestamp: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }

    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.consensus_encode(&mut encoder);
        sha256d(&encoder.into_inner())
    }
}

/// A block as carried on the wire: header plus the serialized transaction
/// section. Transactions are opaque to the sync core.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<u8>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<u8>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE + self.transactions.len());
        self.header.consensus_encode(&mut encoder);
        encoder.write_bytes(&self.transactions);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, EncodingError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode(&mut decoder)?;
        let transactions = decoder.read_bytes(decoder.remaining())?.to_vec();
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE + self.transactions.len()
    }
}
