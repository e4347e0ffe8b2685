use std::collections::HashMap;
use std::sync::Mutex;

use mvsd_network::{NetError, NetResult};
use mvsd_primitives::{Block, Hash256};

/// The downstream block store. Implementations must be idempotent on
/// (height, hash); the sync core guarantees strictly increasing heights.
pub trait BlockChain: Send + Sync {
    fn store(&self, block: &Block, height: u32) -> NetResult<()>;
}

#[derive(Default)]
struct MemoryChainInner {
    commit_order: Vec<(u32, Hash256)>,
    by_height: HashMap<u32, Hash256>,
}

/// In-memory chain sink, used by the binary when no storage backend is
/// wired and by tests to observe commit order.
#[derive(Default)]
pub struct MemoryBlockChain {
    inner: Mutex<MemoryChainInner>,
}

impl MemoryBlockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.commit_order.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Heights in the order they were stored.
    pub fn heights(&self) -> Vec<u32> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .commit_order
                    .iter()
                    .map(|(height, _)| *height)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn hash_at(&self, height: u32) -> Option<Hash256> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.by_height.get(&height).copied())
    }
}

impl BlockChain for MemoryBlockChain {
    fn store(&self, block: &Block, height: u32) -> NetResult<()> {
        let Ok(mut inner) = self.inner.lock() else {
            return Err(NetError::OperationFailed);
        };
        let hash = block.hash();
        match inner.by_height.get(&height) {
            Some(existing) if *existing == hash => Ok(()),
            Some(_) => Err(NetError::OperationFailed),
            None => {
                inner.by_height.insert(height, hash);
                inner.commit_order.push((height, hash));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mvsd_primitives::BlockHeader;

    fn block(tag: u8) -> Block {
        Block::new(
            BlockHeader {
                version: 4,
                previous: [tag; 32],
                merkle_root: [0u8; 32],
                timestamp: 0,
                bits: 0,
                nonce: 0,
            },
            vec![0x00],
        )
    }

    #[test]
    fn store_is_idempotent_on_height_and_hash() {
        let chain = MemoryBlockChain::new();
        let b = block(1);
        chain.store(&b, 0).expect("store");
        chain.store(&b, 0).expect("repeat store");
        assert_eq!(chain.len(), 1);

        let conflicting = block(2);
        assert_eq!(
            chain.store(&conflicting, 0),
            Err(NetError::OperationFailed)
        );
    }
}
