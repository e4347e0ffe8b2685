use std::sync::Mutex;

use mvsd_network::{NetError, NetResult};
use mvsd_primitives::Hash256;
use tracing::debug;

struct QueueInner {
    entries: std::collections::VecDeque<(u32, Hash256)>,
    valid: bool,
}

/// The ordered run of block hashes to fetch, from the first missing height
/// to the advertised tip. Filled by the header-sync collaborator, drained
/// into the reservation table.
pub struct HeaderQueue {
    inner: Mutex<QueueInner>,
}

impl HeaderQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: std::collections::VecDeque::new(),
                valid: true,
            }),
        }
    }

    /// Appends at the end; heights must be strictly increasing.
    pub fn enqueue(&self, hash: Hash256, height: u32) -> NetResult<()> {
        let Ok(mut inner) = self.inner.lock() else {
            return Err(NetError::OperationFailed);
        };
        if !inner.valid {
            return Err(NetError::OperationFailed);
        }
        if let Some((last_height, _)) = inner.entries.back() {
            if *last_height >= height {
                return Err(NetError::OperationFailed);
            }
        }
        inner.entries.push_back((height, hash));
        Ok(())
    }

    /// Removes and returns the earliest-height entry.
    pub fn front(&self) -> Option<(u32, Hash256)> {
        self.inner
            .lock()
            .ok()
            .and_then(|mut inner| inner.entries.pop_front())
    }

    pub fn size(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn first_height(&self) -> Option<u32> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.entries.front().map(|(height, _)| *height))
    }

    /// Clears the queue and marks it invalid for further appends.
    pub fn invalidate(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            debug!(dropped = inner.entries.len(), "header queue invalidated");
            inner.entries.clear();
            inner.valid = false;
        }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().map(|inner| inner.valid).unwrap_or(false)
    }
}

impl Default for HeaderQueue {
    fn default() -> Self {
        Self::new()
    }
}
