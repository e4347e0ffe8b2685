use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mvsd_primitives::{Block, Hash256};
use tracing::{debug, error};

use crate::block_chain::BlockChain;
use crate::header_queue::HeaderQueue;

/// Number of most recent block arrivals contributing to a slot's rate.
pub const RATE_WINDOW: usize = 30;
/// A slot lagging the table median by this factor is pruned.
pub const DEFAULT_RATE_FACTOR: f64 = 2.0;

struct RateSample {
    bytes: u64,
    elapsed_secs: f64,
}

struct SampleWindow {
    samples: VecDeque<RateSample>,
    last_arrival: Option<Instant>,
    created: Instant,
}

#[derive(Default)]
struct SlotQueue {
    entries: VecDeque<(u32, Hash256)>,
    // Hashes already handed to the owning channel in a getdata; stealing
    // must leave these alone or the donor's peer gets blamed for them.
    requested: HashSet<Hash256>,
}

/// One slot of the reservation table: the sub-range of header-queue
/// positions currently assigned to a single channel.
pub struct Reservation {
    slot: usize,
    queue: Mutex<SlotQueue>,
    window: Mutex<SampleWindow>,
    partitioned: AtomicBool,
}

impl Reservation {
    fn new(slot: usize) -> Arc<Self> {
        Arc::new(Self {
            slot,
            queue: Mutex::new(SlotQueue::default()),
            window: Mutex::new(SampleWindow {
                samples: VecDeque::new(),
                last_arrival: None,
                created: Instant::now(),
            }),
            partitioned: AtomicBool::new(false),
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn size(&self) -> usize {
        self.queue
            .lock()
            .map(|queue| queue.entries.len())
            .unwrap_or(0)
    }

    /// Entries not yet handed to the owning channel, the only ones a thief
    /// may take.
    fn stealable(&self) -> usize {
        self.queue
            .lock()
            .map(|queue| {
                queue
                    .entries
                    .iter()
                    .filter(|(_, hash)| !queue.requested.contains(hash))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn partitioned(&self) -> bool {
        self.partitioned.load(Ordering::SeqCst)
    }

    /// Flips the forced-retirement flag; pruning sets it, the owning
    /// protocol clears it as it observes the theft.
    pub fn toggle_partitioned(&self) -> bool {
        !self.partitioned.fetch_xor(true, Ordering::SeqCst)
    }

    /// Bytes per second over the most recent arrivals, `None` before any
    /// block has landed.
    pub fn rate(&self) -> Option<f64> {
        let window = self.window.lock().ok()?;
        if window.samples.is_empty() {
            return None;
        }
        let bytes: u64 = window.samples.iter().map(|sample| sample.bytes).sum();
        let secs: f64 = window
            .samples
            .iter()
            .map(|sample| sample.elapsed_secs)
            .sum();
        Some(bytes as f64 / secs.max(1e-6))
    }

    /// Pending hashes in fetch order.
    pub fn pending_hashes(&self) -> Vec<Hash256> {
        self.queue
            .lock()
            .map(|queue| queue.entries.iter().map(|(_, hash)| *hash).collect())
            .unwrap_or_default()
    }

    /// Up to `max` hashes from the front, marked requested and left pending
    /// until imported.
    pub fn request_hashes(&self, max: usize) -> Vec<Hash256> {
        let Ok(mut queue) = self.queue.lock() else {
            return Vec::new();
        };
        let hashes: Vec<Hash256> = queue
            .entries
            .iter()
            .take(max)
            .map(|(_, hash)| *hash)
            .collect();
        queue.requested.extend(hashes.iter().copied());
        hashes
    }

    /// Forgets in-flight markers; called when the owning channel retires so
    /// a replacement can re-request and thieves may steal again.
    pub(crate) fn clear_requested(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.requested.clear();
        }
    }

    fn find_and_erase(&self, hash: &Hash256) -> Option<u32> {
        let mut queue = self.queue.lock().ok()?;
        let index = queue.entries.iter().position(|(_, known)| known == hash)?;
        queue.requested.remove(hash);
        queue.entries.remove(index).map(|(height, _)| height)
    }

    fn record_arrival(&self, bytes: u64) {
        if let Ok(mut window) = self.window.lock() {
            let now = Instant::now();
            let since = window.last_arrival.unwrap_or(window.created);
            let elapsed_secs = now.duration_since(since).as_secs_f64();
            window.last_arrival = Some(now);
            window.samples.push_back(RateSample {
                bytes,
                elapsed_secs,
            });
            while window.samples.len() > RATE_WINDOW {
                window.samples.pop_front();
            }
        }
    }

    fn push_entries(&self, mut entries: Vec<(u32, Hash256)>) {
        if entries.is_empty() {
            return;
        }
        if let Ok(mut queue) = self.queue.lock() {
            queue.entries.extend(entries.drain(..));
            queue
                .entries
                .make_contiguous()
                .sort_unstable_by_key(|(height, _)| *height);
        }
    }

    /// Surrenders the younger half of the not-yet-requested entries.
    fn take_back_half(&self) -> Vec<(u32, Hash256)> {
        let Ok(mut queue) = self.queue.lock() else {
            return Vec::new();
        };
        let free = queue
            .entries
            .iter()
            .filter(|(_, hash)| !queue.requested.contains(hash))
            .count();
        let give = free / 2;
        if give == 0 {
            return Vec::new();
        }
        let mut stolen = Vec::with_capacity(give);
        let mut index = queue.entries.len();
        while index > 0 && stolen.len() < give {
            index -= 1;
            if !queue.requested.contains(&queue.entries[index].1) {
                let Some(entry) = queue.entries.remove(index) else {
                    break;
                };
                stolen.push(entry);
            }
        }
        stolen.reverse();
        stolen
    }

    fn take_all(&self) -> Vec<(u32, Hash256)> {
        self.queue
            .lock()
            .map(|mut queue| std::mem::take(&mut queue.entries).into_iter().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn push_sample(&self, bytes: u64, elapsed_secs: f64) {
        if let Ok(mut window) = self.window.lock() {
            window.samples.push_back(RateSample {
                bytes,
                elapsed_secs,
            });
            while window.samples.len() > RATE_WINDOW {
                window.samples.pop_front();
            }
        }
    }
}

struct OrderedCommitter {
    next_height: u32,
    buffer: BTreeMap<u32, Block>,
}

/// The reservation table: slots created round-robin over the header queue,
/// stealing and pruning under one mutex, and an ordered-commit buffer that
/// feeds the block chain in strictly increasing height order.
pub struct Reservations {
    slots: Mutex<Vec<Arc<Reservation>>>,
    committer: Mutex<OrderedCommitter>,
    chain: Arc<dyn BlockChain>,
    rate_factor: f64,
}

impl Reservations {
    /// Drains the header queue into `min(target_slots, queued)` slots,
    /// interleaved by height modulo the slot count so block-size skew
    /// spreads across channels.
    pub fn new(
        queue: &HeaderQueue,
        chain: Arc<dyn BlockChain>,
        target_slots: usize,
        rate_factor: f64,
    ) -> Self {
        let mut entries = Vec::with_capacity(queue.size());
        while let Some(entry) = queue.front() {
            entries.push(entry);
        }
        let slot_count = target_slots.min(entries.len());
        let slots: Vec<Arc<Reservation>> = (0..slot_count).map(Reservation::new).collect();
        let next_height = entries
            .iter()
            .map(|(height, _)| *height)
            .min()
            .unwrap_or(0);
        if slot_count > 0 {
            for (height, hash) in entries {
                let slot = &slots[height as usize % slot_count];
                if let Ok(mut queue) = slot.queue.lock() {
                    queue.entries.push_back((height, hash));
                }
            }
        }
        Self {
            slots: Mutex::new(slots),
            committer: Mutex::new(OrderedCommitter {
                next_height,
                buffer: BTreeMap::new(),
            }),
            chain,
            rate_factor,
        }
    }

    pub fn table(&self) -> Vec<Arc<Reservation>> {
        self.slots.lock().map(|slots| slots.clone()).unwrap_or_default()
    }

    pub fn size(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn remove(&self, slot: &Arc<Reservation>) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.retain(|known| known.slot() != slot.slot());
        }
    }

    /// Work stealing: refills an empty slot from the fastest donor. The
    /// table mutex spans the donor pop and recipient push, so no hash is
    /// ever observable in two slots.
    pub fn populate(&self, slot: &Reservation) -> bool {
        let Ok(slots) = self.slots.lock() else {
            return false;
        };
        if !slot.is_empty() {
            return true;
        }
        let donor = slots
            .iter()
            .filter(|candidate| {
                candidate.slot() != slot.slot()
                    && !candidate.partitioned()
                    && candidate.stealable() > 1
            })
            .max_by(|a, b| {
                let by_rate = a
                    .rate()
                    .unwrap_or(0.0)
                    .partial_cmp(&b.rate().unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal);
                by_rate.then(a.size().cmp(&b.size()))
            });
        let Some(donor) = donor else {
            return false;
        };
        let stolen = donor.take_back_half();
        if stolen.is_empty() {
            return false;
        }
        debug!(
            from = donor.slot(),
            to = slot.slot(),
            count = stolen.len(),
            "populated slot"
        );
        slot.push_entries(stolen);
        true
    }

    /// Marks the slowest slot for forced retirement when its rate lags the
    /// table median by more than the configured factor, re-homing its
    /// pending hashes onto the fastest slot.
    pub fn prune(&self) {
        let Ok(slots) = self.slots.lock() else {
            return;
        };
        let mut rated: Vec<(usize, f64)> = Vec::new();
        for (index, slot) in slots.iter().enumerate() {
            if slot.partitioned() || slot.is_empty() {
                continue;
            }
            if let Some(rate) = slot.rate() {
                rated.push((index, rate));
            }
        }
        if rated.len() < 2 {
            return;
        }
        rated.sort_unstable_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let median = rated[rated.len() / 2].1;
        let (slowest_index, slowest_rate) = rated[0];
        if slowest_rate * self.rate_factor >= median {
            return;
        }
        let victim = &slots[slowest_index];
        let fastest = &slots[rated[rated.len() - 1].0];
        if !victim.toggle_partitioned() {
            // Raced with another prune; leave it be.
            return;
        }
        let orphaned = victim.take_all();
        debug!(
            slot = victim.slot(),
            rate = slowest_rate,
            median,
            rehomed = orphaned.len(),
            "pruned lagging slot"
        );
        fastest.push_entries(orphaned);
    }

    /// Records a block arriving on `slot`. Returns false for hashes the
    /// slot does not expect. Accepted blocks flow through the ordered
    /// committer into the chain.
    pub fn import(&self, slot: &Reservation, block: &Block) -> bool {
        let hash = block.hash();
        let Some(height) = slot.find_and_erase(&hash) else {
            return false;
        };
        slot.record_arrival(block.serialized_size() as u64);
        self.commit(height, block.clone());
        true
    }

    fn commit(&self, height: u32, block: Block) {
        let Ok(mut committer) = self.committer.lock() else {
            return;
        };
        if height < committer.next_height || committer.buffer.contains_key(&height) {
            return;
        }
        committer.buffer.insert(height, block);
        while let Some(block) = {
            let next_height = committer.next_height;
            committer.buffer.remove(&next_height)
        } {
            let height = committer.next_height;
            if let Err(ec) = self.chain.store(&block, height) {
                error!(height, code = ec.code(), "block store failed");
                committer.buffer.insert(height, block);
                return;
            }
            committer.next_height += 1;
        }
    }

    /// Outstanding hashes across all slots, for progress accounting.
    pub fn pending_total(&self) -> usize {
        self.table().iter().map(|slot| slot.size()).sum()
    }
}
