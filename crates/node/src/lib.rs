//! Block synchronization: header queue, reservation table and the parallel
//! block-sync session.

pub mod block_chain;
pub mod block_sync;
pub mod header_queue;
pub mod reservation;
pub mod session_block_sync;

pub use block_chain::{BlockChain, MemoryBlockChain};
pub use block_sync::ProtocolBlockSync;
pub use header_queue::HeaderQueue;
pub use reservation::{Reservation, Reservations, DEFAULT_RATE_FACTOR, RATE_WINDOW};
pub use session_block_sync::SessionBlockSync;
