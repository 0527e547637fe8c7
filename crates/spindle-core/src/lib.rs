//! Shared-memory transport core for the spindle task pool.
//!
//! Everything here is one *direction* of one *lane*: a 32-slot header ring
//! handed off through two atomic bitset words, a static payload area inside
//! each slot, a growable arena for larger payloads, and the codec that maps
//! [`Payload`] values onto that layout. The host-facing scheduling layers
//! (dispatchers, workers, balancing) live in the `spindle` crate.
//!
//! The concurrency contract is strictly single-producer/single-consumer per
//! direction. Nothing in this crate locks on the data path; the only blocking
//! primitive is [`signal::WakeChannel`], used to park an idle consumer.

pub mod arena;
pub mod codec;
pub mod error;
pub mod layout;
pub mod queue;
pub mod ring;
pub mod shm;
pub mod signal;

pub use arena::{Arena, ArenaReader, Reservation, SlotAllocator};
pub use codec::{register_symbol, symbol_registered, Payload, TypeTag};
pub use error::{
    BootstrapError, DecodeError, EncodeCode, EncodeError, Rejection, CLOSED_REASON,
};
pub use layout::{TaskHeader, FLAG_FULFILLED, FLAG_REJECTED, SLOT_COUNT};
pub use queue::{Frame, FrameMeta, FrameReceiver, FrameSender, SendOutcome};
pub use ring::{RingConsumer, RingProducer};
pub use shm::SharedMemory;
pub use signal::{SignalView, WakeChannel};
