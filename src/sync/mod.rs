//! Small concurrency primitives shared across the runtime
//!
//! Counters are plain atomics behind a narrow API; the ring buffer and
//! histogram are unsynchronized on purpose - they live inside the resource
//! monitor's state lock and inherit its serialization.

mod counter;
mod histogram;
mod ring;

pub use counter::Counter;
pub use histogram::DecayingHistogram;
pub use ring::RingBuffer;
