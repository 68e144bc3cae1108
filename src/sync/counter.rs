use std::sync::atomic::{AtomicI64, Ordering};

/// Shared integer counter with relaxed increment/decrement and exact reads.
///
/// Signed on purpose: a decrement racing a destroy path must saturate at a
/// visible negative value in tests rather than wrap.
#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub fn new(initial: i64) -> Self {
        Self(AtomicI64::new(initial))
    }

    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}
