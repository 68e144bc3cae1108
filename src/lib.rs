//! Drover - runtime core for a browser-automation harness
//!
//! A pool of headless-browser workers drains an in-memory task queue under
//! continuous system-pressure feedback. Five control loops cooperate:
//!
//! - **Task dispatch**: workers pull envelopes from a FIFO queue
//! - **Worker lifecycle**: dead workers are replaced, the fleet scales with demand
//! - **Driver pool**: browser drivers are created with retries, reused, swept when idle
//! - **Admission budget**: new driver spawns are rate-limited per rolling window
//! - **Pressure monitor**: memory/CPU sampling with hysteresis drives a high-load gate
//!
//! The browser protocol itself is an injected capability: callers provide a
//! [`driver::DriverFactory`] that produces opaque [`driver::Driver`] handles,
//! and a [`manager::TaskProcessor`] that does the per-task browser work.

pub mod budget;
pub mod config;
pub mod driver;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod pool;
pub mod queue;
pub mod runtime;
pub mod sync;
pub mod types;
pub mod worker;

pub use config::Config;
pub use driver::{Driver, DriverFactory, DriverOptions};
pub use manager::{TaskManager, TaskProcessor};
pub use pool::DriverPool;
pub use runtime::{setup_runtime, teardown_runtime, Runtime};
pub use types::{DroverError, Result};
