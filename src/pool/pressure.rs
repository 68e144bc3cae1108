//! Pressure-aware driver acquisition
//!
//! Callers that need a driver while the monitor reports high load park on
//! the pool's condition variable in jittered chunks, re-polling the verdict
//! each chunk, bounded by the configured maximum wait.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{DriverPool, PooledDriver};

/// Jitter added to every wait chunk so a fleet of blocked workers does not
/// stampede the pool on release.
const JITTER_RANGE: (f64, f64) = (0.1, 0.3);

/// Block until the load gate clears. Returns `true` once unblocked,
/// `false` when `allow_timeout` is set and the bound expired first.
pub async fn wait_high_load(pool: &DriverPool, context: &str, allow_timeout: bool) -> bool {
    let blocking = &pool.config().resources.memory_tuning.pressure_blocking;
    let max_wait = blocking.max_wait();
    let chunk = blocking.chunk();

    let start = Instant::now();
    debug!(context, stats = ?pool.stats(), "high-load wait start");

    while pool.is_high_load() && !pool.is_shutdown() {
        if allow_timeout && start.elapsed() >= max_wait {
            warn!(
                context,
                waited_sec = start.elapsed().as_secs_f64(),
                "high-load wait timed out"
            );
            return false;
        }

        let jitter = rand::thread_rng().gen_range(JITTER_RANGE.0..JITTER_RANGE.1);
        let step = chunk + Duration::from_secs_f64(jitter);
        if pool.wait_for_unblock(step).await {
            break;
        }
    }

    debug!(
        context,
        blocked_sec = start.elapsed().as_secs_f64(),
        high_load = pool.is_high_load(),
        "high-load wait end"
    );
    true
}

/// Worker-side acquisition: wait out system pressure (bounded), then ask
/// the pool for a driver without a second load wait.
pub async fn acquire_with_pressure_check(
    pool: &DriverPool,
    context: &str,
) -> Option<PooledDriver> {
    if pool.is_high_load() {
        warn!(context, "driver acquisition blocked by system pressure");
        wait_high_load(pool, context, true).await;
    }

    pool.get_driver(None, true).await
}
