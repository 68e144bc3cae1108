//! Periodic status reporting
//!
//! One line per interval with runtime, task progress, pool occupancy, and
//! the monitor's latest readings. Emitted through `tracing` under the
//! `drover::status` target so operators can filter it independently.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::RuntimeState;
use crate::manager::TaskManager;
use crate::monitor::ResourceMonitor;
use crate::pool::DriverPool;

pub(super) async fn run_status_loop<T: Send + Sync + 'static>(
    state: Arc<RuntimeState>,
    manager: Arc<TaskManager<T>>,
    pool: Arc<DriverPool>,
    monitor: Arc<ResourceMonitor>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
        report(&state, &manager, &pool, &monitor);
    }
    debug!("status loop stopped");
}

fn report<T: Send + Sync + 'static>(
    state: &RuntimeState,
    manager: &TaskManager<T>,
    pool: &DriverPool,
    monitor: &ResourceMonitor,
) {
    let outcomes = &state.outcomes;
    let pool_stats = pool.stats();
    let resources = monitor.resource_stats();

    let max = match pool_stats.max_size {
        Some(n) => n.to_string(),
        None => "inf".to_string(),
    };
    info!(
        target: "drover::status",
        "{:.1}s | T:{}/{} | D:{}+{}/{} | M:{:.1}% | C:{:.1}% | ok:{} fail:{} invalid:{}",
        state.runtime().as_secs_f64(),
        outcomes.completed.get(),
        manager.tasks_added(),
        pool_stats.pool_size,
        pool_stats.in_use,
        max,
        resources.memory_percent,
        resources.cpu_percent,
        outcomes.successful.get(),
        outcomes.failed.get(),
        outcomes.invalid.get(),
    );
}
