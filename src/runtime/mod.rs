//! Runtime lifecycle - wiring and orderly teardown
//!
//! `setup_runtime` builds the pool, monitor, and manager, then starts the
//! background loops: pressure monitoring, idle sweeping, and status
//! reporting. `teardown_runtime` drains the manager, closes the pool, and
//! bounds every join; loops that overrun are aborted with a warning.

mod status;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::driver::DriverFactory;
use crate::manager::{TaskManager, TaskProcessor};
use crate::monitor::{run_pressure_loop, PressureSink, ResourceMonitor};
use crate::pool::DriverPool;
use crate::sync::Counter;
use crate::types::Result;

/// Join patience for background loops during teardown.
const LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Task outcome totals, bumped by workers (and by user processors for
/// `invalid`).
#[derive(Debug, Default)]
pub struct Outcomes {
    pub completed: Counter,
    pub successful: Counter,
    pub failed: Counter,
    pub invalid: Counter,
}

/// Shared run bookkeeping for status reporting.
#[derive(Debug)]
pub struct RuntimeState {
    pub started_at: Instant,
    pub outcomes: Arc<Outcomes>,
}

impl RuntimeState {
    fn new(outcomes: Arc<Outcomes>) -> Self {
        Self {
            started_at: Instant::now(),
            outcomes,
        }
    }

    pub fn runtime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// A running harness: manager, pool, monitor, and the background loops.
pub struct Runtime<T> {
    pub manager: Arc<TaskManager<T>>,
    pub pool: Arc<DriverPool>,
    pub monitor: Arc<ResourceMonitor>,
    pub state: Arc<RuntimeState>,
    config: Arc<Config>,
    stop: watch::Sender<bool>,
    background: Vec<JoinHandle<()>>,
}

/// Build and start the runtime with the platform resource sampler.
pub fn setup_runtime<T: Send + Sync + 'static>(
    config: Arc<Config>,
    factory: Arc<dyn DriverFactory>,
    processor: Arc<dyn TaskProcessor<T>>,
) -> Result<Runtime<T>> {
    let monitor = Arc::new(ResourceMonitor::new(&config));
    setup_runtime_with_monitor(config, factory, processor, monitor)
}

/// Build and start the runtime with an injected monitor (scripted samplers
/// in tests).
pub fn setup_runtime_with_monitor<T: Send + Sync + 'static>(
    config: Arc<Config>,
    factory: Arc<dyn DriverFactory>,
    processor: Arc<dyn TaskProcessor<T>>,
    monitor: Arc<ResourceMonitor>,
) -> Result<Runtime<T>> {
    config.validate()?;
    let (pool_max, max_workers) = config.worker_limits();
    info!(?pool_max, max_workers, "setting up runtime");

    let pool = Arc::new(DriverPool::new(Arc::clone(&config), factory)?);
    let outcomes = Arc::new(Outcomes::default());
    let state = Arc::new(RuntimeState::new(Arc::clone(&outcomes)));

    let manager = Arc::new(TaskManager::new(
        &config,
        Arc::clone(&pool),
        processor,
        outcomes,
        max_workers,
    ));
    manager.start(None);

    let (stop, _) = watch::channel(false);
    let mut background = Vec::new();

    background.push(tokio::spawn(run_pressure_loop(
        Arc::clone(&monitor),
        Arc::clone(&pool) as Arc<dyn PressureSink>,
        config.resources.driver_autoscaling.check_interval(),
        stop.subscribe(),
    )));

    background.push(tokio::spawn(run_idle_sweep(
        Arc::clone(&pool),
        config.misc.timeouts.idle_cycle(),
        config.misc.timeouts.max_driver_idle(),
        stop.subscribe(),
    )));

    if config.misc.logging.status_console {
        background.push(tokio::spawn(status::run_status_loop(
            Arc::clone(&state),
            Arc::clone(&manager),
            Arc::clone(&pool),
            Arc::clone(&monitor),
            Duration::from_secs_f64(config.misc.logging.status_interval),
            stop.subscribe(),
        )));
    }

    Ok(Runtime {
        manager,
        pool,
        monitor,
        state,
        config,
        stop,
        background,
    })
}

/// Periodically retire drivers that have sat in the pool too long.
async fn run_idle_sweep(
    pool: Arc<DriverPool>,
    interval: Duration,
    max_idle: Duration,
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
        pool.cleanup_idle(max_idle).await;
    }
    debug!("idle sweep stopped");
}

/// Stop the background loops, drain the manager, and close the pool.
///
/// The manager and pool are shut down in parallel tasks under the shared
/// `misc.timeouts.shutdown` budget; the pool waits for the manager's drain
/// (so in-flight tasks keep their drivers) but closes unconditionally once
/// the budget expires.
pub async fn teardown_runtime<T: Send + Sync + 'static>(runtime: Runtime<T>) {
    let Runtime {
        manager,
        pool,
        monitor,
        state,
        config,
        stop,
        background,
    } = runtime;

    let shutdown_timeout = config.misc.timeouts.shutdown_timeout();
    info!(
        timeout_sec = shutdown_timeout.as_secs_f64(),
        "starting runtime teardown"
    );

    let _ = stop.send(true);

    let (drained_tx, drained_rx) = oneshot::channel::<()>();
    let manager_task = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager.shutdown().await;
            let _ = drained_tx.send(());
        })
    };
    let pool_task = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if tokio::time::timeout(shutdown_timeout, drained_rx)
                .await
                .is_err()
            {
                warn!("manager drain exceeded shutdown budget, closing pool anyway");
            }
            pool.close_all().await;
        })
    };

    for mut handle in background {
        if tokio::time::timeout(LOOP_JOIN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            warn!("background loop did not stop in time, aborting it");
            handle.abort();
        }
    }

    monitor.cleanup();

    for (name, task) in [("task manager", manager_task), ("driver pool", pool_task)] {
        match tokio::time::timeout(shutdown_timeout, task).await {
            Ok(_) => debug!(component = name, "shutdown complete"),
            Err(_) => warn!(component = name, "shutdown exceeded budget, abandoning"),
        }
    }

    info!(
        runtime_sec = state.runtime().as_secs_f64(),
        completed = state.outcomes.completed.get(),
        successful = state.outcomes.successful.get(),
        failed = state.outcomes.failed.get(),
        invalid = state.outcomes.invalid.get(),
        "runtime teardown completed"
    );
}
