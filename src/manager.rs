//! Task manager - worker fleet ownership and autoscaling
//!
//! The manager owns the task queue and the worker registry. A monitor loop
//! reaps dead workers (replacing them count-for-count when the pool can
//! still create drivers) and scales the fleet up while the queue is
//! non-empty. Shutdown drains the queue, poisons each worker, and joins
//! them under bounded timeouts.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::driver::Driver;
use crate::pool::DriverPool;
use crate::queue::{TaskEnvelope, TaskQueue};
use crate::runtime::Outcomes;
use crate::types::{DroverError, ExitReason, Result};
use crate::worker::{Worker, WorkerShared};

/// Dead workers younger than this are startup noise, not casualties.
const REAP_MIN_AGE: Duration = Duration::from_secs(2);

/// The per-envelope browser work, supplied by the caller.
///
/// The three-argument form is canonical: the envelope's `index` selects the
/// task inside the shared `batch`. Two-argument callbacks are adapted with
/// [`PerTaskProcessor`].
#[async_trait]
pub trait TaskProcessor<T>: Send + Sync {
    async fn process(
        &self,
        index: usize,
        driver: &mut (dyn Driver + '_),
        batch: &[T],
    ) -> Result<()>;
}

/// The `(task, driver)`-shaped callback some callers prefer.
#[async_trait]
pub trait PerTask<T>: Send + Sync {
    async fn run(&self, task: &T, driver: &mut (dyn Driver + '_)) -> Result<()>;
}

/// Adapts a [`PerTask`] callback to the canonical three-argument form by
/// selecting `batch[index]`.
pub struct PerTaskProcessor<P>(pub P);

#[async_trait]
impl<T, P> TaskProcessor<T> for PerTaskProcessor<P>
where
    T: Send + Sync,
    P: PerTask<T>,
{
    async fn process(
        &self,
        index: usize,
        driver: &mut (dyn Driver + '_),
        batch: &[T],
    ) -> Result<()> {
        let task = batch
            .get(index)
            .ok_or_else(|| DroverError::Task(format!("task index {index} out of range")))?;
        self.0.run(task, driver).await
    }
}

/// Per-cycle budget for pressure-driven driver destruction. Shared by the
/// manager and its workers; the cooldown resets the cycle, `step_down`
/// bounds destroys within it.
#[derive(Debug)]
pub struct ScaleDownBudget {
    step_down: usize,
    cooldown: Duration,
    state: Mutex<ScaleDownState>,
}

#[derive(Debug, Default)]
struct ScaleDownState {
    downs_this_cycle: usize,
    last_scale_down: Option<Instant>,
}

impl ScaleDownBudget {
    pub fn new(step_down: usize, cooldown: Duration) -> Self {
        Self {
            step_down,
            cooldown,
            state: Mutex::new(ScaleDownState::default()),
        }
    }

    /// Permit one destroy: the cycle counter resets once the cooldown has
    /// elapsed, and at most `step_down` destroys fit one cycle.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        let cooled = state
            .last_scale_down
            .map(|last| now.duration_since(last) >= self.cooldown)
            .unwrap_or(true);
        if cooled {
            state.downs_this_cycle = 0;
        }
        if state.downs_this_cycle >= self.step_down {
            return false;
        }
        state.downs_this_cycle += 1;
        state.last_scale_down = Some(now);
        true
    }

    /// Called by workers when pressure has lifted.
    pub fn reset_cycle(&self) {
        self.state.lock().unwrap().downs_this_cycle = 0;
    }
}

struct WorkerHandle {
    shared: Arc<WorkerShared>,
    handle: JoinHandle<()>,
    started_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub active_workers: usize,
    pub total_workers: usize,
    pub queue_size: usize,
    pub tasks_added: usize,
}

pub struct TaskManager<T> {
    pool: Arc<DriverPool>,
    queue: Arc<TaskQueue<T>>,
    processor: Arc<dyn TaskProcessor<T>>,
    outcomes: Arc<Outcomes>,
    scale_down: Arc<ScaleDownBudget>,

    max_workers: usize,
    step_up: usize,
    monitor_interval: Duration,
    spawn_pacing: Duration,
    stop_worker_timeout: Duration,

    workers: Mutex<Vec<WorkerHandle>>,
    worker_seq: AtomicUsize,
    tasks_added: AtomicUsize,
    stopping: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> TaskManager<T> {
    pub fn new(
        config: &Config,
        pool: Arc<DriverPool>,
        processor: Arc<dyn TaskProcessor<T>>,
        outcomes: Arc<Outcomes>,
        max_workers: usize,
    ) -> Self {
        let autoscaling = &config.resources.driver_autoscaling;
        Self {
            queue: Arc::new(TaskQueue::new()),
            scale_down: Arc::new(ScaleDownBudget::new(
                autoscaling.step_down,
                autoscaling.cooldown(),
            )),
            max_workers,
            step_up: autoscaling.step_up,
            monitor_interval: autoscaling.check_interval(),
            spawn_pacing: config.misc.timeouts.spawn_wait(),
            stop_worker_timeout: config.misc.timeouts.stop_worker(),
            pool,
            processor,
            outcomes,
            workers: Mutex::new(Vec::new()),
            worker_seq: AtomicUsize::new(0),
            tasks_added: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            monitor: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue<T>> {
        &self.queue
    }

    pub fn outcomes(&self) -> &Arc<Outcomes> {
        &self.outcomes
    }

    pub fn tasks_added(&self) -> usize {
        self.tasks_added.load(Ordering::SeqCst)
    }

    /// Enqueue one envelope per task of `batch`; workers process them by
    /// index against the shared batch.
    pub fn add_tasks(&self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        let batch = Arc::new(batch);
        for index in 0..count {
            self.queue.enqueue(TaskEnvelope::new(index, Arc::clone(&batch)));
        }
        self.tasks_added.fetch_add(count, Ordering::SeqCst);
    }

    pub fn add_task(&self, task: T) {
        self.add_tasks(vec![task]);
    }

    /// Block until every accepted envelope has been acknowledged.
    pub async fn wait_completion(&self) {
        self.queue.wait_completion().await;
    }

    /// Launch the initial workers and the monitor loop.
    pub fn start(self: &Arc<Self>, initial_workers: Option<usize>) {
        {
            let workers = self.workers.lock().unwrap();
            if !workers.is_empty() {
                warn!("task manager already started");
                return;
            }
        }

        let desired = initial_workers.unwrap_or(1).min(self.max_workers);
        info!(workers = desired, max = self.max_workers, "starting task manager");

        {
            let manager = Arc::clone(self);
            let handle = tokio::spawn(async move { manager.monitor_loop().await });
            *self.monitor.lock().unwrap() = Some(handle);
        }

        if desired == 0 {
            return;
        }
        if !self.pool.can_create_driver() {
            warn!(
                desired,
                "cannot create drivers right now, starting with zero workers"
            );
            return;
        }
        self.spawn_workers(desired);
    }

    fn spawn_workers(&self, count: usize) {
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..count {
            let seq = self.worker_seq.fetch_add(1, Ordering::SeqCst);
            let name = format!("Worker-{seq}");
            let worker = Worker::new(
                name.clone(),
                Arc::clone(&self.queue),
                Arc::clone(&self.pool),
                Arc::clone(&self.processor),
                Arc::clone(&self.outcomes),
                Arc::clone(&self.scale_down),
            );
            let shared = worker.shared();
            let handle = tokio::spawn(worker.run());
            workers.push(WorkerHandle {
                shared,
                handle,
                started_at: Instant::now(),
            });
            debug!(worker = %name, "worker spawned");
        }
    }

    pub fn workers_alive(&self) -> usize {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| !w.handle.is_finished())
            .count()
    }

    pub fn stats(&self) -> ManagerStats {
        let workers = self.workers.lock().unwrap();
        ManagerStats {
            active_workers: workers.iter().filter(|w| !w.handle.is_finished()).count(),
            total_workers: workers.len(),
            queue_size: self.queue.len(),
            tasks_added: self.tasks_added(),
        }
    }

    async fn monitor_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.monitor_interval).await;
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            self.reap_dead_workers();
            self.scale_up_if_needed().await;
        }
        debug!("manager monitor stopped");
    }

    /// Remove finished workers; replace the ones old enough to be real
    /// deaths, count-for-count, when the pool still admits drivers.
    fn reap_dead_workers(&self) {
        let mut dead = 0;
        {
            let mut workers = self.workers.lock().unwrap();
            workers.retain(|w| {
                if !w.handle.is_finished() {
                    return true;
                }
                let age = w.started_at.elapsed();
                // a finished task loop that never set a reason can only
                // have panicked out of it
                let reason = match w.shared.exit_reason() {
                    ExitReason::Normal => ExitReason::Crashed,
                    other => other,
                };
                if age > REAP_MIN_AGE {
                    if reason != ExitReason::Stopped {
                        warn!(
                            worker = %w.shared.name,
                            age_sec = age.as_secs_f64(),
                            exit_reason = %reason,
                            "dead worker, scheduling replacement"
                        );
                        dead += 1;
                    }
                } else {
                    debug!(
                        worker = %w.shared.name,
                        age_sec = age.as_secs_f64(),
                        "worker died during startup, not replacing"
                    );
                }
                false
            });
        }

        if dead > 0 {
            if !self.pool.can_create_driver() {
                warn!(dead, "cannot create drivers, skipping worker replacement");
                return;
            }
            info!(count = dead, "replacing dead workers");
            self.spawn_workers(dead);
        }
    }

    async fn scale_up_if_needed(&self) {
        let alive = self.workers_alive();
        if alive >= self.max_workers {
            return;
        }
        if self.queue.is_empty() || !self.pool.can_create_driver() {
            return;
        }

        let to_add = self.step_up.min(self.max_workers - alive);
        info!(
            current = alive,
            adding = to_add,
            drivers_in_use = self.pool.drivers_in_use(),
            "scaling workers up"
        );
        self.spawn_workers(to_add);
        tokio::time::sleep(self.spawn_pacing).await;
    }

    /// Drain, poison, and join. Worker joins that exceed their timeout are
    /// abandoned with a warning (the tasks are daemons).
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down task manager");

        self.queue.wait_completion().await;

        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock().unwrap();
            workers.drain(..).collect()
        };
        for _ in 0..handles.len() {
            self.queue.enqueue_poison();
        }

        for worker in handles {
            let name = worker.shared.name.clone();
            match tokio::time::timeout(self.stop_worker_timeout, worker.handle).await {
                Ok(Ok(())) => debug!(worker = %name, "worker exited cleanly"),
                Ok(Err(e)) if e.is_panic() => {
                    error!(worker = %name, "worker panicked during shutdown")
                }
                Ok(Err(_)) => debug!(worker = %name, "worker cancelled"),
                Err(_) => warn!(
                    worker = %name,
                    timeout_sec = self.stop_worker_timeout.as_secs_f64(),
                    "worker did not exit in time, abandoning"
                ),
            }
        }

        let monitor = self.monitor.lock().unwrap().take();
        if let Some(handle) = monitor {
            if tokio::time::timeout(self.stop_worker_timeout, handle)
                .await
                .is_err()
            {
                warn!("monitor loop did not exit in time");
            }
        }

        info!("task manager shut down");
    }
}
