//! Worker - one task loop holding at most one driver
//!
//! Workers dequeue envelopes with a short timeout, borrow a driver from the
//! pool (waiting out system pressure first), run the user's processor, and
//! acknowledge every envelope exactly once. Failures destroy the held
//! driver so the next task starts from a fresh browser, and requeue the
//! envelope while its retry budget lasts.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::manager::{ScaleDownBudget, TaskProcessor};
use crate::pool::{acquire_with_pressure_check, DriverPool, PooledDriver};
use crate::queue::TaskQueue;
use crate::runtime::Outcomes;
use crate::sync::Counter;
use crate::types::{is_connection_error, DroverError, ExitReason};

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}

/// Dequeue patience before checking for work again.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Idle pause when the queue comes back empty.
const EMPTY_BACKOFF: Duration = Duration::from_secs(1);

/// Consecutive failures within the window before the breaker adds delay.
const BREAKER_THRESHOLD: u32 = 3;

/// Window inside which failures count as consecutive.
const BREAKER_WINDOW: Duration = Duration::from_secs(30);

/// Ceiling for the breaker's exponential delay.
const BREAKER_MAX_DELAY: Duration = Duration::from_secs(30);

/// Worker state observable by the manager while the task loop runs.
#[derive(Debug)]
pub struct WorkerShared {
    pub name: String,
    pub tasks_processed: Counter,
    pub successful_tasks: Counter,
    pub failed_tasks: Counter,
    current_task: Mutex<Option<usize>>,
    exit_reason: Mutex<ExitReason>,
}

impl WorkerShared {
    pub fn new(name: String) -> Self {
        Self {
            name,
            tasks_processed: Counter::default(),
            successful_tasks: Counter::default(),
            failed_tasks: Counter::default(),
            current_task: Mutex::new(None),
            exit_reason: Mutex::new(ExitReason::Normal),
        }
    }

    pub fn current_task(&self) -> Option<usize> {
        *self.current_task.lock().unwrap()
    }

    pub fn exit_reason(&self) -> ExitReason {
        *self.exit_reason.lock().unwrap()
    }

    fn set_current_task(&self, index: Option<usize>) {
        *self.current_task.lock().unwrap() = index;
    }

    fn set_exit_reason(&self, reason: ExitReason) {
        *self.exit_reason.lock().unwrap() = reason;
    }
}

/// Consecutive-failure backoff: once `BREAKER_THRESHOLD` failures land
/// inside the window, each further failure sleeps `2^(n - threshold)`
/// seconds, capped.
#[derive(Debug, Default)]
struct FailureBreaker {
    failures: u32,
    last_failure: Option<Instant>,
}

impl FailureBreaker {
    fn record_failure(&mut self) -> Option<Duration> {
        let now = Instant::now();
        match self.last_failure {
            Some(last) if now.duration_since(last) < BREAKER_WINDOW => self.failures += 1,
            _ => self.failures = 1,
        }
        self.last_failure = Some(now);

        if self.failures >= BREAKER_THRESHOLD {
            let exp = self.failures - BREAKER_THRESHOLD;
            let delay = Duration::from_secs(2u64.saturating_pow(exp).min(u64::MAX));
            Some(delay.min(BREAKER_MAX_DELAY))
        } else {
            None
        }
    }
}

pub struct Worker<T> {
    name: String,
    queue: Arc<TaskQueue<T>>,
    pool: Arc<DriverPool>,
    processor: Arc<dyn TaskProcessor<T>>,
    outcomes: Arc<Outcomes>,
    scale_down: Arc<ScaleDownBudget>,
    shared: Arc<WorkerShared>,
    driver: Option<PooledDriver>,
    max_retries: u32,
    recreate_delay: Duration,
    breaker: FailureBreaker,
}

impl<T: Send + Sync + 'static> Worker<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        queue: Arc<TaskQueue<T>>,
        pool: Arc<DriverPool>,
        processor: Arc<dyn TaskProcessor<T>>,
        outcomes: Arc<Outcomes>,
        scale_down: Arc<ScaleDownBudget>,
    ) -> Self {
        let timeouts = &pool.config().misc.timeouts;
        let max_retries = timeouts.max_worker_task_retries;
        let recreate_delay = timeouts.recreate_delay();
        Self {
            shared: Arc::new(WorkerShared::new(name.clone())),
            name,
            queue,
            pool,
            processor,
            outcomes,
            scale_down,
            driver: None,
            max_retries,
            recreate_delay,
            breaker: FailureBreaker::default(),
        }
    }

    pub fn shared(&self) -> Arc<WorkerShared> {
        Arc::clone(&self.shared)
    }

    /// The task loop. Runs until poison, acquisition failure, or panic.
    pub async fn run(mut self) {
        let started = Instant::now();
        debug!(worker = %self.name, "worker started");

        loop {
            let item = match self.queue.dequeue(DEQUEUE_TIMEOUT).await {
                None => {
                    tokio::time::sleep(EMPTY_BACKOFF).await;
                    continue;
                }
                Some(item) => item,
            };

            let Some(mut envelope) = item else {
                info!(worker = %self.name, "stop received");
                self.queue.mark_done();
                self.shared.set_exit_reason(ExitReason::Stopped);
                break;
            };

            self.shared.set_current_task(Some(envelope.index));
            self.shared.tasks_processed.incr();

            if self.driver.is_none() {
                match acquire_with_pressure_check(&self.pool, &self.name).await {
                    Some(driver) => self.driver = Some(driver),
                    None => {
                        error!(worker = %self.name, "driver acquisition failed, exiting");
                        // hand the task back before dying so it is not lost
                        self.queue.enqueue(envelope);
                        self.queue.mark_done();
                        self.shared.set_current_task(None);
                        self.shared.set_exit_reason(ExitReason::DriverAcquisitionFailed);
                        return;
                    }
                }
            }

            let driver = self.driver.as_mut().expect("worker holds a driver");
            // a panicking processor is treated like any other task failure:
            // the driver is replaced and the envelope retried
            let result = match AssertUnwindSafe(self.processor.process(
                envelope.index,
                driver.as_driver(),
                &envelope.batch,
            ))
            .catch_unwind()
            .await
            {
                Ok(result) => result,
                Err(panic) => Err(DroverError::Task(panic_message(&panic))),
            };

            match result {
                Ok(()) => {
                    self.shared.successful_tasks.incr();
                    self.outcomes.successful.incr();
                    self.outcomes.completed.incr();
                }
                Err(e) => {
                    self.shared.failed_tasks.incr();
                    self.outcomes.failed.incr();
                    self.handle_task_failure(envelope.index, &e).await;

                    if envelope.retry_count < self.max_retries {
                        envelope.retry_count += 1;
                        self.queue.enqueue(envelope);
                    } else {
                        warn!(
                            worker = %self.name,
                            index = envelope.index,
                            retries = envelope.retry_count,
                            "task dropped after exhausting retries"
                        );
                        self.outcomes.completed.incr();
                    }
                }
            }

            self.queue.mark_done();
            self.shared.set_current_task(None);

            self.maybe_close_for_pressure().await;
        }

        self.release_driver().await;
        info!(
            worker = %self.name,
            runtime_sec = started.elapsed().as_secs_f64(),
            tasks = self.shared.tasks_processed.get(),
            ok = self.shared.successful_tasks.get(),
            failed = self.shared.failed_tasks.get(),
            "worker exiting"
        );
    }

    /// Classify, destroy the held driver, and pace the retry.
    async fn handle_task_failure(&mut self, index: usize, error: &crate::types::DroverError) {
        let message = error.to_string();
        if is_connection_error(&message) {
            warn!(worker = %self.name, index, error = %message, "driver connection error");
        } else {
            error!(
                worker = %self.name,
                index,
                error = %message,
                "task error, replacing driver"
            );
        }

        if let Some(driver) = self.driver.take() {
            self.pool.mark_failed(driver.id());
            self.pool.destroy(driver).await;
        }

        tokio::time::sleep(self.recreate_delay).await;

        if let Some(extra) = self.breaker.record_failure() {
            warn!(
                worker = %self.name,
                delay_sec = extra.as_secs_f64(),
                "failure breaker open"
            );
            tokio::time::sleep(extra).await;
        }
    }

    /// Voluntarily give up the driver under sustained pressure, bounded by
    /// the manager's per-cycle budget.
    async fn maybe_close_for_pressure(&mut self) {
        if self.driver.is_none() {
            return;
        }
        if !self.pool.should_close_for_pressure(None) {
            self.scale_down.reset_cycle();
            return;
        }
        if self.scale_down.allow() {
            self.pool.mark_closed_for_pressure();
            info!(worker = %self.name, "destroying driver under pressure");
            if let Some(driver) = self.driver.take() {
                self.pool.destroy(driver).await;
            }
        }
    }

    async fn release_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            self.pool.return_driver(driver).await;
        }
    }
}
