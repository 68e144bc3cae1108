//! Driver pool - lifecycle owner for browser drivers
//!
//! Drivers are created with retries through the injected factory, parked in
//! a bounded idle queue between tasks, and destroyed on failure, on idle
//! retirement, or under sustained pressure. Admission is double-gated by
//! the spawn budget (rolling window) and the monitor's high-load verdict.

mod pressure;
pub mod process;

pub use pressure::{acquire_with_pressure_check, wait_high_load};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::budget::{PoolAdmission, SpawnBudget};
use crate::config::Config;
use crate::driver::{Driver, DriverFactory, DriverOptions, ProxyEndpoint};
use crate::monitor::PressureSink;
use crate::sync::Counter;
use crate::types::{DroverError, Result};

/// Idle-queue pop timeout when the caller does not supply one.
const DEFAULT_GET_TIMEOUT: Duration = Duration::from_millis(100);

/// How long an at-capacity caller blocks waiting for a returned driver.
const POOL_BLOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Creation attempts per `get_driver` miss.
const CREATE_ATTEMPTS: u32 = 3;

/// Base backoff between creation attempts, doubled per attempt.
const CREATE_BACKOFF: Duration = Duration::from_secs(1);

/// Idle-queue bound when the pool itself is unbounded.
const UNBOUNDED_IDLE_CAP: usize = 1000;

/// Consecutive high-load checks required before voluntary driver destruction.
const PRESSURE_CLOSE_THRESHOLD: u32 = 2;

/// A checked-out driver together with its pool identity.
pub struct PooledDriver {
    id: Uuid,
    driver: Box<dyn Driver>,
}

impl PooledDriver {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn as_driver(&mut self) -> &mut (dyn Driver + '_) {
        self.driver.as_mut()
    }
}

/// Bookkeeping for one live driver. `last_access: None` means parked in
/// the idle queue; `Some` means checked out.
#[derive(Debug)]
struct DriverRecord {
    pids: Vec<u32>,
    last_access: Option<Instant>,
    spawned_at: Instant,
    failures: u32,
}

#[derive(Debug, Default)]
struct PressureState {
    high_load: bool,
    near_threshold: bool,
    consecutive_high: u32,
    last_scale_down: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub created: i64,
    pub destroyed: i64,
    pub in_use: i64,
    pub errors: i64,
    pub termination_failures: i64,
    pub max_size: Option<usize>,
    pub high_load: bool,
    pub shutdown: bool,
    pub budget_remaining: u32,
    pub can_create_driver: bool,
}

pub struct DriverPool {
    factory: Arc<dyn DriverFactory>,
    config: Arc<Config>,
    max_size: Option<usize>,
    idle_capacity: usize,

    idle: Mutex<VecDeque<PooledDriver>>,
    idle_available: Notify,
    records: DashMap<Uuid, DriverRecord>,

    created: Counter,
    destroyed: Counter,
    in_use: Counter,
    errors: Counter,
    termination_failures: Counter,

    budget: SpawnBudget,
    pressure: Mutex<PressureState>,
    unblock: Notify,

    proxies: Vec<String>,
    proxy_index: AtomicUsize,
    shutdown: AtomicBool,
}

impl DriverPool {
    /// Fails fast when proxies are enabled against a factory that cannot
    /// route them. An enabled-but-empty proxy list disables rotation for
    /// the session with a warning.
    pub fn new(config: Arc<Config>, factory: Arc<dyn DriverFactory>) -> Result<Self> {
        let (max_size, _) = config.worker_limits();

        let proxies = if config.proxy.enabled {
            if !factory.supports_proxy() {
                return Err(DroverError::ProxyConfig(
                    "proxies enabled but the driver factory has no proxy support".into(),
                ));
            }
            if config.proxy.list.is_empty() {
                warn!("proxies enabled but the proxy list is empty; continuing without proxies");
            }
            config.proxy.list.clone()
        } else {
            Vec::new()
        };

        let spawning = &config.resources.driver_spawning;
        let budget = SpawnBudget::new(spawning.max_spawns_per_window, spawning.window());

        info!(
            max_size = ?max_size,
            proxies = proxies.len(),
            "driver pool ready"
        );

        Ok(Self {
            idle_capacity: max_size.unwrap_or(UNBOUNDED_IDLE_CAP),
            max_size,
            factory,
            config,
            idle: Mutex::new(VecDeque::new()),
            idle_available: Notify::new(),
            records: DashMap::new(),
            created: Counter::default(),
            destroyed: Counter::default(),
            in_use: Counter::default(),
            errors: Counter::default(),
            termination_failures: Counter::default(),
            budget,
            pressure: Mutex::new(PressureState::default()),
            unblock: Notify::new(),
            proxies,
            proxy_index: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Drivers currently alive (created minus destroyed).
    pub fn live_drivers(&self) -> usize {
        (self.created.get() - self.destroyed.get()).max(0) as usize
    }

    pub fn drivers_in_use(&self) -> usize {
        self.in_use.get().max(0) as usize
    }

    /// Idle drivers parked in the queue.
    pub fn pool_size(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    fn admission(&self) -> PoolAdmission {
        PoolAdmission {
            drivers_in_use: self.drivers_in_use(),
            max_size: self.max_size,
            high_load: self.is_high_load(),
        }
    }

    /// A ready driver, or `None`.
    ///
    /// Reuses an idle driver when one arrives within `timeout` (default
    /// 100 ms). Otherwise creates a new one when capacity, the spawn
    /// budget, and (unless `skip_high_load_wait`) the load gate allow it.
    /// Otherwise blocks on the idle queue up to 30 s.
    pub async fn get_driver(
        &self,
        timeout: Option<Duration>,
        skip_high_load_wait: bool,
    ) -> Option<PooledDriver> {
        if self.is_shutdown() {
            return None;
        }

        let timeout = timeout.unwrap_or(DEFAULT_GET_TIMEOUT);
        if let Some(driver) = self.pop_idle(timeout).await {
            return Some(self.checkout(driver));
        }

        let has_capacity = self
            .max_size
            .map(|max| self.live_drivers() < max)
            .unwrap_or(true);

        let driver = if has_capacity
            && (skip_high_load_wait || !self.is_high_load())
            && self.budget.try_reserve(&self.admission())
        {
            self.create_with_retries().await
        } else {
            self.pop_idle(POOL_BLOCK_TIMEOUT).await
        };

        let driver = driver.map(|d| self.checkout(d));
        if let Some(d) = &driver {
            debug!(
                driver_id = %d.id,
                pool_size = self.pool_size(),
                created = self.created.get(),
                in_use = self.in_use.get(),
                "driver checked out"
            );
        }
        driver
    }

    fn checkout(&self, driver: PooledDriver) -> PooledDriver {
        if let Some(mut record) = self.records.get_mut(&driver.id) {
            record.last_access = Some(Instant::now());
        }
        self.in_use.incr();
        driver
    }

    async fn pop_idle(&self, timeout: Duration) -> Option<PooledDriver> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle_available.notified();
            if let Some(driver) = self.idle.lock().unwrap().pop_front() {
                return Some(driver);
            }
            if self.is_shutdown() {
                return None;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return self.idle.lock().unwrap().pop_front();
            }
        }
    }

    async fn create_with_retries(&self) -> Option<PooledDriver> {
        for attempt in 0..CREATE_ATTEMPTS {
            match self.create_one().await {
                Ok(driver) => return Some(driver),
                Err(e) => {
                    self.errors.incr();
                    warn!(
                        attempt = attempt + 1,
                        max = CREATE_ATTEMPTS,
                        error = %e,
                        "driver creation failed"
                    );
                }
            }
            if attempt + 1 < CREATE_ATTEMPTS {
                tokio::time::sleep(CREATE_BACKOFF * 2u32.pow(attempt)).await;
            }
        }
        error!(attempts = CREATE_ATTEMPTS, "driver creation exhausted retries");
        None
    }

    async fn create_one(&self) -> Result<PooledDriver> {
        let mut options = DriverOptions::from_config(&self.config);
        options.proxy = self.next_proxy()?;

        let driver = self.factory.create(&options).await?;
        let id = Uuid::new_v4();
        let now = Instant::now();
        self.records.insert(
            id,
            DriverRecord {
                pids: driver.pids(),
                last_access: Some(now),
                spawned_at: now,
                failures: 0,
            },
        );
        self.created.incr();
        Ok(PooledDriver { id, driver })
    }

    /// Round-robin over the configured proxy list.
    fn next_proxy(&self) -> Result<Option<ProxyEndpoint>> {
        if self.proxies.is_empty() {
            return Ok(None);
        }
        let idx = self.proxy_index.fetch_add(1, Ordering::Relaxed) % self.proxies.len();
        ProxyEndpoint::from_entry(&self.proxies[idx], &self.config.proxy).map(Some)
    }

    /// Park a driver back in the idle queue; destroy it when the queue is
    /// full or the pool is shutting down.
    pub async fn return_driver(&self, driver: PooledDriver) {
        if let Some(mut record) = self.records.get_mut(&driver.id) {
            record.last_access = None;
        }
        self.in_use.decr();

        if self.is_shutdown() {
            self.destroy(driver).await;
            return;
        }

        let overflow = {
            let mut idle = self.idle.lock().unwrap();
            if idle.len() >= self.idle_capacity {
                Some(driver)
            } else {
                idle.push_back(driver);
                None
            }
        };

        match overflow {
            Some(driver) => {
                debug!("idle queue full, destroying returned driver");
                self.destroy(driver).await;
            }
            None => self.idle_available.notify_one(),
        }
    }

    /// Record a task-level failure against a driver.
    pub fn mark_failed(&self, id: Uuid) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.failures += 1;
        }
        self.errors.incr();
    }

    pub fn has_recent_failures(&self) -> bool {
        self.records.iter().any(|r| r.failures > 0)
    }

    /// Remove the record, quit the driver, and bring its processes down.
    /// Never propagates: termination problems bump `termination_failures`.
    pub async fn destroy(&self, mut driver: PooledDriver) {
        let (pids, was_checked_out) = match self.records.remove(&driver.id) {
            Some((_, record)) => (record.pids, record.last_access.is_some()),
            None => (driver.driver.pids(), false),
        };

        if let Err(e) = driver.driver.quit().await {
            self.termination_failures.incr();
            debug!(driver_id = %driver.id, error = %e, "driver quit failed");
        }

        let kill_failures = process::terminate_pids(&pids).await;
        if kill_failures > 0 {
            self.termination_failures.add(kill_failures as i64);
        }

        self.destroyed.incr();
        if was_checked_out {
            self.in_use.decr();
        }

        debug!(
            driver_id = %driver.id,
            pool_size = self.pool_size(),
            in_use = self.in_use.get(),
            "driver destroyed"
        );
    }

    /// Retire parked drivers older than `max_idle`.
    pub async fn cleanup_idle(&self, max_idle: Duration) {
        if self.is_shutdown() {
            return;
        }

        let expired: Vec<PooledDriver> = {
            let mut idle = self.idle.lock().unwrap();
            let mut keep = VecDeque::with_capacity(idle.len());
            let mut out = Vec::new();
            while let Some(driver) = idle.pop_front() {
                let retire = self
                    .records
                    .get(&driver.id)
                    .map(|r| r.last_access.is_none() && r.spawned_at.elapsed() > max_idle)
                    .unwrap_or(true);
                if retire {
                    out.push(driver);
                } else {
                    keep.push_back(driver);
                }
            }
            *idle = keep;
            out
        };

        if expired.is_empty() {
            return;
        }
        info!(count = expired.len(), "retiring idle drivers");
        for driver in expired {
            self.destroy(driver).await;
        }
    }

    /// Destroy everything this pool knows about, then sweep residual
    /// same-user processes matching the browser/driver executable names.
    /// Idempotent: only the first call does work.
    pub async fn close_all(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing driver pool");

        // anyone parked in a pressure wait should observe shutdown
        self.unblock.notify_waiters();
        self.idle_available.notify_waiters();

        loop {
            let driver = self.idle.lock().unwrap().pop_front();
            match driver {
                Some(driver) => self.destroy(driver).await,
                None => break,
            }
        }

        // remaining records belong to checked-out drivers; without the
        // handle we can only bring the processes down and drop the record
        let leftover: Vec<Uuid> = self.records.iter().map(|r| *r.key()).collect();
        for id in leftover {
            if let Some((_, record)) = self.records.remove(&id) {
                let kill_failures = process::terminate_pids(&record.pids).await;
                if kill_failures > 0 {
                    self.termination_failures.add(kill_failures as i64);
                }
                self.destroyed.incr();
                if record.last_access.is_some() {
                    self.in_use.decr();
                }
            }
        }

        let mut names = self.factory.process_names();
        names.extend(self.config.system.browser_process_names.iter().cloned());
        names.dedup();
        process::sweep_residual(&names).await;

        info!(stats = ?self.stats(), "driver pool closed");
    }

    /// Gate consulted by the manager before spawning workers.
    pub fn can_create_driver(&self) -> bool {
        !self.is_shutdown() && !self.is_high_load() && self.budget.can_allow()
    }

    // --- pressure surface ---

    pub fn is_high_load(&self) -> bool {
        self.pressure.lock().unwrap().high_load
    }

    pub fn is_near_threshold(&self) -> bool {
        self.pressure.lock().unwrap().near_threshold
    }

    /// Wait until the load gate clears, up to `timeout`. Returns `true`
    /// when unblocked (or the pool is shutting down).
    pub async fn wait_for_unblock(&self, timeout: Duration) -> bool {
        let notified = self.unblock.notified();
        if !self.is_high_load() || self.is_shutdown() {
            return true;
        }
        match tokio::time::timeout(timeout, notified).await {
            Ok(_) => true,
            Err(_) => !self.is_high_load(),
        }
    }

    /// Whether a worker may voluntarily destroy its driver: no recent
    /// failures, the pool-level cooldown has elapsed, and the monitor has
    /// reported high load on at least two consecutive checks.
    pub fn should_close_for_pressure(&self, cooldown: Option<Duration>) -> bool {
        let cooldown =
            cooldown.unwrap_or_else(|| self.config.resources.driver_autoscaling.cooldown());

        if self.has_recent_failures() {
            return false;
        }

        let state = self.pressure.lock().unwrap();
        if let Some(last) = state.last_scale_down {
            if last.elapsed() < cooldown {
                return false;
            }
        }
        state.consecutive_high >= PRESSURE_CLOSE_THRESHOLD
    }

    /// Stamp the pool-level pressure scale-down cooldown.
    pub fn mark_closed_for_pressure(&self) {
        self.pressure.lock().unwrap().last_scale_down = Some(Instant::now());
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_size: self.pool_size(),
            created: self.created.get(),
            destroyed: self.destroyed.get(),
            in_use: self.in_use.get(),
            errors: self.errors.get(),
            termination_failures: self.termination_failures.get(),
            max_size: self.max_size,
            high_load: self.is_high_load(),
            shutdown: self.is_shutdown(),
            budget_remaining: self.budget.remaining(),
            can_create_driver: self.can_create_driver(),
        }
    }
}

impl std::fmt::Debug for DriverPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverPool")
            .field("max_size", &self.max_size)
            .field("created", &self.created.get())
            .field("in_use", &self.in_use.get())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl PressureSink for DriverPool {
    fn set_high_load(&self, high: bool) {
        let mut state = self.pressure.lock().unwrap();
        if state.high_load == high {
            return;
        }
        state.high_load = high;
        drop(state);
        if high {
            info!("driver spawning blocked: high system load");
        } else {
            info!("driver spawning unblocked");
            self.unblock.notify_waiters();
        }
    }

    fn note_pressure_check(&self, high: bool) {
        let mut state = self.pressure.lock().unwrap();
        if high {
            state.consecutive_high += 1;
        } else {
            state.consecutive_high = 0;
        }
    }

    fn set_near_threshold(&self, near: bool) {
        self.pressure.lock().unwrap().near_threshold = near;
    }
}
