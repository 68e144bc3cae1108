//! End-to-end runtime scenarios: steady state, retries, spawn budgeting,
//! pressure hysteresis, worker replacement, and graceful shutdown.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use drover::config::{Config, DriverLimit};
use drover::driver::testing::MockFactory;
use drover::driver::{Driver, DriverFactory, DriverOptions};
use drover::manager::{TaskManager, TaskProcessor};
use drover::monitor::sampler::testing::ScriptedSampler;
use drover::monitor::ResourceMonitor;
use drover::runtime::{setup_runtime_with_monitor, teardown_runtime, Outcomes};
use drover::types::{DroverError, Result};
use drover::DriverPool;

/// Poll `cond` until it holds or `timeout` expires.
async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn base_config(limit: usize) -> Config {
    let mut config = Config::default();
    config.system.driver_limit = DriverLimit::Fixed(limit);
    config.resources.driver_autoscaling.scaling_check_interval = 0.05;
    config.resources.memory_tuning.pressure.system_check_interval = 0.01;
    config.misc.timeouts.driver_recreate_delay = 0.01;
    config.misc.timeouts.spawn_wait_delay = 0.01;
    config.misc.timeouts.stop_worker_timeout = 5.0;
    config.misc.timeouts.shutdown = 10.0;
    config.misc.logging.status_interval = 3600.0;
    config
}

fn quiet_monitor(config: &Config) -> Arc<ResourceMonitor> {
    Arc::new(ResourceMonitor::with_sampler(
        config,
        Box::new(ScriptedSampler::new(vec![(20.0, 10.0)])),
    ))
}

struct NavigatingProcessor;

#[async_trait]
impl TaskProcessor<String> for NavigatingProcessor {
    async fn process(
        &self,
        index: usize,
        driver: &mut (dyn Driver + '_),
        batch: &[String],
    ) -> Result<()> {
        driver.navigate(&batch[index]).await?;
        Ok(())
    }
}

/// Steady state, no pressure: five trivial tasks on a two-driver pool.
#[tokio::test]
async fn steady_state_completes_all_tasks_within_pool_bounds() -> anyhow::Result<()> {
    drover::logging::init("warn");

    let config = Arc::new(base_config(2));
    let factory = Arc::new(MockFactory::default());
    let runtime = setup_runtime_with_monitor(
        Arc::clone(&config),
        Arc::clone(&factory) as Arc<dyn DriverFactory>,
        Arc::new(NavigatingProcessor),
        quiet_monitor(&config),
    )?;

    let pool = Arc::clone(&runtime.pool);
    let outcomes = Arc::clone(runtime.manager.outcomes());

    let urls: Vec<String> = (0..5).map(|i| format!("https://example.test/{i}")).collect();
    runtime.manager.add_tasks(urls);
    runtime.manager.wait_completion().await;

    assert_eq!(outcomes.successful.get(), 5);
    assert_eq!(outcomes.failed.get(), 0);
    assert!(factory.created() <= 2, "created {}", factory.created());

    teardown_runtime(runtime).await;
    assert_eq!(pool.drivers_in_use(), 0);
    assert_eq!(pool.pool_size(), 0);
    assert!(pool.stats().shutdown);
    // nothing leaked: every created driver was destroyed on close
    let stats = pool.stats();
    assert_eq!(stats.created, stats.destroyed);
    Ok(())
}

/// A processor that fails with a connection error a fixed number of times
/// before succeeding.
struct RetryProcessor {
    invocations: AtomicU32,
    failures: u32,
}

#[async_trait]
impl TaskProcessor<u32> for RetryProcessor {
    async fn process(
        &self,
        _index: usize,
        _driver: &mut (dyn Driver + '_),
        _batch: &[u32],
    ) -> Result<()> {
        let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            Err(DroverError::Driver("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

/// Task retry: two connection failures, then success. Three invocations,
/// two drivers destroyed along the way, one success.
#[tokio::test]
async fn transient_failures_destroy_driver_and_retry() {
    let config = Arc::new(base_config(2));
    let factory = Arc::new(MockFactory::default());
    let processor = Arc::new(RetryProcessor {
        invocations: AtomicU32::new(0),
        failures: 2,
    });
    let runtime = setup_runtime_with_monitor(
        Arc::clone(&config),
        factory as Arc<dyn DriverFactory>,
        Arc::clone(&processor) as Arc<dyn TaskProcessor<u32>>,
        quiet_monitor(&config),
    )
    .unwrap();

    let pool = Arc::clone(&runtime.pool);
    runtime.manager.add_task(7u32);
    runtime.manager.wait_completion().await;

    assert_eq!(processor.invocations.load(Ordering::SeqCst), 3);
    assert_eq!(runtime.manager.outcomes().successful.get(), 1);
    assert_eq!(runtime.manager.outcomes().failed.get(), 2);
    assert_eq!(pool.stats().destroyed, 2);

    teardown_runtime(runtime).await;
}

/// One connection failure per task index, then success on retry. Every
/// failure destroys the driver, so completing the batch needs more spawns
/// than one budget window allows.
struct FailOncePerIndex {
    seen: Mutex<Vec<bool>>,
}

#[async_trait]
impl TaskProcessor<u32> for FailOncePerIndex {
    async fn process(
        &self,
        index: usize,
        _driver: &mut (dyn Driver + '_),
        _batch: &[u32],
    ) -> Result<()> {
        let mut seen = self.seen.lock().unwrap();
        if !seen[index] {
            seen[index] = true;
            return Err(DroverError::Driver("connection error".into()));
        }
        Ok(())
    }
}

/// Spawn budget exhaustion: the batch needs ~6 driver creations against a
/// budget of 2 per window; later acquisitions stall until windows reset,
/// but every task still completes.
#[tokio::test(start_paused = true)]
async fn spawn_budget_throttles_but_work_completes() {
    let mut config = base_config(10);
    config.resources.driver_spawning.max_spawns_per_window = 2;
    config.resources.driver_spawning.spawn_window_sec = 60;
    let config = Arc::new(config);

    let factory = Arc::new(MockFactory::default());
    let processor = Arc::new(FailOncePerIndex {
        seen: Mutex::new(vec![false; 5]),
    });
    let runtime = setup_runtime_with_monitor(
        Arc::clone(&config),
        Arc::clone(&factory) as Arc<dyn DriverFactory>,
        processor as Arc<dyn TaskProcessor<u32>>,
        quiet_monitor(&config),
    )
    .unwrap();

    runtime.manager.add_tasks(vec![0u32, 1, 2, 3, 4]);
    runtime.manager.wait_completion().await;

    assert_eq!(runtime.manager.outcomes().successful.get(), 5);
    // one initial driver plus one replacement per failed task
    assert!(factory.created() >= 6, "created {}", factory.created());

    teardown_runtime(runtime).await;
}

/// Pressure hysteresis: sustained high samples flip the gate, the dwell
/// holds it through the first low samples, and recovery clears it.
#[tokio::test]
async fn pressure_gate_follows_samples_with_hysteresis() {
    let mut config = base_config(2);
    config.resources.driver_autoscaling.spawn_buffer = 0.4;
    config.resources.memory_tuning.pressure.history = 4;
    let config = Arc::new(config);

    let mut samples = vec![(95.0, 95.0); 12];
    samples.extend(vec![(25.0, 10.0); 200]);
    let monitor = Arc::new(ResourceMonitor::with_sampler(
        &config,
        Box::new(ScriptedSampler::new(samples)),
    ));

    let runtime = setup_runtime_with_monitor(
        Arc::clone(&config),
        Arc::new(MockFactory::default()) as Arc<dyn DriverFactory>,
        Arc::new(NavigatingProcessor) as Arc<dyn TaskProcessor<String>>,
        monitor,
    )
    .unwrap();
    let pool = Arc::clone(&runtime.pool);

    // the gate closes on the high samples
    assert!(
        wait_until(Duration::from_secs(2), || pool.is_high_load()).await,
        "high load never set"
    );
    assert!(!pool.can_create_driver());

    // and reopens once the averages recover and the dwell elapses
    assert!(
        wait_until(Duration::from_secs(5), || !pool.is_high_load()).await,
        "high load never cleared"
    );
    assert!(pool.can_create_driver());

    teardown_runtime(runtime).await;
}

/// Factory whose failures can be toggled at runtime.
struct GatedFactory {
    failing: AtomicBool,
    inner: MockFactory,
}

impl GatedFactory {
    fn new() -> Self {
        Self {
            failing: AtomicBool::new(false),
            inner: MockFactory::default(),
        }
    }
}

#[async_trait]
impl DriverFactory for GatedFactory {
    async fn create(&self, options: &DriverOptions) -> Result<Box<dyn Driver>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DroverError::Driver("driver service unreachable".into()));
        }
        self.inner.create(options).await
    }
}

struct CountingProcessor {
    invocations: AtomicU32,
}

#[async_trait]
impl TaskProcessor<u32> for CountingProcessor {
    async fn process(
        &self,
        _index: usize,
        _driver: &mut (dyn Driver + '_),
        _batch: &[u32],
    ) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Dead-worker replacement: with the factory down, every worker dies on
/// acquisition; once it recovers, the manager rebuilds the fleet and the
/// requeued tasks complete. The fleet never exceeds its ceiling.
#[tokio::test(start_paused = true)]
async fn dead_workers_are_replaced_and_fleet_recovers() {
    let mut config = base_config(3);
    config.resources.driver_spawning.max_spawns_per_window = 100;
    config.resources.driver_autoscaling.scaling_check_interval = 0.5;
    let config = Arc::new(config);

    let factory = Arc::new(GatedFactory::new());
    let processor = Arc::new(CountingProcessor {
        invocations: AtomicU32::new(0),
    });

    let pool = Arc::new(DriverPool::new(
        Arc::clone(&config),
        Arc::clone(&factory) as Arc<dyn DriverFactory>,
    )
    .unwrap());
    let manager = Arc::new(TaskManager::new(
        &config,
        Arc::clone(&pool),
        Arc::clone(&processor) as Arc<dyn TaskProcessor<u32>>,
        Arc::new(Outcomes::default()),
        3,
    ));
    manager.start(Some(3));
    assert_eq!(manager.workers_alive(), 3);

    factory.failing.store(true, Ordering::SeqCst);
    manager.add_tasks(vec![1u32, 2, 3]);

    // all three workers burn their creation retries and die
    assert!(
        wait_until(Duration::from_secs(120), || manager.workers_alive() == 0).await,
        "workers never died"
    );

    factory.failing.store(false, Ordering::SeqCst);

    // the monitor rebuilds the fleet and the requeued tasks complete
    manager.wait_completion().await;
    assert_eq!(processor.invocations.load(Ordering::SeqCst), 3);
    assert!(
        wait_until(Duration::from_secs(10), || manager.workers_alive() > 0).await,
        "fleet never recovered"
    );

    // no runaway spawning on subsequent ticks
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(manager.stats().total_workers <= 3);

    manager.shutdown().await;
    pool.close_all().await;
}

struct SlowProcessor;

#[async_trait]
impl TaskProcessor<u32> for SlowProcessor {
    async fn process(
        &self,
        _index: usize,
        _driver: &mut (dyn Driver + '_),
        _batch: &[u32],
    ) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(())
    }
}

/// Graceful shutdown under load: teardown waits for the queue to drain,
/// then closes the pool with nothing leaked.
#[tokio::test]
async fn graceful_shutdown_drains_queue_and_destroys_drivers() {
    let config = Arc::new(base_config(3));
    let factory = Arc::new(MockFactory::default());
    let runtime = setup_runtime_with_monitor(
        Arc::clone(&config),
        factory as Arc<dyn DriverFactory>,
        Arc::new(SlowProcessor) as Arc<dyn TaskProcessor<u32>>,
        quiet_monitor(&config),
    )
    .unwrap();

    let pool = Arc::clone(&runtime.pool);
    let outcomes = Arc::clone(runtime.manager.outcomes());
    let manager = Arc::clone(&runtime.manager);

    manager.add_tasks((0..50).collect());
    tokio::time::sleep(Duration::from_millis(100)).await;
    teardown_runtime(runtime).await;

    assert_eq!(outcomes.completed.get(), 50);
    assert_eq!(outcomes.successful.get(), 50);
    assert_eq!(manager.workers_alive(), 0);

    let stats = pool.stats();
    assert!(stats.shutdown);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.pool_size, 0);
    assert_eq!(stats.created, stats.destroyed);
}
