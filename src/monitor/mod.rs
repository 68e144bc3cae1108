//! Resource-pressure monitor
//!
//! Samples system memory and CPU, keeps a bounded history plus a decayed
//! load histogram, and decides whether the runtime should stop creating new
//! drivers. The verdict is pushed into a [`PressureSink`] (the driver pool)
//! and flips only after a hysteresis dwell, so the gate cannot flap.

pub mod buffer;
pub mod sampler;

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::Config;
use crate::sync::{DecayingHistogram, RingBuffer};
use crate::types::ResourceSample;
use buffer::DynamicBuffer;
use sampler::{platform_sampler, CpuTimes, ResourceSampler};

/// Fraction of decayed histogram weight at/above a base threshold that
/// counts as sustained-load evidence.
const TREND_RATIO: f64 = 0.5;

/// Consumer of load verdicts. Implemented by the driver pool.
pub trait PressureSink: Send + Sync {
    /// New verdict after a transition (also reasserted every check).
    fn set_high_load(&self, high: bool);
    /// Called once per check with the standing verdict, for
    /// consecutive-high accounting.
    fn note_pressure_check(&self, high: bool);
    /// Averages have drifted within `safe_margin` of a base threshold.
    fn set_near_threshold(&self, near: bool);
}

struct MonitorState {
    sampler: Box<dyn ResourceSampler>,
    prev_cpu: Option<CpuTimes>,
    last_check: Option<Instant>,
    last: ResourceSample,
    avg: ResourceSample,
    memory_history: RingBuffer,
    cpu_history: RingBuffer,
    memory_hist: DecayingHistogram,
    cpu_hist: DecayingHistogram,
    dynamic: DynamicBuffer,
    high_load: bool,
    last_transition: Option<Instant>,
}

pub struct ResourceMonitor {
    check_interval: Duration,
    base_mem_threshold: f64,
    base_cpu_threshold: f64,
    safe_margin: f64,
    base_down_margin: f64,
    base_up_margin: f64,
    hysteresis: Duration,
    state: Mutex<MonitorState>,
}

impl ResourceMonitor {
    /// Monitor with the platform sampler.
    pub fn new(config: &Config) -> Self {
        Self::with_sampler(config, platform_sampler())
    }

    /// Monitor with an injected sampler (tests, fault injection).
    pub fn with_sampler(config: &Config, sampler: Box<dyn ResourceSampler>) -> Self {
        let pressure = &config.resources.memory_tuning.pressure;
        let buffer = &config.resources.memory_tuning.buffer;
        let autoscaling = &config.resources.driver_autoscaling;

        Self {
            check_interval: pressure.check_interval(),
            base_mem_threshold: pressure.mem_threshold,
            base_cpu_threshold: pressure.cpu_threshold,
            safe_margin: pressure.safe_margin,
            base_down_margin: buffer.down_margin,
            base_up_margin: buffer.up_margin,
            hysteresis: autoscaling.hysteresis(),
            state: Mutex::new(MonitorState {
                sampler,
                prev_cpu: None,
                last_check: None,
                last: ResourceSample::default(),
                avg: ResourceSample::default(),
                memory_history: RingBuffer::new(pressure.history),
                cpu_history: RingBuffer::new(pressure.history),
                memory_hist: DecayingHistogram::new(),
                cpu_hist: DecayingHistogram::new(),
                dynamic: DynamicBuffer::new(autoscaling.cooldown(), buffer.adjust_rate),
                high_load: false,
                last_transition: None,
            }),
        }
    }

    /// Most recent sample, refreshed when older than the check interval.
    pub fn resource_stats(&self) -> ResourceSample {
        let mut state = self.state.lock().unwrap();
        if Self::stale(&state, self.check_interval) {
            Self::sample(&mut state);
        }
        state.last
    }

    /// Rolling mean over the bounded history.
    pub fn avg_stats(&self) -> ResourceSample {
        let mut state = self.state.lock().unwrap();
        if Self::stale(&state, self.check_interval) {
            Self::sample(&mut state);
        }
        state.avg
    }

    pub fn is_high_load(&self) -> bool {
        self.state.lock().unwrap().high_load
    }

    /// Drop accumulated history and readings. The verdict itself is kept;
    /// only fresh samples may move it.
    pub fn cleanup(&self) {
        let mut state = self.state.lock().unwrap();
        state.memory_history.clear();
        state.cpu_history.clear();
        state.memory_hist.clear();
        state.cpu_hist.clear();
        state.prev_cpu = None;
        state.last = ResourceSample::default();
        state.avg = ResourceSample::default();
        state.last_check = None;
    }

    fn stale(state: &MonitorState, interval: Duration) -> bool {
        state
            .last_check
            .map(|t| t.elapsed() > interval)
            .unwrap_or(true)
    }

    fn sample(state: &mut MonitorState) {
        let memory = state.sampler.memory_percent();
        let cpu_times = state.sampler.cpu_times();
        let cpu = match state.prev_cpu {
            Some(prev) => cpu_times.busy_percent_since(&prev),
            None => 0.0,
        };
        state.prev_cpu = Some(cpu_times);
        state.last_check = Some(Instant::now());

        state.memory_history.push(memory);
        state.cpu_history.push(cpu);
        state.memory_hist.record(memory);
        state.cpu_hist.record(cpu);

        state.last = ResourceSample::new(memory, cpu);
        state.avg = ResourceSample::new(state.memory_history.mean(), state.cpu_history.mean());
    }

    /// Sample, evaluate the load rules, apply a hysteresis-gated transition,
    /// and push the verdict into `sink`. Returns the standing verdict.
    pub fn check_load(&self, sink: &dyn PressureSink) -> bool {
        let mut state = self.state.lock().unwrap();
        Self::sample(&mut state);

        let cur = state.last;
        let avg = state.avg;
        let base_mem = self.base_mem_threshold;
        let base_cpu = self.base_cpu_threshold;

        let mem_ratio = state.memory_hist.ratio_at_or_above(base_mem);
        let cpu_ratio = state.cpu_hist.ratio_at_or_above(base_cpu);

        let (down_margin, up_margin) = state.dynamic.margins(
            avg.memory_percent,
            avg.cpu_percent,
            self.base_down_margin,
            self.base_up_margin,
        );

        let near_threshold = avg.memory_percent >= base_mem - self.safe_margin
            || avg.cpu_percent >= base_cpu - self.safe_margin;

        let spike_block = cur.memory_percent > base_mem + up_margin
            || cur.cpu_percent > base_cpu + up_margin
            || mem_ratio >= TREND_RATIO
            || cpu_ratio >= TREND_RATIO;

        let trend_block = avg.memory_percent > base_mem + up_margin
            || avg.cpu_percent > base_cpu + up_margin;

        let release_ok = (avg.memory_percent <= base_mem - down_margin
            || avg.cpu_percent <= base_cpu - down_margin)
            && mem_ratio < TREND_RATIO
            && cpu_ratio < TREND_RATIO;

        let wants_high = if state.high_load {
            spike_block || !release_ok
        } else {
            spike_block && trend_block
        };

        let dwell_ok = state
            .last_transition
            .map(|t| t.elapsed() >= self.hysteresis)
            .unwrap_or(true);

        if dwell_ok && wants_high != state.high_load {
            state.high_load = wants_high;
            state.last_transition = Some(Instant::now());
            info!(
                "load verdict changed: high_load={} avg_mem={:.1}% avg_cpu={:.1}% mem_ratio={:.2} cpu_ratio={:.2}",
                wants_high, avg.memory_percent, avg.cpu_percent, mem_ratio, cpu_ratio
            );
        } else {
            debug!(
                "load check: high_load={} cur={:.1}%/{:.1}% avg={:.1}%/{:.1}% block_at={:.1}% release_at={:.1}%",
                state.high_load,
                cur.memory_percent,
                cur.cpu_percent,
                avg.memory_percent,
                avg.cpu_percent,
                base_mem + up_margin,
                base_mem - down_margin
            );
        }

        let high = state.high_load;
        drop(state);

        sink.note_pressure_check(high);
        sink.set_high_load(high);
        sink.set_near_threshold(near_threshold);
        high
    }
}

/// Background loop: evaluate the load rules every `interval` until `stop`
/// flips. Each iteration is a single `check_load`.
pub async fn run_pressure_loop(
    monitor: std::sync::Arc<ResourceMonitor>,
    sink: std::sync::Arc<dyn PressureSink>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        monitor.check_load(sink.as_ref());
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    debug!("pressure loop stopped");
}

#[cfg(test)]
mod tests {
    use super::sampler::testing::ScriptedSampler;
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        high: AtomicBool,
        near: AtomicBool,
        checks: AtomicUsize,
    }

    impl PressureSink for RecordingSink {
        fn set_high_load(&self, high: bool) {
            self.high.store(high, Ordering::SeqCst);
        }

        fn note_pressure_check(&self, _high: bool) {
            self.checks.fetch_add(1, Ordering::SeqCst);
        }

        fn set_near_threshold(&self, near: bool) {
            self.near.store(near, Ordering::SeqCst);
        }
    }

    fn test_config(hysteresis_sec: f64) -> Config {
        let mut config = Config::default();
        config.resources.memory_tuning.pressure.mem_threshold = 75.0;
        config.resources.memory_tuning.pressure.cpu_threshold = 85.0;
        config.resources.memory_tuning.pressure.history = 4;
        config.resources.driver_autoscaling.spawn_buffer = hysteresis_sec;
        // keep margins fixed for deterministic thresholds
        config.resources.driver_autoscaling.scale_down_cooldown = 10_000.0;
        config.resources.memory_tuning.buffer.up_margin = 4.0;
        config.resources.memory_tuning.buffer.down_margin = 2.0;
        config
    }

    fn monitor_with(samples: Vec<(f64, f64)>, hysteresis_sec: f64) -> ResourceMonitor {
        ResourceMonitor::with_sampler(
            &test_config(hysteresis_sec),
            Box::new(ScriptedSampler::new(samples)),
        )
    }

    #[test]
    fn quiet_system_stays_unblocked() {
        let monitor = monitor_with(vec![(30.0, 20.0); 6], 0.0);
        let sink = RecordingSink::default();
        for _ in 0..6 {
            assert!(!monitor.check_load(&sink));
        }
        assert!(!sink.high.load(Ordering::SeqCst));
        assert_eq!(sink.checks.load(Ordering::SeqCst), 6);
        assert!(!sink.near.load(Ordering::SeqCst));
    }

    #[test]
    fn sustained_overload_sets_high_load() {
        let monitor = monitor_with(vec![(95.0, 95.0); 4], 0.0);
        let sink = RecordingSink::default();
        let mut verdicts = Vec::new();
        for _ in 0..4 {
            verdicts.push(monitor.check_load(&sink));
        }
        assert!(*verdicts.last().unwrap());
        assert!(sink.high.load(Ordering::SeqCst));
        assert!(sink.near.load(Ordering::SeqCst));
    }

    #[test]
    fn recovery_clears_high_load() {
        let mut samples = vec![(95.0, 95.0); 4];
        samples.extend(vec![(30.0, 20.0); 8]);
        let monitor = monitor_with(samples, 0.0);
        let sink = RecordingSink::default();
        for _ in 0..4 {
            monitor.check_load(&sink);
        }
        assert!(monitor.is_high_load());
        for _ in 0..8 {
            monitor.check_load(&sink);
        }
        assert!(!monitor.is_high_load());
        assert!(!sink.high.load(Ordering::SeqCst));
    }

    #[test]
    fn hysteresis_blocks_rapid_flapping() {
        // High then immediately low: with a long dwell the release may not
        // happen in the same burst of checks.
        let mut samples = vec![(95.0, 95.0); 4];
        samples.extend(vec![(20.0, 10.0); 8]);
        let monitor = monitor_with(samples, 3600.0);
        let sink = RecordingSink::default();
        for _ in 0..4 {
            monitor.check_load(&sink);
        }
        assert!(monitor.is_high_load());
        for _ in 0..8 {
            monitor.check_load(&sink);
        }
        // still blocked: the dwell since the set-transition has not elapsed
        assert!(monitor.is_high_load());
    }

    #[test]
    fn single_spike_does_not_block() {
        // One spike with a calm average: spike_block without trend_block.
        let mut samples = vec![(30.0, 20.0); 4];
        samples.push((95.0, 20.0));
        samples.extend(vec![(30.0, 20.0); 2]);
        let monitor = monitor_with(samples, 0.0);
        let sink = RecordingSink::default();
        for _ in 0..7 {
            monitor.check_load(&sink);
        }
        assert!(!monitor.is_high_load());
    }

    #[test]
    fn first_cpu_sample_reads_zero() {
        let monitor = monitor_with(vec![(50.0, 80.0); 3], 0.0);
        let first = monitor.resource_stats();
        assert_eq!(first.cpu_percent, 0.0);
        assert_eq!(first.memory_percent, 50.0);
    }

    #[test]
    fn averages_are_means_over_history() {
        let monitor = monitor_with(vec![(10.0, 0.0), (20.0, 0.0), (30.0, 0.0)], 0.0);
        let sink = RecordingSink::default();
        for _ in 0..3 {
            monitor.check_load(&sink);
        }
        let avg = monitor.avg_stats();
        assert!((avg.memory_percent - 20.0).abs() < 1e-9);
    }

    #[test]
    fn cleanup_resets_history() {
        let monitor = monitor_with(vec![(90.0, 90.0); 4], 0.0);
        let sink = RecordingSink::default();
        for _ in 0..4 {
            monitor.check_load(&sink);
        }
        monitor.cleanup();
        let avg = monitor.avg_stats();
        // post-cleanup average reflects only the fresh sample
        assert!(avg.cpu_percent <= 100.0);
        assert_eq!(monitor.state.lock().unwrap().memory_history.len(), 1);
    }
}
