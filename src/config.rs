//! Runtime configuration
//!
//! An immutable [`Config`] is handed to the core at start. It can be built
//! in code with `Config::default()`, or loaded from a YAML file whose key
//! layout mirrors the sections below.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::{DroverError, Result};

/// Environment fallbacks for proxy credentials when the config leaves them
/// unset.
pub const PROXY_USERNAME_ENV: &str = "EXPORT_PROXY_USERNAME";
pub const PROXY_PASSWORD_ENV: &str = "EXPORT_PROXY_PASSWORD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub system: SystemConfig,
    pub resources: ResourcesConfig,
    pub misc: MiscConfig,
    pub proxy: ProxyConfig,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(raw).map_err(|e| DroverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve `(pool max size, max workers)` from `system.driver_limit`.
    ///
    /// `auto` means an unlimited pool with a 100-worker ceiling; a number
    /// pins both to the same value.
    pub fn worker_limits(&self) -> (Option<usize>, usize) {
        match self.system.driver_limit {
            DriverLimit::Auto => (None, 100),
            DriverLimit::Fixed(n) => (Some(n), n),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let DriverLimit::Fixed(0) = self.system.driver_limit {
            return Err(DroverError::Config(
                "system.driver_limit must be \"auto\" or a positive integer".into(),
            ));
        }
        let spawning = &self.resources.driver_spawning;
        if spawning.spawn_window_sec == 0 {
            return Err(DroverError::Config(
                "resources.driver_spawning.spawn_window_sec must be > 0".into(),
            ));
        }
        let pressure = &self.resources.memory_tuning.pressure;
        if pressure.history == 0 {
            return Err(DroverError::Config(
                "resources.memory_tuning.pressure.history must be > 0".into(),
            ));
        }
        if pressure.system_check_interval <= 0.0 {
            return Err(DroverError::Config(
                "resources.memory_tuning.pressure.system_check_interval must be > 0".into(),
            ));
        }
        let blocking = &self.resources.memory_tuning.pressure_blocking;
        if blocking.wait_chunk_time <= 0.0 || blocking.max_wait_time < blocking.wait_chunk_time {
            return Err(DroverError::Config(
                "pressure_blocking requires 0 < wait_chunk_time <= max_wait_time".into(),
            ));
        }
        Ok(())
    }
}

/// Pool size and worker ceiling, from `system.driver_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverLimit {
    Auto,
    Fixed(usize),
}

impl Serialize for DriverLimit {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            DriverLimit::Auto => serializer.serialize_str("auto"),
            DriverLimit::Fixed(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl Default for DriverLimit {
    fn default() -> Self {
        DriverLimit::Auto
    }
}

impl<'de> Deserialize<'de> for DriverLimit {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(usize),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(DriverLimit::Fixed(n)),
            Raw::Text(s) if s.eq_ignore_ascii_case("auto") => Ok(DriverLimit::Auto),
            Raw::Text(s) => s
                .parse::<usize>()
                .map(DriverLimit::Fixed)
                .map_err(|_| serde::de::Error::custom(format!("invalid driver_limit: {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// `"auto"` for an unlimited pool, or a fixed driver/worker count
    pub driver_limit: DriverLimit,

    /// Start browsers without a visible window
    pub headless: bool,

    /// Executable names matched by the residual-process sweep in
    /// `DriverPool::close_all`, merged with the factory's own names
    pub browser_process_names: Vec<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            driver_limit: DriverLimit::Auto,
            headless: true,
            browser_process_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub driver_spawning: DriverSpawning,
    pub driver_autoscaling: DriverAutoscaling,
    pub memory_tuning: MemoryTuning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSpawning {
    /// Rolling window length in seconds
    pub spawn_window_sec: u64,
    /// Driver creations permitted per window
    pub max_spawns_per_window: u32,
}

impl Default for DriverSpawning {
    fn default() -> Self {
        Self {
            spawn_window_sec: 60,
            max_spawns_per_window: 10,
        }
    }
}

impl DriverSpawning {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.spawn_window_sec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverAutoscaling {
    /// Workers added per scale-up round
    pub step_up: usize,
    /// Pressure-driven driver destroys permitted per cooldown cycle
    pub step_down: usize,
    /// Cadence of the manager's worker monitor and the pressure loop, seconds
    pub scaling_check_interval: f64,
    /// Minimum spacing between pressure scale-downs, seconds
    pub scale_down_cooldown: f64,
    /// Hysteresis: minimum dwell between opposite high-load transitions, seconds
    pub spawn_buffer: f64,
}

impl Default for DriverAutoscaling {
    fn default() -> Self {
        Self {
            step_up: 2,
            step_down: 1,
            scaling_check_interval: 5.0,
            scale_down_cooldown: 5.0,
            spawn_buffer: 10.0,
        }
    }
}

impl DriverAutoscaling {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.scaling_check_interval)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.scale_down_cooldown)
    }

    pub fn hysteresis(&self) -> Duration {
        Duration::from_secs_f64(self.spawn_buffer)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTuning {
    pub pressure: PressureConfig,
    pub buffer: BufferConfig,
    pub pressure_blocking: PressureBlocking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Minimum spacing between resource samples, seconds
    pub system_check_interval: f64,
    /// Ring-buffer length for memory/CPU history
    pub history: usize,
    /// Base memory threshold, percent
    pub mem_threshold: f64,
    /// Base CPU threshold, percent
    pub cpu_threshold: f64,
    /// Distance below a base threshold that already counts as "near", percent
    pub safe_margin: f64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            system_check_interval: 2.0,
            history: 30,
            mem_threshold: 75.0,
            cpu_threshold: 85.0,
            safe_margin: 5.0,
        }
    }
}

impl PressureConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.system_check_interval)
    }
}

/// Bounds and step for the dynamic hysteresis margins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Starting margin above a base threshold before blocking, percent
    pub up_margin: f64,
    /// Starting margin below a base threshold before releasing, percent
    pub down_margin: f64,
    /// Adjustment applied per dynamic-buffer step, percent
    pub adjust_rate: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            up_margin: 4.0,
            down_margin: 2.0,
            adjust_rate: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureBlocking {
    /// Upper bound on a single high-load wait, seconds
    pub max_wait_time: f64,
    /// Base chunk between re-polls of the load verdict, seconds
    pub wait_chunk_time: f64,
}

impl Default for PressureBlocking {
    fn default() -> Self {
        Self {
            max_wait_time: 60.0,
            wait_chunk_time: 2.0,
        }
    }
}

impl PressureBlocking {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait_time)
    }

    pub fn chunk(&self) -> Duration {
        Duration::from_secs_f64(self.wait_chunk_time)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MiscConfig {
    pub timeouts: Timeouts,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Overall teardown budget, seconds
    pub shutdown: f64,
    /// Per-worker join budget during shutdown, seconds
    pub stop_worker_timeout: f64,
    /// Requeues permitted per envelope before it is dropped
    pub max_worker_task_retries: u32,
    /// Pause after destroying a failed driver, seconds
    pub driver_recreate_delay: f64,
    /// Age at which a parked driver is retired by the idle sweep, seconds
    pub max_driver_idle_sec: f64,
    /// Cadence of the idle sweep, seconds
    pub idle_cycle_check: f64,
    /// Pacing after spawning a batch of workers, seconds
    pub spawn_wait_delay: f64,
    /// Page-load deadlines handed to the driver factory, seconds
    pub max_http_request_wait: f64,
    pub max_body_load_wait: f64,
    pub max_url_load_wait: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            shutdown: 30.0,
            stop_worker_timeout: 2.0,
            max_worker_task_retries: 2,
            driver_recreate_delay: 1.0,
            max_driver_idle_sec: 30.0,
            idle_cycle_check: 10.0,
            spawn_wait_delay: 0.5,
            max_http_request_wait: 30.0,
            max_body_load_wait: 20.0,
            max_url_load_wait: 15.0,
        }
    }
}

impl Timeouts {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown)
    }

    pub fn stop_worker(&self) -> Duration {
        Duration::from_secs_f64(self.stop_worker_timeout)
    }

    pub fn recreate_delay(&self) -> Duration {
        Duration::from_secs_f64(self.driver_recreate_delay)
    }

    pub fn max_driver_idle(&self) -> Duration {
        Duration::from_secs_f64(self.max_driver_idle_sec)
    }

    pub fn idle_cycle(&self) -> Duration {
        Duration::from_secs_f64(self.idle_cycle_check)
    }

    pub fn spawn_wait(&self) -> Duration {
        Duration::from_secs_f64(self.spawn_wait_delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Cadence of the status reporter, seconds
    pub status_interval: f64,
    /// Emit periodic status lines
    pub status_console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            status_interval: 10.0,
            status_console: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    /// `host:port` entries rotated round-robin across driver creations
    pub list: Vec<String>,
    pub credentials: ProxyCredentials,
    /// Use `socks5` scheme instead of `http`
    pub socks5_mode: bool,
    /// Resolve DNS on this host instead of through the proxy
    pub resolve_dns_locally: bool,
    pub no_ssl_verify: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyCredentials {
    pub enabled: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyCredentials {
    /// Config values win; the environment fills gaps.
    pub fn resolve(&self) -> Option<(String, String)> {
        if !self.enabled {
            return None;
        }
        let username = self
            .username
            .clone()
            .or_else(|| std::env::var(PROXY_USERNAME_ENV).ok())?;
        let password = self
            .password
            .clone()
            .or_else(|| std::env::var(PROXY_PASSWORD_ENV).ok())?;
        Some((username, password))
    }
}
