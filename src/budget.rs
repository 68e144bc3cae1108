//! Spawn budget - rolling-window admission gate for driver creation
//!
//! The pool consults the budget before every driver creation. The budget
//! sees the pool only as a value snapshot ([`PoolAdmission`]), which keeps
//! ownership one-directional.

use std::sync::Mutex;
use std::time::Duration;

// tokio's Instant so paused-clock tests can drive the window; identical to
// std's outside a test runtime.
use tokio::time::Instant;
use tracing::debug;

/// What the budget needs to know about the pool at decision time.
#[derive(Debug, Clone, Copy)]
pub struct PoolAdmission {
    pub drivers_in_use: usize,
    /// `None` means the pool is unbounded (`driver_limit: auto`)
    pub max_size: Option<usize>,
    pub high_load: bool,
}

#[derive(Debug)]
struct Window {
    count: u32,
    window_start: Instant,
}

/// Token-window gate: at most `max_per_window` reservations per rolling
/// window, and none at all while the pool is saturated or under load.
#[derive(Debug)]
pub struct SpawnBudget {
    max_per_window: u32,
    window: Duration,
    state: Mutex<Window>,
}

impl SpawnBudget {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            state: Mutex::new(Window {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Reserve one spawn. Serialized by the budget's own mutex:
    ///
    /// 1. reset the window when it has lapsed,
    /// 2. deny while the pool is at capacity,
    /// 3. deny while the pool reports high load,
    /// 4. otherwise count the reservation and allow iff it fits the window.
    pub fn try_reserve(&self, pool: &PoolAdmission) -> bool {
        let mut state = self.state.lock().unwrap();

        let now = Instant::now();
        if now.duration_since(state.window_start) > self.window {
            state.count = 0;
            state.window_start = now;
        }

        if let Some(max) = pool.max_size {
            if pool.drivers_in_use >= max {
                debug!(in_use = pool.drivers_in_use, max, "spawn denied: pool at capacity");
                return false;
            }
        }

        if pool.high_load {
            debug!("spawn denied: high load");
            return false;
        }

        state.count += 1;
        state.count <= self.max_per_window
    }

    /// Whether a reservation would currently fit the window, without taking
    /// one. Ignores capacity and load, which belong to the caller.
    pub fn can_allow(&self) -> bool {
        let state = self.state.lock().unwrap();
        if Instant::now().duration_since(state.window_start) > self.window {
            return self.max_per_window > 0;
        }
        state.count < self.max_per_window
    }

    /// Actual remaining reservations in the current window; a lapsed window
    /// reports the full budget.
    pub fn remaining(&self) -> u32 {
        let state = self.state.lock().unwrap();
        if Instant::now().duration_since(state.window_start) > self.window {
            return self.max_per_window;
        }
        self.max_per_window.saturating_sub(state.count)
    }

    /// Time until the current window resets; zero when it already lapsed.
    pub fn time_until_reset(&self) -> Duration {
        let state = self.state.lock().unwrap();
        self.window
            .saturating_sub(Instant::now().duration_since(state.window_start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_pool() -> PoolAdmission {
        PoolAdmission {
            drivers_in_use: 0,
            max_size: Some(10),
            high_load: false,
        }
    }

    #[test]
    fn denies_beyond_window_budget() {
        let budget = SpawnBudget::new(3, Duration::from_secs(60));
        let pool = open_pool();
        assert!(budget.try_reserve(&pool));
        assert!(budget.try_reserve(&pool));
        assert!(budget.try_reserve(&pool));
        assert!(!budget.try_reserve(&pool));
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn denies_at_capacity() {
        let budget = SpawnBudget::new(5, Duration::from_secs(60));
        let pool = PoolAdmission {
            drivers_in_use: 10,
            max_size: Some(10),
            high_load: false,
        };
        assert!(!budget.try_reserve(&pool));
        // capacity denials do not consume budget
        assert_eq!(budget.remaining(), 5);
    }

    #[test]
    fn denies_under_high_load() {
        let budget = SpawnBudget::new(5, Duration::from_secs(60));
        let pool = PoolAdmission {
            high_load: true,
            ..open_pool()
        };
        assert!(!budget.try_reserve(&pool));
        assert_eq!(budget.remaining(), 5);
    }

    #[test]
    fn unbounded_pool_skips_capacity_check() {
        let budget = SpawnBudget::new(1, Duration::from_secs(60));
        let pool = PoolAdmission {
            drivers_in_use: 500,
            max_size: None,
            high_load: false,
        };
        assert!(budget.try_reserve(&pool));
    }

    #[test]
    fn window_reset_restores_budget() {
        let budget = SpawnBudget::new(2, Duration::from_millis(20));
        let pool = open_pool();
        assert!(budget.try_reserve(&pool));
        assert!(budget.try_reserve(&pool));
        assert!(!budget.try_reserve(&pool));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(budget.remaining(), 2);
        assert!(budget.try_reserve(&pool));
    }

    #[test]
    fn time_until_reset_counts_down() {
        let budget = SpawnBudget::new(1, Duration::from_secs(60));
        let left = budget.time_until_reset();
        assert!(left <= Duration::from_secs(60));
        assert!(left > Duration::from_secs(55));
    }
}
