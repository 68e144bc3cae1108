//! Dynamic hysteresis margins
//!
//! The block/release margins around the base thresholds widen while the
//! system runs hot and narrow again when it cools, subject to a cooldown so
//! one noisy check cannot swing them.

use std::time::Duration;

use tokio::time::Instant;

const DOWN_MIN: f64 = 1.0;
const DOWN_MAX: f64 = 8.0;
const UP_MIN: f64 = 2.0;
const UP_MAX: f64 = 10.0;

/// Small widen step used in the middle band (either average above 70%).
const SOFT_STEP: f64 = 1.0;

#[derive(Debug)]
pub struct DynamicBuffer {
    down_margin: Option<f64>,
    up_margin: Option<f64>,
    last_adjust: Option<Instant>,
    cooldown: Duration,
    adjust_rate: f64,
}

impl DynamicBuffer {
    pub fn new(cooldown: Duration, adjust_rate: f64) -> Self {
        Self {
            down_margin: None,
            up_margin: None,
            last_adjust: None,
            cooldown,
            adjust_rate,
        }
    }

    /// Current `(down_margin, up_margin)`, adjusted at most once per
    /// cooldown. Bases seed the margins on first use.
    pub fn margins(
        &mut self,
        avg_mem: f64,
        avg_cpu: f64,
        base_down: f64,
        base_up: f64,
    ) -> (f64, f64) {
        let down = self.down_margin.get_or_insert(base_down);
        let up = self.up_margin.get_or_insert(base_up);

        let now = Instant::now();
        if let Some(last) = self.last_adjust {
            if now.duration_since(last) < self.cooldown {
                return (*down, *up);
            }
        }
        self.last_adjust = Some(now);

        if avg_mem > 80.0 && avg_cpu > 80.0 {
            *down += self.adjust_rate;
            *up += self.adjust_rate;
        } else if avg_mem > 70.0 || avg_cpu > 70.0 {
            *down += SOFT_STEP;
            *up += SOFT_STEP;
        } else if avg_mem < 55.0 && avg_cpu < 55.0 {
            *down -= self.adjust_rate;
            *up -= self.adjust_rate;
        }

        *down = down.clamp(DOWN_MIN, DOWN_MAX);
        *up = up.clamp(UP_MIN, UP_MAX);
        (*down, *up)
    }
}
