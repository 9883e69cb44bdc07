//! Fixed-rate tick pacing for the single-threaded simulation loop.
//!
//! The clock does not sleep on its own; the owner feeds it wall-clock deltas
//! and runs one simulation tick per step it hands back.

use crate::SimTick;
use std::time::{Duration, Instant};

/// Upper bound on ticks returned from one [`SimulationClock::advance`] call.
///
/// Stops a long stall (debugger, suspended laptop) from producing a burst of
/// catch-up ticks.
const MAX_CATCH_UP_TICKS: u32 = 5;

/// Accumulator-based fixed tick clock.
#[derive(Debug, Clone)]
pub struct SimulationClock {
    tick_duration: Duration,
    accumulator: Duration,
    last_instant: Option<Instant>,
    current: SimTick,
}

impl SimulationClock {
    /// Create a clock running at `ticks_per_second` (clamped to at least 1).
    pub fn new(ticks_per_second: u32) -> Self {
        let tps = ticks_per_second.max(1);
        Self {
            tick_duration: Duration::from_secs(1) / tps,
            accumulator: Duration::ZERO,
            last_instant: None,
            current: SimTick::ZERO,
        }
    }

    /// Duration of one tick.
    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Current tick (number of ticks handed out so far).
    pub fn current_tick(&self) -> SimTick {
        self.current
    }

    /// Feed an elapsed wall-clock delta and get the number of ticks to run.
    pub fn advance(&mut self, elapsed: Duration) -> u32 {
        self.accumulator += elapsed;
        let mut ticks = 0;
        while self.accumulator >= self.tick_duration && ticks < MAX_CATCH_UP_TICKS {
            self.accumulator -= self.tick_duration;
            ticks += 1;
        }
        if ticks == MAX_CATCH_UP_TICKS {
            self.accumulator = Duration::ZERO;
        }
        self.current = self.current.advance(u64::from(ticks));
        ticks
    }

    /// Sample `Instant::now()` and run `on_tick` once per due tick.
    ///
    /// Returns how long the caller may idle before the next tick is due.
    pub fn run_due<F>(&mut self, mut on_tick: F) -> Duration
    where
        F: FnMut(SimTick),
    {
        let now = Instant::now();
        let elapsed = self
            .last_instant
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(self.tick_duration);
        self.last_instant = Some(now);

        let start = self.current;
        let ticks = self.advance(elapsed);
        for i in 0..ticks {
            on_tick(start.advance(u64::from(i) + 1));
        }
        self.tick_duration.saturating_sub(self.accumulator)
    }
}

impl Default for SimulationClock {
    fn default() -> Self {
        Self::new(20)
    }
}
