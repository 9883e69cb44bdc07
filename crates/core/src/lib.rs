#![warn(missing_docs)]
//! Core primitives shared across the workspace.

pub mod clock;

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

pub use clock::SimulationClock;

/// Fixed tick type (20 TPS => 50 ms per tick by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimTick(pub u64);

impl SimTick {
    /// First tick in any timeline.
    pub const ZERO: Self = Self(0);

    /// Advance by `delta` ticks.
    pub fn advance(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }
}

/// Helper to derive a reproducible RNG seeded by world + region domains.
pub fn scoped_rng(world_seed: u64, region_hash: u64, tick: SimTick) -> StdRng {
    let seed = world_seed ^ region_hash ^ tick.0;
    StdRng::seed_from_u64(seed)
}
