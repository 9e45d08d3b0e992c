//! Seeded randomness for the simulation driver.
//!
//! The ghost-exchange protocol itself makes no random decisions; the RNG only
//! drives choices the outcome must be independent of, such as the order in
//! which components are built.

use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};

/// Seeded generator owned by a single [`Simulation`](super::Simulation).
pub struct SimulationRng {
    inner: SmallRng,
    seed: u64,
}

impl SimulationRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: SmallRng::seed_from_u64(seed),
            seed,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Permutes `items` in place; the same seed yields the same permutation.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.inner);
    }
}

impl std::fmt::Debug for SimulationRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRng")
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}
