//! Deterministic seed derivation.
//!
//! Every random draw in the pipeline flows from an explicit episode seed:
//!
//! ```text
//! episode seed
//! ├── "task"      -> task sampler RNG
//! ├── "scene"     -> object placement, camera and light randomization
//! └── attempt k   -> seed of the k-th retry (resample after infeasibility)
//! ```
//!
//! Child seeds are hashed from the parent, so concurrent workers never share
//! RNG state and a given seed reproduces the same episode on any worker.

use std::hash::{DefaultHasher, Hash, Hasher};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Derive a child seed from a parent seed and a string key.
#[must_use]
pub fn derive_seed(parent: u64, key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    parent.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

/// Derive a child seed from a parent seed and a numeric index.
#[must_use]
pub fn derive_seed_indexed(parent: u64, index: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    parent.hash(&mut hasher);
    index.hash(&mut hasher);
    hasher.finish()
}

/// Seed used for the `attempt`-th try at generating the episode for `seed`.
///
/// Attempt 0 uses the requested seed unchanged, so `sample(seed)` on its own
/// reproduces the task of a first-try episode.
#[must_use]
pub fn attempt_seed(seed: u64, attempt: u32) -> u64 {
    if attempt == 0 {
        seed
    } else {
        derive_seed_indexed(seed, u64::from(attempt))
    }
}

/// A ChaCha8 RNG for a named subsystem of the episode identified by `seed`.
#[must_use]
pub fn subsystem_rng(seed: u64, subsystem: &str) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(derive_seed(seed, subsystem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn derived_seeds_are_stable_and_distinct() {
        assert_eq!(derive_seed(42, "task"), derive_seed(42, "task"));
        assert_ne!(derive_seed(42, "task"), derive_seed(42, "scene"));
        assert_ne!(derive_seed(42, "task"), derive_seed(43, "task"));
        assert_ne!(derive_seed_indexed(7, 0), derive_seed_indexed(7, 1));
    }

    #[test]
    fn first_attempt_keeps_the_requested_seed() {
        assert_eq!(attempt_seed(42, 0), 42);
        assert_ne!(attempt_seed(42, 1), 42);
        assert_ne!(attempt_seed(42, 1), attempt_seed(42, 2));
    }

    #[test]
    fn subsystem_rngs_replay_identically() {
        let mut a = subsystem_rng(9, "scene");
        let mut b = subsystem_rng(9, "scene");
        for _ in 0..8 {
            assert_eq!(a.gen::<u32>(), b.gen::<u32>());
        }
    }
}
