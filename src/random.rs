//! A thin wrapper over `rand`/`rand_distr`, the standard ziggurat-table-based
//! variate generator rather than a hand-rolled one.
//!
//! The generator lives on [`crate::kernel::Kernel`], not behind a bare
//! thread-local: a process here is backed by its own dedicated OS thread
//! (see `coroutine/mod.rs`), so a thread-local generator would hand every
//! process an independent, unseeded stream instead of the one shared,
//! seedable stream a simulation's "deterministic given its seed" promise
//! (spec's design goal) depends on. These free functions are a convenience
//! that reach for `Kernel::current()`, the same thread-local "which
//! simulation am I part of" lookup `process::Process::current()` uses.

use rand::Rng;
use rand_distr::{Distribution, Exp};

use crate::kernel::Kernel;

/// Reseed the current simulation's shared generator deterministically,
/// which is what makes a simulation reproducible given its seed and the
/// kernel's tie-breaking rules.
pub fn seed(seed: u64) {
    Kernel::current().seed_rng(seed);
}

/// A uniform 64-bit value, drawn from the current simulation's shared
/// stream.
pub fn next_u64() -> u64 {
    Kernel::current().with_rng(|rng| rng.gen())
}

/// A uniform `f64` in `[0, 1)`.
pub fn uniform01() -> f64 {
    Kernel::current().with_rng(|rng| rng.gen::<f64>())
}

/// An exponential variate with the given rate (`1/mean`) — the
/// inter-arrival and service-time distribution a queueing simulation
/// typically needs.
pub fn exponential(rate: f64) -> f64 {
    let dist = Exp::new(rate).unwrap_or_else(|_| crate::error::fatal("exponential() rate must be > 0"));
    Kernel::current().with_rng(|rng| dist.sample(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;

    #[test]
    fn seeding_is_reproducible() {
        let k = Kernel::new(0.0);
        Kernel::install_current(k.clone());
        seed(42);
        let a: Vec<u64> = (0..5).map(|_| next_u64()).collect();
        seed(42);
        let b: Vec<u64> = (0..5).map(|_| next_u64()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn exponential_variates_are_nonnegative() {
        let k = Kernel::new(0.0);
        Kernel::install_current(k.clone());
        seed(7);
        for _ in 0..100 {
            assert!(exponential(1.0 / 0.75) >= 0.0);
        }
    }

    #[test]
    fn two_kernels_seeded_alike_draw_the_same_sequence() {
        let a = Kernel::new(0.0);
        a.seed_rng(9);
        let b = Kernel::new(0.0);
        b.seed_rng(9);
        let draws_a: Vec<u64> = (0..5).map(|_| a.with_rng(|r| r.gen())).collect();
        let draws_b: Vec<u64> = (0..5).map(|_| b.with_rng(|r| r.gen())).collect();
        assert_eq!(draws_a, draws_b);
    }
}
