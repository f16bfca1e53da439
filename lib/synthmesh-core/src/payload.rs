//! Synthetic payloads and the node-wide random source.
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use rand::{rngs::StdRng, SeedableRng as _};
use rand_distr::{Distribution as _, Normal};

/// Standard deviation of generated payload sizes, in bytes.
pub const PAYLOAD_SIZE_STD_DEV: f64 = 10.0;

/// Seeded random source shared by everything on a node that needs randomness.
///
/// A single seeded generator keeps a node's sequence of random choices reproducible for a given seed and request
/// order.
#[derive(Clone)]
pub struct SharedRng {
    inner: Arc<Mutex<StdRng>>,
}

impl SharedRng {
    /// Creates a new `SharedRng` from the given seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Runs `f` with exclusive access to the generator.
    pub fn with<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        let mut rng = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }
}

/// Generates local payloads whose sizes are normally distributed around a mean.
pub struct PayloadGenerator {
    mean_size: u64,
    distribution: Option<Normal<f64>>,
    rng: SharedRng,
}

impl PayloadGenerator {
    /// Creates a new `PayloadGenerator` with the given mean payload size.
    pub fn new(mean_size: u64, rng: SharedRng) -> Self {
        Self {
            mean_size,
            distribution: Normal::new(mean_size as f64, PAYLOAD_SIZE_STD_DEV).ok(),
            rng,
        }
    }

    /// Returns the size of the next payload, in bytes.
    pub fn next_size(&self) -> usize {
        match &self.distribution {
            Some(distribution) => {
                let sample = self.rng.with(|rng| distribution.sample(rng));
                sample.round().max(0.0) as usize
            }
            None => self.mean_size as usize,
        }
    }

    /// Generates the next zero-filled payload.
    pub fn next_payload(&self) -> Bytes {
        Bytes::from(vec![0; self.next_size()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_cluster_around_mean() {
        let generator = PayloadGenerator::new(256, SharedRng::from_seed(42));
        let sizes = (0..1000).map(|_| generator.next_size()).collect::<Vec<_>>();

        let mean = sizes.iter().sum::<usize>() as f64 / sizes.len() as f64;
        assert!((mean - 256.0).abs() < 2.0, "mean was {}", mean);
        // Ten standard deviations out is effectively impossible.
        assert!(sizes.iter().all(|size| (156..=356).contains(size)));
    }

    #[test]
    fn same_seed_same_sequence() {
        let first = PayloadGenerator::new(128, SharedRng::from_seed(7));
        let second = PayloadGenerator::new(128, SharedRng::from_seed(7));
        for _ in 0..32 {
            assert_eq!(first.next_size(), second.next_size());
        }
    }

    #[test]
    fn small_means_never_go_negative() {
        let generator = PayloadGenerator::new(0, SharedRng::from_seed(1));
        for _ in 0..100 {
            assert!(generator.next_payload().len() < 100);
        }
    }
}
