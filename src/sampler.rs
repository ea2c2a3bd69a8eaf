//! Reference noise for the `t = 0` end of the path.
//!
//! Samples are drawn element by element in row-major order, so a batch of `B` is exactly the
//! concatenation of `B` single-sample draws from the same RNG stream.

use crate::{Component, Error, Result};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::Deserialize;

/// Reference distribution for `x_noise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseSampler {
    /// i.i.d. `N(0, 1)`.
    #[default]
    Gaussian,
    /// i.i.d. `U(-1, 1)`.
    Uniform,
}

impl NoiseSampler {
    #[inline]
    fn draw(self, rng: &mut impl Rng) -> f32 {
        match self {
            NoiseSampler::Gaussian => StandardNormal.sample(rng),
            NoiseSampler::Uniform => rng.random::<f32>() * 2.0 - 1.0,
        }
    }

    /// Draw a `[batch, ...shape]` noise tensor.
    ///
    /// `shape` is the per-sample state shape (e.g. `[c, h, w]` or `[points, d]`); an empty
    /// `shape` means scalar states.
    pub fn sample(self, batch: usize, shape: &[usize], rng: &mut impl Rng) -> Result<ArrayD<f32>> {
        if shape.iter().any(|&d| d == 0) {
            return Err(Error::Domain {
                component: Component::Sampler,
                msg: format!("state shape {shape:?} has a zero-sized dimension"),
            });
        }
        let mut full = Vec::with_capacity(shape.len() + 1);
        full.push(batch);
        full.extend_from_slice(shape);

        let mut out = ArrayD::<f32>::zeros(IxDyn(&full));
        for x in out.iter_mut() {
            *x = self.draw(rng);
        }
        Ok(out)
    }

    /// Noise with the same shape as a batch of data.
    pub fn sample_like(self, x: &ArrayViewD<f32>, rng: &mut impl Rng) -> Result<ArrayD<f32>> {
        if x.ndim() == 0 {
            return Err(Error::Domain {
                component: Component::Sampler,
                msg: "states need a leading batch axis".into(),
            });
        }
        self.sample(x.shape()[0], &x.shape()[1..], rng)
    }

    /// Like [`Self::sample`], with a fresh `ChaCha8Rng` seeded from `seed`.
    pub fn sample_seeded(self, batch: usize, shape: &[usize], seed: u64) -> Result<ArrayD<f32>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.sample(batch, shape, &mut rng)
    }
}
