//! Synthetic labelled point clouds for tests and demos.

use crate::field::Condition;
use crate::{Component, Error, Result};
use ndarray::{Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// A labelled 2D dataset: `points` is `[n, d]`, one label per row.
#[derive(Debug, Clone)]
pub struct Labelled {
    pub points: Array2<f32>,
    pub labels: Vec<Condition>,
}

fn normal(std: f32) -> Result<Normal<f32>> {
    // `Normal::new` accepts a negative std (it mirrors the distribution).
    let invalid = || Error::Domain {
        component: Component::Sampler,
        msg: format!("noise std must be finite and >= 0, got {std}"),
    };
    if !std.is_finite() || std < 0.0 {
        return Err(invalid());
    }
    Normal::new(0.0, std).map_err(|_| invalid())
}

/// Two interleaving half circles, class 0 on top and class 1 underneath, with isotropic Gaussian
/// jitter of standard deviation `noise`. Rows are shuffled.
pub fn two_moons(n: usize, noise: f32, seed: u64) -> Result<Labelled> {
    if n < 2 {
        return Err(Error::Domain {
            component: Component::Sampler,
            msg: "two_moons needs at least 2 points".into(),
        });
    }
    let jitter = normal(noise)?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let n_outer = n / 2;
    let n_inner = n - n_outer;
    let arc = |i: usize, m: usize| {
        if m <= 1 {
            0.0
        } else {
            core::f32::consts::PI * i as f32 / (m - 1) as f32
        }
    };

    let mut rows: Vec<([f32; 2], u32)> = Vec::with_capacity(n);
    for i in 0..n_outer {
        let a = arc(i, n_outer);
        rows.push(([a.cos(), a.sin()], 0));
    }
    for i in 0..n_inner {
        let a = arc(i, n_inner);
        rows.push(([1.0 - a.cos(), 0.5 - a.sin()], 1));
    }
    rows.shuffle(&mut rng);

    let mut points = Array2::<f32>::zeros((n, 2));
    let mut labels = Vec::with_capacity(n);
    for (mut row, (p, c)) in points.axis_iter_mut(Axis(0)).zip(rows) {
        row[0] = p[0] + jitter.sample(&mut rng);
        row[1] = p[1] + jitter.sample(&mut rng);
        labels.push(Condition::Class(c));
    }
    Ok(Labelled { points, labels })
}

/// `n_per_class` Gaussian points around each row of `centers`; class `k` is `centers[k]`.
pub fn gaussian_blobs(
    centers: &ArrayView2<f32>,
    n_per_class: usize,
    std: f32,
    seed: u64,
) -> Result<Labelled> {
    if centers.nrows() == 0 || centers.ncols() == 0 || n_per_class == 0 {
        return Err(Error::Domain {
            component: Component::Sampler,
            msg: "gaussian_blobs needs centers and points".into(),
        });
    }
    let jitter = normal(std)?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let n = centers.nrows() * n_per_class;
    let mut points = Array2::<f32>::zeros((n, centers.ncols()));
    let mut labels = Vec::with_capacity(n);
    for (i, mut row) in points.axis_iter_mut(Axis(0)).enumerate() {
        let k = i / n_per_class;
        for (x, &c) in row.iter_mut().zip(centers.row(k)) {
            *x = c + jitter.sample(&mut rng);
        }
        labels.push(Condition::Class(k as u32));
    }
    Ok(Labelled { points, labels })
}
