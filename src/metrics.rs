//! Evaluation utilities for flow models (small + explicit).
//!
//! These helpers are intentionally “glass box”:
//! - they do not hide solver settings
//! - they surface the exact scalar computed (and what it is *not*)

use crate::field::{check_same_shape, Condition};
use crate::{Component, Error, Result};
use ndarray::{Array1, ArrayD, ArrayView2, ArrayViewD, Axis, Zip};

/// Mean squared difference over every entry of two equally shaped arrays.
///
/// Accumulates in `f64`. Empty inputs are a domain error rather than `NaN`.
pub fn mean_sq_diff(a: &ArrayViewD<f32>, b: &ArrayViewD<f32>) -> Result<f32> {
    check_same_shape(Component::Objective, a.shape(), b.shape())?;
    if a.is_empty() {
        return Err(Error::Domain {
            component: Component::Objective,
            msg: "mean_sq_diff of empty arrays".into(),
        });
    }
    let mut s: f64 = 0.0;
    Zip::from(a).and(b).for_each(|&x, &y| {
        let r = (x - y) as f64;
        s += r * r;
    });
    Ok((s / a.len() as f64) as f32)
}

/// Per-sample straightness of a recorded trajectory: arc length / chord length.
///
/// `trajectory` is the `steps + 1` batched states returned by the solver with
/// `record_trajectory`. A straight path scores exactly `1`; curvier paths score higher. A sample
/// that never moves scores `1`; one that returns to its start scores `+inf`.
///
/// This is a proxy for how much a few-step solver will struggle, not a sample-quality metric.
pub fn trajectory_straightness(trajectory: &[ArrayD<f32>]) -> Result<Array1<f32>> {
    if trajectory.len() < 2 {
        return Err(Error::Domain {
            component: Component::Solver,
            msg: "straightness needs at least two states".into(),
        });
    }
    let first = &trajectory[0];
    if first.ndim() == 0 {
        return Err(Error::Domain {
            component: Component::Solver,
            msg: "states need a leading batch axis".into(),
        });
    }
    for x in trajectory {
        check_same_shape(Component::Solver, first.shape(), x.shape())?;
    }

    let batch = first.shape()[0];
    let mut arc = vec![0.0f64; batch];
    for pair in trajectory.windows(2) {
        for (i, (a, b)) in pair[0]
            .axis_iter(Axis(0))
            .zip(pair[1].axis_iter(Axis(0)))
            .enumerate()
        {
            arc[i] += l2_dist(&a, &b);
        }
    }

    let last = &trajectory[trajectory.len() - 1];
    let out = first
        .axis_iter(Axis(0))
        .zip(last.axis_iter(Axis(0)))
        .zip(arc)
        .map(|((a, b), arc)| {
            let chord = l2_dist(&a, &b);
            if chord > 0.0 {
                (arc / chord) as f32
            } else if arc == 0.0 {
                1.0
            } else {
                f32::INFINITY
            }
        })
        .collect();
    Ok(out)
}

fn l2_dist(a: &ArrayViewD<f32>, b: &ArrayViewD<f32>) -> f64 {
    let mut s: f64 = 0.0;
    Zip::from(a).and(b).for_each(|&x, &y| {
        let r = (x - y) as f64;
        s += r * r;
    });
    s.sqrt()
}

/// Fraction of samples whose nearest center (Euclidean) is the center of their own class.
///
/// `samples` is `[n, d]`, `centers` is `[num_classes, d]`. Unconditional samples have no class
/// and are a domain error here.
pub fn nearest_center_accuracy(
    samples: &ArrayView2<f32>,
    centers: &ArrayView2<f32>,
    cond: &[Condition],
) -> Result<f32> {
    check_same_shape(Component::Objective, &[samples.nrows()], &[cond.len()])?;
    check_same_shape(Component::Objective, &[samples.ncols()], &[centers.ncols()])?;
    if samples.nrows() == 0 || centers.nrows() == 0 {
        return Err(Error::Domain {
            component: Component::Objective,
            msg: "samples and centers must be non-empty".into(),
        });
    }

    let mut hits = 0usize;
    for (x, c) in samples.rows().into_iter().zip(cond) {
        let Condition::Class(label) = *c else {
            return Err(Error::Domain {
                component: Component::Objective,
                msg: "nearest_center_accuracy needs class labels".into(),
            });
        };
        if label as usize >= centers.nrows() {
            return Err(Error::Domain {
                component: Component::Objective,
                msg: format!("class label {label} has no center ({} centers)", centers.nrows()),
            });
        }
        let nearest = centers
            .rows()
            .into_iter()
            .map(|m| {
                m.iter()
                    .zip(x.iter())
                    .map(|(&a, &b)| ((a - b) as f64).powi(2))
                    .sum::<f64>()
            })
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(j, _)| j);
        if nearest == Some(label as usize) {
            hits += 1;
        }
    }
    Ok(hits as f32 / samples.nrows() as f32)
}
