//! The flow-matching regression objective.
//!
//! Per batch element:
//! 1. draw `t` from a [`TimestepSchedule`],
//! 2. draw `x_noise` from a [`NoiseSampler`],
//! 3. `x_t = alpha(t) x_data + beta(t) x_noise`,
//! 4. `u_t = alpha'(t) x_data + beta'(t) x_noise`,
//! 5. predict `v(x_t, t; c)` and score it against `u_t` in mean squared error.
//!
//! Targets are rebuilt for every step; [`FmTargets`] is a per-step value, never a cache.

use crate::field::{check_batch, check_same_shape, Condition, VectorField};
use crate::sampler::NoiseSampler;
use crate::scheduler::Scheduler;
use crate::{Component, Error, Result};
use ndarray::{Array1, ArrayD, ArrayView1, ArrayViewD, Axis, Zip};
use rand::Rng;
use serde::Deserialize;

/// How we sample the FM time variable `t ∈ [0,1]` during training.
///
/// Non-uniform (U-shaped) time sampling can materially affect few-step quality, because
/// numerical error concentrates near the boundaries. We keep this explicit and testable.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestepSchedule {
    /// Uniform `t ~ U[0,1)`.
    #[default]
    Uniform,
    /// U-shaped distribution with more mass near 0 and 1.
    ///
    /// Implemented as `t = sin^2((π/2) * u)` for `u ~ U[0,1]`, which is Beta(1/2, 1/2).
    #[serde(rename = "ushaped")]
    UShaped,
    /// Every element uses the same fixed `t` (validated by the scheduler).
    Constant(f32),
}

impl TimestepSchedule {
    #[inline]
    pub fn sample_t(self, rng: &mut impl Rng) -> f32 {
        match self {
            TimestepSchedule::Uniform => rng.random(),
            TimestepSchedule::UShaped => {
                let u: f32 = rng.random();
                let s = (0.5 * core::f32::consts::PI * u).sin();
                s * s
            }
            TimestepSchedule::Constant(t) => t,
        }
    }
}

/// Path, noise, and time distribution used to build targets.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct ObjectiveConfig {
    #[serde(default)]
    pub scheduler: Scheduler,
    #[serde(default)]
    pub noise: NoiseSampler,
    #[serde(default)]
    pub t_schedule: TimestepSchedule,
}

/// One step's worth of regression inputs and targets.
#[derive(Debug, Clone)]
pub struct FmTargets {
    /// Per-element times.
    pub t: Array1<f32>,
    pub x_noise: ArrayD<f32>,
    /// Interpolated states fed to the predictor.
    pub x_t: ArrayD<f32>,
    /// Path velocity the predictor regresses toward.
    pub target: ArrayD<f32>,
    pub cond: Vec<Condition>,
}

impl FmTargets {
    pub fn batch_size(&self) -> usize {
        self.t.len()
    }
}

/// Per-step loss.
#[derive(Debug, Clone)]
pub struct FmLoss {
    /// Mean squared error over every entry of the batch.
    pub value: f32,
    /// Mean squared error of each batch element.
    pub per_sample: Array1<f32>,
}

/// Build targets from explicit `t` and `x_noise` (no randomness).
pub fn targets_from(
    scheduler: Scheduler,
    x_data: &ArrayViewD<f32>,
    x_noise: &ArrayViewD<f32>,
    t: &ArrayView1<f32>,
    cond: &[Condition],
) -> Result<FmTargets> {
    let batch = check_batch(Component::Objective, x_data, t.len())?;
    check_same_shape(Component::Objective, &[batch], &[cond.len()])?;
    check_same_shape(Component::Objective, x_data.shape(), x_noise.shape())?;
    if x_data.is_empty() {
        return Err(Error::Domain {
            component: Component::Objective,
            msg: format!("cannot build targets from empty data of shape {:?}", x_data.shape()),
        });
    }

    let x_t = scheduler.interpolate(x_data, x_noise, t)?;
    let target = scheduler.target_velocity(x_data, x_noise, t)?;
    Ok(FmTargets {
        t: t.to_owned(),
        x_noise: x_noise.to_owned(),
        x_t,
        target,
        cond: cond.to_vec(),
    })
}

/// Draw `t` (per element) and `x_noise`, then build targets.
pub fn build_targets(
    cfg: &ObjectiveConfig,
    x_data: &ArrayViewD<f32>,
    cond: &[Condition],
    rng: &mut impl Rng,
) -> Result<FmTargets> {
    let batch = check_batch(Component::Objective, x_data, cond.len())?;
    let t: Array1<f32> = (0..batch).map(|_| cfg.t_schedule.sample_t(rng)).collect();
    let x_noise = cfg.noise.sample_like(x_data, rng)?;
    targets_from(cfg.scheduler, x_data, &x_noise.view(), &t.view(), cond)
}

/// Score `field` on prepared targets.
pub fn loss<F>(field: &F, targets: &FmTargets) -> Result<FmLoss>
where
    F: VectorField + ?Sized,
{
    let pred = field.velocity(&targets.x_t.view(), &targets.t.view(), &targets.cond)?;
    check_same_shape(Component::Objective, targets.target.shape(), pred.shape())?;

    let batch = targets.batch_size();
    if targets.target.is_empty() {
        return Err(Error::Domain {
            component: Component::Objective,
            msg: format!("cannot score an empty batch of shape {:?}", targets.target.shape()),
        });
    }
    let mut per_sample = Array1::<f32>::zeros(batch);
    let mut total: f64 = 0.0;
    let mut count: usize = 0;
    for (i, (p, u)) in pred
        .axis_iter(Axis(0))
        .zip(targets.target.axis_iter(Axis(0)))
        .enumerate()
    {
        let mut s: f64 = 0.0;
        Zip::from(&p).and(&u).for_each(|&p, &u| {
            let r = (p - u) as f64;
            s += r * r;
        });
        per_sample[i] = (s / p.len() as f64) as f32;
        total += s;
        count += p.len();
    }
    let value = (total / count as f64) as f32;
    if !value.is_finite() {
        return Err(Error::Domain {
            component: Component::Objective,
            msg: format!("loss is not finite ({value})"),
        });
    }
    Ok(FmLoss { value, per_sample })
}

/// Draw targets for a data batch and score `field` on them.
pub fn flow_matching_loss<F>(
    cfg: &ObjectiveConfig,
    field: &F,
    x_data: &ArrayViewD<f32>,
    cond: &[Condition],
    rng: &mut impl Rng,
) -> Result<FmLoss>
where
    F: VectorField + ?Sized,
{
    let targets = build_targets(cfg, x_data, cond, rng)?;
    loss(field, &targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{from_fn, unconditional};
    use ndarray::IxDyn;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn data(batch: usize, dim: usize) -> ArrayD<f32> {
        ArrayD::from_shape_fn(IxDyn(&[batch, dim]), |ix| {
            (((ix[0] * 53 + ix[1] * 19) % 101) as f32 / 101.0) * 2.0 - 1.0
        })
    }

    #[test]
    fn boundary_times_give_finite_targets() {
        let x = data(4, 3);
        let noise = NoiseSampler::Gaussian.sample_seeded(4, &[3], 1).unwrap();
        for s in [Scheduler::Linear, Scheduler::Cosine, Scheduler::Stable] {
            for t in [0.0f32, 1.0] {
                let ts = Array1::from_elem(4, t);
                let tg = targets_from(s, &x.view(), &noise.view(), &ts.view(), &unconditional(4))
                    .unwrap();
                assert!(tg.target.iter().all(|v| v.is_finite()), "{s:?} t={t}");
            }
        }
    }

    #[test]
    fn zero_field_loss_is_mean_squared_target() {
        let x = data(5, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let cfg = ObjectiveConfig::default();
        let tg = build_targets(&cfg, &x.view(), &unconditional(5), &mut rng).unwrap();
        let zero = from_fn(|x, _t, _c| ArrayD::zeros(x.raw_dim()));
        let l = loss(&zero, &tg).unwrap();

        let sum_sq = tg.target.iter().map(|&u| (u as f64) * (u as f64)).sum::<f64>();
        let expected = sum_sq / tg.target.len() as f64;
        assert!((l.value as f64 - expected).abs() < 1e-5);
        assert!((l.per_sample.mean().unwrap() - l.value).abs() < 1e-5);
    }

    #[test]
    fn constant_schedule_uses_the_given_time() {
        let x = data(3, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let cfg = ObjectiveConfig {
            t_schedule: TimestepSchedule::Constant(0.25),
            ..ObjectiveConfig::default()
        };
        let tg = build_targets(&cfg, &x.view(), &unconditional(3), &mut rng).unwrap();
        assert!(tg.t.iter().all(|&t| t == 0.25));

        let bad = ObjectiveConfig {
            t_schedule: TimestepSchedule::Constant(1.5),
            ..ObjectiveConfig::default()
        };
        let err = build_targets(&bad, &x.view(), &unconditional(3), &mut rng).unwrap_err();
        assert!(matches!(err, Error::TimeDomain { t, .. } if t == 1.5));
    }

    #[test]
    fn predictor_shape_mismatch_is_reported_by_the_objective() {
        let x = data(2, 3);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let tg = build_targets(&ObjectiveConfig::default(), &x.view(), &unconditional(2), &mut rng)
            .unwrap();
        let wrong = from_fn(|_x, _t, _c| ArrayD::zeros(IxDyn(&[2, 2])));
        match loss(&wrong, &tg) {
            Err(Error::ShapeMismatch { component, .. }) => {
                assert_eq!(component, Component::Objective)
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn empty_batch_and_label_mismatch_are_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let cfg = ObjectiveConfig::default();
        let empty = ArrayD::<f32>::zeros(IxDyn(&[0, 2]));
        assert!(build_targets(&cfg, &empty.view(), &[], &mut rng).is_err());
        let x = data(3, 2);
        assert!(build_targets(&cfg, &x.view(), &unconditional(2), &mut rng).is_err());
    }

    #[test]
    fn empty_batch_never_scores_as_a_perfect_loss() {
        let empty = ArrayD::<f32>::zeros(IxDyn(&[0, 3]));
        let t = Array1::<f32>::zeros(0);
        let err = targets_from(Scheduler::Linear, &empty.view(), &empty.view(), &t.view(), &[])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Domain {
                component: Component::Objective,
                ..
            }
        ));

        // Hand-built empty targets are rejected by the loss itself.
        let targets = FmTargets {
            t: t.clone(),
            x_noise: empty.clone(),
            x_t: empty.clone(),
            target: empty,
            cond: Vec::new(),
        };
        let zero = from_fn(|x, _t, _c| ArrayD::zeros(x.raw_dim()));
        assert!(matches!(
            loss(&zero, &targets),
            Err(Error::Domain {
                component: Component::Objective,
                ..
            })
        ));
    }

    #[test]
    fn ushaped_has_more_mass_near_boundaries_than_uniform() {
        // U-shaped schedules emphasize boundary timesteps.
        // This is a cheap regression guard on the distributional shape.
        let mut rng = ChaCha8Rng::seed_from_u64(123);
        let n = 50_000usize;
        let eps = 0.05f32;

        let mut near_u = 0usize;
        let mut near_uni = 0usize;

        for _ in 0..n {
            let tu = TimestepSchedule::UShaped.sample_t(&mut rng);
            let t0 = TimestepSchedule::Uniform.sample_t(&mut rng);
            if tu <= eps || tu >= 1.0 - eps {
                near_u += 1;
            }
            if t0 <= eps || t0 >= 1.0 - eps {
                near_uni += 1;
            }
        }

        let fu = near_u as f32 / n as f32;
        let f0 = near_uni as f32 / n as f32;

        // Uniform has ~2*eps mass in the boundary region; U-shaped should be noticeably higher.
        assert!(
            fu > f0 + 0.10,
            "expected UShaped to concentrate near boundaries: fu={fu:.3} f0={f0:.3}"
        );
    }
}
