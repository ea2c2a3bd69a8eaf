//! Fixed-step ODE integrators for sampling flow models.
//!
//! Sampling integrates
//! \[
//! \frac{dx}{dt} = v_\theta(x,t;c), \qquad t: 0 \to 1,
//! \]
//! on a uniform grid \(t_k = k/N\).
//!
//! We keep this module tiny and deterministic: no adaptive stepping, no hidden tolerances, no
//! randomness. Every stage velocity and every intermediate state is checked for non-finite
//! values; a failure aborts the whole call with [`Error::Divergence`] and no partial result.

use core::ops::ControlFlow;

use crate::field::{check_batch, check_same_shape, Condition, VectorField};
use crate::{Component, Error, Result};
use ndarray::{Array1, ArrayD, ArrayViewD};
use serde::Deserialize;

/// Fixed-step ODE method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OdeMethod {
    /// Explicit Euler (1st order).
    #[default]
    Euler,
    /// Heun / explicit trapezoid / RK2 (2nd order).
    Heun,
    /// Classical Runge–Kutta (4th order).
    Rk4,
}

impl OdeMethod {
    /// Field evaluations per step.
    pub fn stages(self) -> usize {
        match self {
            OdeMethod::Euler => 1,
            OdeMethod::Heun => 2,
            OdeMethod::Rk4 => 4,
        }
    }
}

/// Solver settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SolverConfig {
    #[serde(default)]
    pub method: OdeMethod,
    /// Number of equal-width steps over `[0,1]` (must be >= 1).
    #[serde(default = "default_steps")]
    pub steps: usize,
    /// Keep every intermediate state in [`Solution::trajectory`].
    #[serde(default)]
    pub record_trajectory: bool,
}

fn default_steps() -> usize {
    50
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            method: OdeMethod::Euler,
            steps: default_steps(),
            record_trajectory: false,
        }
    }
}

impl SolverConfig {
    pub fn new(method: OdeMethod, steps: usize) -> Self {
        Self {
            method,
            steps,
            record_trajectory: false,
        }
    }

    pub fn with_trajectory(mut self) -> Self {
        self.record_trajectory = true;
        self
    }
}

/// Result of one integration.
#[derive(Debug, Clone)]
pub struct Solution {
    /// State at `t = 1`.
    pub sample: ArrayD<f32>,
    /// `steps + 1` states (starting with `x0`) if requested, else empty.
    pub trajectory: Vec<ArrayD<f32>>,
    /// Predictor evaluations, counting [`VectorField::evals_per_call`] per call.
    pub nfe: usize,
}

struct Evaluator<'a, F: ?Sized> {
    field: &'a F,
    cond: &'a [Condition],
    batch: usize,
    per_call: usize,
    nfe: usize,
}

impl<F: VectorField + ?Sized> Evaluator<'_, F> {
    fn eval(&mut self, x: &ArrayD<f32>, t: f32, step: usize) -> Result<ArrayD<f32>> {
        let ts = Array1::from_elem(self.batch, t);
        let v = self.field.velocity(&x.view(), &ts.view(), self.cond)?;
        self.nfe += self.per_call;
        check_same_shape(Component::Solver, x.shape(), v.shape())?;
        if v.iter().any(|x| !x.is_finite()) {
            return Err(Error::Divergence { step, t });
        }
        Ok(v)
    }
}

fn offset(x: &ArrayD<f32>, h: f32, v: &ArrayD<f32>) -> ArrayD<f32> {
    let mut out = x.clone();
    out.scaled_add(h, v);
    out
}

/// Integrate `field` from `t = 0` to `t = 1` starting at `x0` (batch on axis 0).
///
/// `cond` must hold one condition per batch element; use
/// [`crate::field::unconditional`] for unconditional fields.
pub fn integrate<F>(
    cfg: &SolverConfig,
    field: &F,
    x0: &ArrayViewD<f32>,
    cond: &[Condition],
) -> Result<Solution>
where
    F: VectorField + ?Sized,
{
    integrate_observed(cfg, field, x0, cond, |_, _| ControlFlow::Continue(()))
}

/// Like [`integrate`], calling `observe(step, state)` after every completed step.
///
/// Returning `ControlFlow::Break(())` stops integration between steps; the call then returns
/// [`Error::Interrupted`] with the number of completed steps. Each step produces a fresh state,
/// so stopping never leaves a half-updated value behind.
pub fn integrate_observed<F, O>(
    cfg: &SolverConfig,
    field: &F,
    x0: &ArrayViewD<f32>,
    cond: &[Condition],
    mut observe: O,
) -> Result<Solution>
where
    F: VectorField + ?Sized,
    O: FnMut(usize, &ArrayViewD<f32>) -> ControlFlow<()>,
{
    if cfg.steps == 0 {
        return Err(Error::Domain {
            component: Component::Solver,
            msg: format!("steps must be >= 1, got {}", cfg.steps),
        });
    }
    let batch = check_batch(Component::Solver, x0, cond.len())?;
    if x0.iter().any(|x| !x.is_finite()) {
        return Err(Error::Divergence { step: 0, t: 0.0 });
    }

    let n = cfg.steps;
    let dt = 1.0f32 / n as f32;
    let mut ev = Evaluator {
        field,
        cond,
        batch,
        per_call: field.evals_per_call(),
        nfe: 0,
    };

    let mut x = x0.to_owned();
    let mut trajectory = Vec::new();
    if cfg.record_trajectory {
        trajectory.reserve(n + 1);
        trajectory.push(x.clone());
    }

    for k in 0..n {
        let t0 = k as f32 / n as f32;
        let t1 = (k + 1) as f32 / n as f32;

        x = match cfg.method {
            OdeMethod::Euler => {
                let v = ev.eval(&x, t0, k)?;
                offset(&x, dt, &v)
            }
            OdeMethod::Heun => {
                let v0 = ev.eval(&x, t0, k)?;
                // predictor
                let x_pred = offset(&x, dt, &v0);
                // corrector
                let v1 = ev.eval(&x_pred, t1, k)?;
                let mut next = offset(&x, 0.5 * dt, &v0);
                next.scaled_add(0.5 * dt, &v1);
                next
            }
            OdeMethod::Rk4 => {
                let t_mid = (2 * k + 1) as f32 / (2 * n) as f32;
                let k1 = ev.eval(&x, t0, k)?;
                let k2 = ev.eval(&offset(&x, 0.5 * dt, &k1), t_mid, k)?;
                let k3 = ev.eval(&offset(&x, 0.5 * dt, &k2), t_mid, k)?;
                let k4 = ev.eval(&offset(&x, dt, &k3), t1, k)?;
                let mut next = offset(&x, dt / 6.0, &k1);
                next.scaled_add(dt / 3.0, &k2);
                next.scaled_add(dt / 3.0, &k3);
                next.scaled_add(dt / 6.0, &k4);
                next
            }
        };

        if x.iter().any(|x| !x.is_finite()) {
            return Err(Error::Divergence { step: k, t: t1 });
        }
        if cfg.record_trajectory {
            trajectory.push(x.clone());
        }
        if observe(k, &x.view()).is_break() {
            return Err(Error::Interrupted { step: k + 1 });
        }
    }

    tracing::debug!(
        method = ?cfg.method,
        steps = n,
        batch,
        nfe = ev.nfe,
        "integrated flow"
    );

    Ok(Solution {
        sample: x,
        trajectory,
        nfe: ev.nfe,
    })
}
