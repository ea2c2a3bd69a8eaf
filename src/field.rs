//! The vector-field predictor seam.
//!
//! The network that predicts velocities is an external collaborator. Everything in this crate
//! talks to it through [`VectorField`], evaluated on a whole batch at once:
//!
//! - `x`: states, batch on axis 0 (any trailing shape)
//! - `t`: one time per batch element
//! - `cond`: one [`Condition`] per batch element
//!
//! Evaluation takes `&self`: a field is read-only while it is being integrated.

use crate::{Component, Error, Result};
use ndarray::{ArrayD, ArrayView1, ArrayViewD};
use serde::Deserialize;

/// A per-sample conditioning label.
///
/// `Unconditional` is the reserved sentinel used for CFG label dropout. For predictors with a
/// token table of `num_classes + 1` entries it maps to the last token (see [`Condition::token`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Class(u32),
    Unconditional,
}

impl Condition {
    #[inline]
    pub fn is_unconditional(self) -> bool {
        matches!(self, Condition::Unconditional)
    }

    /// Token index in a table of `num_classes + 1` entries (the sentinel is `num_classes`).
    pub fn token(self, num_classes: usize) -> Result<usize> {
        match self {
            Condition::Unconditional => Ok(num_classes),
            Condition::Class(c) if (c as usize) < num_classes => Ok(c as usize),
            Condition::Class(c) => Err(Error::Domain {
                component: Component::Field,
                msg: format!("class label {c} out of range for {num_classes} classes"),
            }),
        }
    }
}

/// `n` copies of the unconditional sentinel.
pub fn unconditional(n: usize) -> Vec<Condition> {
    vec![Condition::Unconditional; n]
}

/// Labels `0..` mapped to `Condition::Class`.
pub fn classes(labels: &[u32]) -> Vec<Condition> {
    labels.iter().map(|&c| Condition::Class(c)).collect()
}

/// A (batched) velocity predictor `v(x, t; c)`.
pub trait VectorField {
    /// Predict velocities for a batch. The output must have the same shape as `x`.
    fn velocity(
        &self,
        x: &ArrayViewD<f32>,
        t: &ArrayView1<f32>,
        cond: &[Condition],
    ) -> Result<ArrayD<f32>>;

    /// Predictor evaluations consumed by one [`VectorField::velocity`] call.
    ///
    /// Used for NFE accounting; guided fields report twice their inner field.
    fn evals_per_call(&self) -> usize {
        1
    }
}

/// Adapter turning a plain function/closure into a [`VectorField`].
#[derive(Debug, Clone, Copy)]
pub struct FnField<F>(pub F);

/// Wrap a closure `|x, t, cond| -> velocity` as a [`VectorField`].
///
/// Going through this constructor (rather than naming `FnField` directly) lets the compiler
/// infer the closure's higher-ranked argument lifetimes.
pub fn from_fn<F>(f: F) -> FnField<F>
where
    F: Fn(&ArrayViewD<f32>, &ArrayView1<f32>, &[Condition]) -> ArrayD<f32>,
{
    FnField(f)
}

impl<F> VectorField for FnField<F>
where
    F: Fn(&ArrayViewD<f32>, &ArrayView1<f32>, &[Condition]) -> ArrayD<f32>,
{
    fn velocity(
        &self,
        x: &ArrayViewD<f32>,
        t: &ArrayView1<f32>,
        cond: &[Condition],
    ) -> Result<ArrayD<f32>> {
        Ok((self.0)(x, t, cond))
    }
}

pub(crate) fn check_same_shape(
    component: Component,
    expected: &[usize],
    got: &[usize],
) -> Result<()> {
    if expected != got {
        return Err(Error::ShapeMismatch {
            component,
            expected: expected.to_vec(),
            got: got.to_vec(),
        });
    }
    Ok(())
}

/// A batched state needs axis 0, and `per_sample` must have one entry per batch element.
pub(crate) fn check_batch(
    component: Component,
    x: &ArrayViewD<f32>,
    per_sample: usize,
) -> Result<usize> {
    if x.ndim() == 0 {
        return Err(Error::Domain {
            component,
            msg: "states need a leading batch axis".into(),
        });
    }
    let batch = x.shape()[0];
    check_same_shape(component, &[batch], &[per_sample])?;
    Ok(batch)
}

/// Two batched states of identical shape, with one `t` (or label) per element.
pub(crate) fn check_batch_pair(
    component: Component,
    a: &ArrayViewD<f32>,
    b: &ArrayViewD<f32>,
    per_sample: usize,
) -> Result<usize> {
    let batch = check_batch(component, a, per_sample)?;
    check_same_shape(component, a.shape(), b.shape())?;
    Ok(batch)
}
