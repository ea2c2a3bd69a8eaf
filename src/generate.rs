//! Sampling entry points: draw noise, then integrate.
//!
//! The noise for a call is fully determined by `(noise, batch, state_shape, seed)`:
//! `NoiseSampler::sample_seeded(cond.len(), state_shape, seed)` reproduces the start states.

use crate::field::{Condition, VectorField};
use crate::guidance::ClassifierFreeGuidance;
use crate::ode::{integrate, Solution, SolverConfig};
use crate::sampler::NoiseSampler;
use crate::Result;

/// Generate one sample per entry of `cond` (use [`crate::field::unconditional`] for an
/// unconditional batch).
pub fn generate<F>(
    field: &F,
    noise: NoiseSampler,
    state_shape: &[usize],
    cond: &[Condition],
    solver: &SolverConfig,
    seed: u64,
) -> Result<Solution>
where
    F: VectorField + ?Sized,
{
    let x0 = noise.sample_seeded(cond.len(), state_shape, seed)?;
    let sol = integrate(solver, field, &x0.view(), cond)?;
    tracing::debug!(batch = cond.len(), nfe = sol.nfe, seed, "generated");
    Ok(sol)
}

/// Like [`generate`], integrating the guided field `v_uncond + scale * (v_cond - v_uncond)`.
///
/// `guidance` is the state returned by training; if its unconditional branch was never trained
/// a warning is logged and generation proceeds.
#[allow(clippy::too_many_arguments)]
pub fn generate_guided<F>(
    field: &F,
    guidance: &ClassifierFreeGuidance,
    guidance_scale: f32,
    noise: NoiseSampler,
    state_shape: &[usize],
    cond: &[Condition],
    solver: &SolverConfig,
    seed: u64,
) -> Result<Solution>
where
    F: VectorField + ?Sized,
{
    let guided = guidance.guide(field, guidance_scale)?;
    generate(&guided, noise, state_shape, cond, solver, seed)
}
