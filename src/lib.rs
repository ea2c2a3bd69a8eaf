//! # voxflow
//!
//! Flow matching as a library primitive: probability paths, noise, fixed-step ODE sampling,
//! and classifier-free guidance (CFG).
//!
//! This crate is intentionally small:
//!
//! - it implements the **training objective** and **sampling** for flow-matching models,
//! - the vector-field network is an external collaborator behind the [`field::VectorField`] trait,
//! - it does not provide a CLI, data loading, or checkpointing.
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: every stochastic function takes an RNG or a `seed`.
//! - **No hidden normalization or clamping**: times outside `[0,1]` are errors, not clamped.
//! - **Backend-agnostic by default**: states are `ndarray::ArrayD<f32>` with the batch on axis 0.
//!   The `burn` training backend is feature-gated.
//!
//! ## The objective
//!
//! Sample \(t\), noise \(x_0\), and data \(x_1\). With path coefficients
//! \(\alpha(t), \beta(t)\) from a [`scheduler::Scheduler`]:
//!
//! - \(x_t = \alpha(t) x_1 + \beta(t) x_0\),
//! - \(u_t = \alpha'(t) x_1 + \beta'(t) x_0\),
//! - regress \(v_\theta(x_t, t; c)\) toward \(u_t\) in mean squared error.
//!
//! Generation integrates \(dx/dt = v_\theta(x, t; c)\) from \(t=0\) to \(t=1\). With guidance
//! scale \(s\) the integrated field is \(v_\varnothing + s (v_c - v_\varnothing)\).
//!
//! ## References
//!
//! - Lipman et al., *Flow Matching for Generative Modeling* (arXiv:2210.02747).
//! - Ho & Salimans, *Classifier-Free Diffusion Guidance* (arXiv:2207.12598).
//!
//! ## Module map
//!
//! - `scheduler`: path coefficients and their time derivatives (`Linear`, `Cosine`, `Stable`)
//! - `sampler`: reference noise (`Gaussian`, `Uniform`)
//! - `field`: the predictor trait and the condition type
//! - `ode`: fixed-step integrators (`Euler`, `Heun`, `Rk4`) with divergence checks
//! - `objective`: flow-matching targets and loss
//! - `guidance`: CFG dropout (training) and guided velocity (generation)
//! - `linear`: a trainable affine baseline field
//! - `train` / `generate`: end-to-end loops on top of the above
//! - `config`: TOML-loadable configuration surface
//! - `metrics`, `toy`: diagnostics and synthetic data

pub mod config;
pub mod field;
pub mod generate;
pub mod guidance;
pub mod linear;
pub mod metrics;
pub mod objective;
pub mod ode;
pub mod sampler;
pub mod scheduler;
pub mod toy;
pub mod train;

#[cfg(feature = "burn")]
pub mod burn_field;

use core::fmt;

/// Which part of the core raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Scheduler,
    Sampler,
    Solver,
    Objective,
    Guidance,
    Field,
    Config,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::Scheduler => "scheduler",
            Component::Sampler => "sampler",
            Component::Solver => "solver",
            Component::Objective => "objective",
            Component::Guidance => "guidance",
            Component::Field => "field",
            Component::Config => "config",
        };
        f.write_str(s)
    }
}

/// voxflow error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{component}: time {t} is outside [0, 1]")]
    TimeDomain { component: Component, t: f32 },
    #[error("solver: non-finite value at step {step} (t={t})")]
    Divergence { step: usize, t: f32 },
    #[error("{component}: shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        component: Component,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("{component}: invalid configuration: {msg}")]
    Config {
        component: Component,
        msg: String,
    },
    #[error("{component}: domain error: {msg}")]
    Domain {
        component: Component,
        msg: String,
    },
    #[error("solver: interrupted after step {step}")]
    Interrupted { step: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
