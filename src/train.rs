//! Minibatch training of the affine baseline with CFG label dropout.
//!
//! Each step:
//! 1. sample a minibatch (with replacement),
//! 2. drop labels to the unconditional sentinel with probability `cfg_prob`,
//! 3. rebuild flow-matching targets (fresh `t` and noise),
//! 4. take one SGD step.
//!
//! Everything random flows from `TrainConfig::seed`, so a run is reproducible end to end.

use crate::field::{check_batch, Condition};
use crate::guidance::ClassifierFreeGuidance;
use crate::linear::LinearField;
use crate::objective::{build_targets, loss, ObjectiveConfig};
use crate::{Component, Error, Result};
use ndarray::{ArrayViewD, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

/// Optimizer and loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_lr")]
    pub lr: f32,
    #[serde(default = "default_train_steps")]
    pub steps: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Emit a `tracing::info!` line every `log_interval` steps (`0` disables).
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
}

fn default_lr() -> f32 {
    5e-2
}

fn default_train_steps() -> usize {
    2_000
}

fn default_batch_size() -> usize {
    64
}

fn default_seed() -> u64 {
    123
}

fn default_log_interval() -> usize {
    200
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            steps: default_train_steps(),
            batch_size: default_batch_size(),
            seed: default_seed(),
            log_interval: default_log_interval(),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(Error::Config {
                component: Component::Config,
                msg: format!("lr must be positive and finite, got {}", self.lr),
            });
        }
        if self.steps == 0 {
            return Err(Error::Config {
                component: Component::Config,
                msg: format!("train steps must be >= 1, got {}", self.steps),
            });
        }
        if self.batch_size == 0 {
            return Err(Error::Config {
                component: Component::Config,
                msg: format!("batch_size must be >= 1, got {}", self.batch_size),
            });
        }
        Ok(())
    }
}

/// Output of [`train_linear_field`].
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub field: LinearField,
    /// Dropout bookkeeping, used to diagnose guided generation later.
    pub guidance: ClassifierFreeGuidance,
    /// Minibatch loss before each SGD step.
    pub losses: Vec<f32>,
}

/// One training step on an already-sampled minibatch. Returns the pre-update loss.
pub fn train_step(
    field: &mut LinearField,
    guidance: &mut ClassifierFreeGuidance,
    objective: &ObjectiveConfig,
    x_data: &ArrayViewD<f32>,
    labels: &[Condition],
    lr: f32,
    rng: &mut impl Rng,
) -> Result<f32> {
    let cond = guidance.apply_dropout(labels, rng)?;
    let targets = build_targets(objective, x_data, &cond, rng)?;
    let l = loss(&*field, &targets)?;
    field.sgd_step(&targets, lr)?;
    Ok(l.value)
}

/// Train a [`LinearField`] on `data` (`[n, ...state_shape]`) with one label per row.
pub fn train_linear_field(
    data: &ArrayViewD<f32>,
    labels: &[Condition],
    num_classes: usize,
    objective: &ObjectiveConfig,
    cfg_prob: f32,
    train: &TrainConfig,
) -> Result<TrainReport> {
    train.validate()?;
    let n = check_batch(Component::Objective, data, labels.len())?;
    if n == 0 {
        return Err(Error::Domain {
            component: Component::Objective,
            msg: "training data must be non-empty".into(),
        });
    }
    // Reject bad labels once, before any step runs.
    for c in labels {
        c.token(num_classes)?;
    }

    let mut guidance = ClassifierFreeGuidance::new(cfg_prob)?;
    let mut field = LinearField::new_zeros(&data.shape()[1..], num_classes);
    let mut rng = ChaCha8Rng::seed_from_u64(train.seed);
    let mut losses = Vec::with_capacity(train.steps);

    for step in 0..train.steps {
        let idx: Vec<usize> = (0..train.batch_size)
            .map(|_| rng.random_range(0..n))
            .collect();
        let xb = data.select(Axis(0), &idx);
        let yb: Vec<Condition> = idx.iter().map(|&i| labels[i]).collect();

        let l = train_step(
            &mut field,
            &mut guidance,
            objective,
            &xb.view(),
            &yb,
            train.lr,
            &mut rng,
        )?;
        losses.push(l);

        if train.log_interval > 0 && (step + 1) % train.log_interval == 0 {
            tracing::info!(
                step = step + 1,
                loss = l,
                unconditional_seen = guidance.unconditional_seen(),
                "train"
            );
        }
    }

    Ok(TrainReport {
        field,
        guidance,
        losses,
    })
}
