//! Classifier-free guidance (CFG).
//!
//! Two modes share one [`ClassifierFreeGuidance`] value:
//!
//! - **training**: [`ClassifierFreeGuidance::apply_dropout`] replaces each label with
//!   [`Condition::Unconditional`] with probability `cfg_prob`, independently per element and per
//!   step, using the caller's RNG;
//! - **generation**: [`ClassifierFreeGuidance::guide`] wraps a field so that every evaluation is
//!   \[
//!   v = v_\varnothing + s\,(v_c - v_\varnothing).
//!   \]
//!
//! `s = 0` is unconditional generation, `s = 1` is plain conditional generation, and `s > 1`
//! extrapolates past the conditional prediction (intended, not an error). A guided field costs
//! two predictor calls per evaluation and reports that through
//! [`VectorField::evals_per_call`].

use core::fmt;

use crate::field::{check_same_shape, Condition, VectorField};
use crate::{Component, Error, Result};
use ndarray::{ArrayD, ArrayView1, ArrayViewD, Zip};
use rand::Rng;
use serde::Deserialize;

/// CFG settings as they appear in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CfgConfig {
    /// Probability in `[0,1]` of dropping a label during training.
    #[serde(default = "default_cfg_prob")]
    pub cfg_prob: f32,
    /// Non-negative guidance scale used at generation time.
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f32,
}

pub(crate) fn default_cfg_prob() -> f32 {
    0.1
}

pub(crate) fn default_guidance_scale() -> f32 {
    3.0
}

impl Default for CfgConfig {
    fn default() -> Self {
        Self {
            cfg_prob: default_cfg_prob(),
            guidance_scale: default_guidance_scale(),
        }
    }
}

impl CfgConfig {
    pub fn validate(&self) -> Result<()> {
        validate_cfg_prob(self.cfg_prob)?;
        validate_guidance_scale(self.guidance_scale)
    }
}

pub fn validate_cfg_prob(p: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&p) {
        return Err(Error::Config {
            component: Component::Guidance,
            msg: format!("cfg_prob must be in [0, 1], got {p}"),
        });
    }
    Ok(())
}

pub fn validate_guidance_scale(s: f32) -> Result<()> {
    if !s.is_finite() || s < 0.0 {
        return Err(Error::Config {
            component: Component::Guidance,
            msg: format!("guidance_scale must be finite and >= 0, got {s}"),
        });
    }
    Ok(())
}

/// Replace each condition with the unconditional sentinel with probability `cfg_prob`.
///
/// Exactly one uniform draw is consumed per element, whatever `cfg_prob` is, so the RNG stream
/// does not depend on the dropout rate.
pub fn drop_conditions(
    cond: &[Condition],
    cfg_prob: f32,
    rng: &mut impl Rng,
) -> Result<Vec<Condition>> {
    validate_cfg_prob(cfg_prob)?;
    Ok(cond
        .iter()
        .map(|&c| {
            let u: f32 = rng.random();
            if u < cfg_prob {
                Condition::Unconditional
            } else {
                c
            }
        })
        .collect())
}

/// Something a caller should know before trusting guided samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuidanceDiagnostic {
    /// Guidance was requested, but training never presented the unconditional sentinel.
    UnconditionalBranchUntrained {
        guidance_scale: f32,
        cfg_prob: f32,
        labels_seen: u64,
    },
}

impl fmt::Display for GuidanceDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuidanceDiagnostic::UnconditionalBranchUntrained {
                guidance_scale,
                cfg_prob,
                labels_seen,
            } => write!(
                f,
                "guidance: scale {guidance_scale} requested but the unconditional branch was never \
                 trained (cfg_prob={cfg_prob}, labels seen={labels_seen})"
            ),
        }
    }
}

/// CFG state: the dropout rate plus a record of what training actually exercised.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierFreeGuidance {
    cfg_prob: f32,
    labels_seen: u64,
    dropped: u64,
}

impl ClassifierFreeGuidance {
    pub fn new(cfg_prob: f32) -> Result<Self> {
        validate_cfg_prob(cfg_prob)?;
        Ok(Self {
            cfg_prob,
            labels_seen: 0,
            dropped: 0,
        })
    }

    pub fn cfg_prob(&self) -> f32 {
        self.cfg_prob
    }

    /// Labels passed through [`Self::apply_dropout`] so far.
    pub fn labels_seen(&self) -> u64 {
        self.labels_seen
    }

    /// Unconditional sentinels presented to training so far (including labels that were
    /// already unconditional).
    pub fn unconditional_seen(&self) -> u64 {
        self.dropped
    }

    pub fn unconditional_trained(&self) -> bool {
        self.dropped > 0
    }

    /// Training mode: per-element Bernoulli(`cfg_prob`) label dropout.
    pub fn apply_dropout(
        &mut self,
        cond: &[Condition],
        rng: &mut impl Rng,
    ) -> Result<Vec<Condition>> {
        let out = drop_conditions(cond, self.cfg_prob, rng)?;
        self.labels_seen += out.len() as u64;
        self.dropped += out.iter().filter(|c| c.is_unconditional()).count() as u64;
        Ok(out)
    }

    /// What would go wrong with guided generation at `guidance_scale`, if anything.
    pub fn diagnose(&self, guidance_scale: f32) -> Option<GuidanceDiagnostic> {
        if guidance_scale > 0.0 && !self.unconditional_trained() {
            Some(GuidanceDiagnostic::UnconditionalBranchUntrained {
                guidance_scale,
                cfg_prob: self.cfg_prob,
                labels_seen: self.labels_seen,
            })
        } else {
            None
        }
    }

    /// Generation mode: wrap `field` with guidance scale `guidance_scale`.
    ///
    /// An invalid scale is a [`Error::Config`]. An untrained unconditional branch is only
    /// reported (`tracing::warn!` + [`Self::diagnose`]); generation still proceeds.
    pub fn guide<'f, F>(&self, field: &'f F, guidance_scale: f32) -> Result<GuidedField<'f, F>>
    where
        F: VectorField + ?Sized,
    {
        let guided = GuidedField::new(field, guidance_scale)?;
        if let Some(diag) = self.diagnose(guidance_scale) {
            tracing::warn!(
                guidance_scale,
                cfg_prob = self.cfg_prob,
                labels_seen = self.labels_seen,
                "{diag}"
            );
        }
        Ok(guided)
    }
}

/// A field evaluated as `v_uncond + scale * (v_cond - v_uncond)`.
#[derive(Debug)]
pub struct GuidedField<'f, F: ?Sized> {
    field: &'f F,
    scale: f32,
}

impl<'f, F: VectorField + ?Sized> GuidedField<'f, F> {
    pub fn new(field: &'f F, scale: f32) -> Result<Self> {
        validate_guidance_scale(scale)?;
        Ok(Self { field, scale })
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }
}

impl<F: VectorField + ?Sized> VectorField for GuidedField<'_, F> {
    fn velocity(
        &self,
        x: &ArrayViewD<f32>,
        t: &ArrayView1<f32>,
        cond: &[Condition],
    ) -> Result<ArrayD<f32>> {
        let v_cond = self.field.velocity(x, t, cond)?;
        check_same_shape(Component::Guidance, x.shape(), v_cond.shape())?;

        let null = vec![Condition::Unconditional; cond.len()];
        let mut v = self.field.velocity(x, t, &null)?;
        check_same_shape(Component::Guidance, x.shape(), v.shape())?;

        let s = self.scale;
        Zip::from(&mut v)
            .and(&v_cond)
            .for_each(|u, &c| *u += s * (c - *u));
        Ok(v)
    }

    fn evals_per_call(&self) -> usize {
        2 * self.field.evals_per_call()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{classes, from_fn};
    use ndarray::{Array1, IxDyn};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// `v = (label + 1)` for classes, `-1` for the sentinel, broadcast over the state.
    fn label_field() -> impl VectorField {
        from_fn(|x, _t, cond| {
            let mut out = ArrayD::<f32>::zeros(x.raw_dim());
            for (i, mut row) in out.outer_iter_mut().enumerate() {
                let v = match cond[i] {
                    Condition::Class(c) => c as f32 + 1.0,
                    Condition::Unconditional => -1.0,
                };
                row.fill(v);
            }
            out
        })
    }

    #[test]
    fn guided_combination_matches_formula() {
        let field = label_field();
        let x = ArrayD::<f32>::zeros(IxDyn(&[2, 3]));
        let t = Array1::<f32>::zeros(2);
        let cond = classes(&[0, 4]);
        for s in [0.0f32, 0.5, 1.0, 3.0] {
            let g = GuidedField::new(&field, s).unwrap();
            let v = g.velocity(&x.view(), &t.view(), &cond).unwrap();
            for (i, c) in [1.0f32, 5.0].iter().enumerate() {
                let expected = -1.0 + s * (c + 1.0);
                let row = v.outer_iter().nth(i).unwrap();
                assert!(row.iter().all(|&v| (v - expected).abs() < 1e-6));
            }
            assert_eq!(g.evals_per_call(), 2);
        }
    }

    #[test]
    fn invalid_settings_are_config_errors() {
        let field = label_field();
        for s in [-0.1f32, f32::NAN, f32::INFINITY] {
            assert!(matches!(
                GuidedField::new(&field, s),
                Err(Error::Config { component: Component::Guidance, .. })
            ));
        }
        for p in [-0.01f32, 1.01, f32::NAN] {
            assert!(ClassifierFreeGuidance::new(p).is_err());
            assert!(CfgConfig { cfg_prob: p, guidance_scale: 1.0 }.validate().is_err());
        }
    }

    #[test]
    fn config_errors_name_the_offending_value() {
        let field = label_field();
        let msg = GuidedField::new(&field, -2.0).err().unwrap().to_string();
        assert!(msg.contains("guidance_scale") && msg.contains("-2"), "{msg}");
        let msg = ClassifierFreeGuidance::new(1.5).unwrap_err().to_string();
        assert!(msg.contains("cfg_prob") && msg.contains("1.5"), "{msg}");
    }

    #[test]
    fn untrained_unconditional_branch_is_diagnosed_not_fatal() {
        let mut cfg = ClassifierFreeGuidance::new(0.0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let out = cfg.apply_dropout(&classes(&[0, 1, 2, 3]), &mut rng).unwrap();
        assert!(out.iter().all(|c| !c.is_unconditional()));
        assert_eq!(cfg.labels_seen(), 4);
        assert!(!cfg.unconditional_trained());

        assert!(matches!(
            cfg.diagnose(2.0),
            Some(GuidanceDiagnostic::UnconditionalBranchUntrained { labels_seen: 4, .. })
        ));
        assert_eq!(cfg.diagnose(0.0), None);

        let field = label_field();
        assert!(cfg.guide(&field, 2.0).is_ok());
    }

    #[test]
    fn dropout_extremes() {
        let labels = classes(&[1; 64]);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let all = drop_conditions(&labels, 1.0, &mut rng).unwrap();
        assert!(all.iter().all(|c| c.is_unconditional()));
        let none = drop_conditions(&labels, 0.0, &mut rng).unwrap();
        assert_eq!(none, labels);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_dropout_is_seeded_and_matches_the_free_function(
            seed in any::<u64>(),
            p in 0.0f32..=1.0f32,
            n in 1usize..200,
        ) {
            let labels: Vec<Condition> = (0..n).map(|i| Condition::Class((i % 7) as u32)).collect();
            let mut cfg = ClassifierFreeGuidance::new(p).unwrap();
            let a = cfg.apply_dropout(&labels, &mut ChaCha8Rng::seed_from_u64(seed)).unwrap();
            let b = drop_conditions(&labels, p, &mut ChaCha8Rng::seed_from_u64(seed)).unwrap();
            prop_assert_eq!(&a, &b);
            // Kept labels are untouched.
            for (x, y) in a.iter().zip(labels.iter()) {
                prop_assert!(x.is_unconditional() || x == y);
            }
            let dropped = a.iter().filter(|c| c.is_unconditional()).count() as u64;
            prop_assert_eq!(cfg.unconditional_seen(), dropped);
        }

        #[test]
        fn prop_dropout_rate_is_close_to_cfg_prob(
            seed in any::<u64>(),
            p in 0.05f32..0.95f32,
        ) {
            let labels = classes(&[0; 4_000]);
            let out = drop_conditions(&labels, p, &mut ChaCha8Rng::seed_from_u64(seed)).unwrap();
            let rate = out.iter().filter(|c| c.is_unconditional()).count() as f32 / 4_000.0;
            // ~5 standard deviations of a Binomial(4000, p) proportion.
            prop_assert!((rate - p).abs() < 0.04, "rate={rate} p={p}");
        }
    }
}
