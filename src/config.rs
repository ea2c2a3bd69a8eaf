//! Configuration surface, loadable from TOML.
//!
//! ```toml
//! num_classes = 2
//!
//! [objective]
//! scheduler = "cosine"
//! noise = "gaussian"
//! t_schedule = "ushaped"
//!
//! [solver]
//! method = "rk4"
//! steps = 20
//!
//! [guidance]
//! cfg_prob = 0.1
//! guidance_scale = 3.0
//!
//! [train]
//! lr = 0.05
//! steps = 2000
//! ```
//!
//! Every field has a default, so an empty document is a valid configuration.

use crate::guidance::CfgConfig;
use crate::objective::{ObjectiveConfig, TimestepSchedule};
use crate::ode::SolverConfig;
use crate::train::TrainConfig;
use crate::{Component, Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Deserialize)]
pub struct FlowConfig {
    /// Number of real classes (the unconditional token is extra).
    #[serde(default)]
    pub num_classes: usize,

    #[serde(default)]
    pub objective: ObjectiveConfig,

    #[serde(default)]
    pub solver: SolverConfig,

    #[serde(default)]
    pub guidance: CfgConfig,

    #[serde(default)]
    pub train: TrainConfig,
}

impl FlowConfig {
    /// Hard violations are errors; legal-but-suspicious settings are logged.
    pub fn validate(&self) -> Result<()> {
        if let TimestepSchedule::Constant(t) = self.objective.t_schedule {
            if !(0.0..=1.0).contains(&t) {
                return Err(Error::Config {
                    component: Component::Objective,
                    msg: format!("constant t must be in [0, 1], got {t}"),
                });
            }
        }
        if self.solver.steps == 0 {
            return Err(Error::Config {
                component: Component::Solver,
                msg: format!("steps must be >= 1, got {}", self.solver.steps),
            });
        }
        self.guidance.validate()?;
        self.train.validate()?;

        if self.guidance.guidance_scale > 0.0 && self.guidance.cfg_prob == 0.0 {
            tracing::warn!(
                guidance_scale = self.guidance.guidance_scale,
                "cfg_prob = 0 never trains the unconditional branch; \
                 guided sampling will use an untrained prediction"
            );
        }
        if self.guidance.guidance_scale > 0.0 && self.num_classes == 0 {
            tracing::warn!(
                guidance_scale = self.guidance.guidance_scale,
                "guidance requested with num_classes = 0; \
                 conditional and unconditional predictions coincide"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ode::OdeMethod;
    use crate::sampler::NoiseSampler;
    use crate::scheduler::Scheduler;

    #[test]
    fn test_default_values() {
        let cfg = FlowConfig::default();
        assert_eq!(cfg.objective.scheduler, Scheduler::Linear);
        assert_eq!(cfg.objective.noise, NoiseSampler::Gaussian);
        assert_eq!(cfg.objective.t_schedule, TimestepSchedule::Uniform);
        assert_eq!(cfg.solver.method, OdeMethod::Euler);
        assert_eq!(cfg.solver.steps, 50);
        assert!(!cfg.solver.record_trajectory);
        assert!((cfg.guidance.cfg_prob - 0.1).abs() < 1e-9);
        assert!((cfg.guidance.guidance_scale - 3.0).abs() < 1e-9);
        assert_eq!(cfg.train.seed, 123);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let cfg: FlowConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, FlowConfig::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_override() {
        let toml_str = r#"
            num_classes = 2

            [objective]
            scheduler = "cosine"
            t_schedule = "ushaped"

            [solver]
            method = "rk4"
        "#;
        let cfg: FlowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.num_classes, 2);
        assert_eq!(cfg.objective.scheduler, Scheduler::Cosine);
        assert_eq!(cfg.objective.t_schedule, TimestepSchedule::UShaped);
        assert_eq!(cfg.solver.method, OdeMethod::Rk4);
        // Defaults for unspecified fields
        assert_eq!(cfg.objective.noise, NoiseSampler::Gaussian);
        assert_eq!(cfg.solver.steps, 50);
        assert!((cfg.guidance.cfg_prob - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_full_toml() {
        let toml_str = r#"
            num_classes = 3

            [objective]
            scheduler = "stable"
            noise = "uniform"
            t_schedule = { constant = 0.5 }

            [solver]
            method = "heun"
            steps = 8
            record_trajectory = true

            [guidance]
            cfg_prob = 0.2
            guidance_scale = 1.5

            [train]
            lr = 0.01
            steps = 10
            batch_size = 4
            seed = 7
            log_interval = 0
        "#;
        let cfg: FlowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.objective.scheduler, Scheduler::Stable);
        assert_eq!(cfg.objective.noise, NoiseSampler::Uniform);
        assert_eq!(cfg.objective.t_schedule, TimestepSchedule::Constant(0.5));
        assert_eq!(cfg.solver, SolverConfig::new(OdeMethod::Heun, 8).with_trajectory());
        assert!((cfg.guidance.cfg_prob - 0.2).abs() < 1e-9);
        assert!((cfg.guidance.guidance_scale - 1.5).abs() < 1e-9);
        assert_eq!(cfg.train.batch_size, 4);
        assert_eq!(cfg.train.seed, 7);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_unknown_scheduler_is_a_parse_error() {
        assert!(toml::from_str::<FlowConfig>("[objective]\nscheduler = \"sigmoid\"").is_err());
    }

    #[test]
    fn test_validate_rejects_hard_violations() {
        let bad_steps = FlowConfig {
            solver: SolverConfig::new(OdeMethod::Euler, 0),
            ..Default::default()
        };
        assert!(matches!(
            bad_steps.validate(),
            Err(Error::Config { component: Component::Solver, .. })
        ));

        let bad_prob = FlowConfig {
            guidance: CfgConfig { cfg_prob: 1.5, guidance_scale: 1.0 },
            ..Default::default()
        };
        assert!(bad_prob.validate().is_err());

        let bad_scale = FlowConfig {
            guidance: CfgConfig { cfg_prob: 0.1, guidance_scale: -1.0 },
            ..Default::default()
        };
        assert!(bad_scale.validate().is_err());

        let bad_t = FlowConfig {
            objective: ObjectiveConfig {
                t_schedule: TimestepSchedule::Constant(-0.5),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(bad_t.validate().is_err());
    }

    #[test]
    fn test_validate_guidance_without_dropout_only_warns() {
        // Should log a warning but not fail.
        let cfg = FlowConfig {
            num_classes: 2,
            guidance: CfgConfig { cfg_prob: 0.0, guidance_scale: 3.0 },
            ..Default::default()
        };
        cfg.validate().unwrap();
    }
}
