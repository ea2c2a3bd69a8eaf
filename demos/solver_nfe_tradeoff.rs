//! Sample quality vs NFE for Euler / Heun / RK4 on a trained blob model.
//!
//! The reference is a 256-step RK4 solve from the same noise; each row reports the mean squared
//! distance to it, so this measures integration error only (not model error).
//!
//! Run:
//! ```bash
//! cargo run --example solver_nfe_tradeoff
//! ```

use ndarray::array;
use tracing_subscriber::EnvFilter;
use voxflow::field::Condition;
use voxflow::guidance::GuidedField;
use voxflow::metrics::{mean_sq_diff, trajectory_straightness};
use voxflow::objective::{ObjectiveConfig, TimestepSchedule};
use voxflow::ode::{integrate, OdeMethod, SolverConfig};
use voxflow::sampler::NoiseSampler;
use voxflow::scheduler::Scheduler;
use voxflow::toy::gaussian_blobs;
use voxflow::train::{train_linear_field, TrainConfig};
use voxflow::Result;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let centers = array![[-2.0f32, -1.0], [2.0, -1.0], [0.0, 2.0]];
    let data = gaussian_blobs(&centers.view(), 300, 0.25, 1)?;

    let scheduler = match std::env::var("VOXFLOW_SCHEDULER").as_deref() {
        Ok("cosine") => Scheduler::Cosine,
        Ok("stable") => Scheduler::Stable,
        _ => Scheduler::Linear,
    };
    let objective = ObjectiveConfig {
        scheduler,
        t_schedule: TimestepSchedule::UShaped,
        ..ObjectiveConfig::default()
    };
    let report = train_linear_field(
        &data.points.view().into_dyn(),
        &data.labels,
        3,
        &objective,
        0.1,
        &TrainConfig::default(),
    )?;
    let guided = GuidedField::new(&report.field, 2.0)?;

    let m = 600usize;
    let cond: Vec<Condition> = (0..m).map(|i| Condition::Class((i % 3) as u32)).collect();
    let x0 = NoiseSampler::Gaussian.sample_seeded(m, &[2], 2024)?;
    let reference = integrate(
        &SolverConfig::new(OdeMethod::Rk4, 256).with_trajectory(),
        &guided,
        &x0.view(),
        &cond,
    )?;
    let straight = trajectory_straightness(&reference.trajectory)?;

    println!("scheduler={scheduler:?}  guidance_scale=2.0  m={m}");
    println!(
        "reference straightness (arc/chord): mean={:.4}",
        straight.mean().unwrap_or(f32::NAN)
    );
    println!();

    for nfe_budget in [4usize, 8, 16, 32, 64] {
        let mut row = format!("nfe<={nfe_budget:>3}");
        for method in [OdeMethod::Euler, OdeMethod::Heun, OdeMethod::Rk4] {
            // Guided fields cost two predictor calls per evaluation.
            let steps = nfe_budget / (2 * method.stages());
            if steps == 0 {
                row.push_str(&format!("  {method:?}: {:>10}", "-"));
                continue;
            }
            let sol = integrate(&SolverConfig::new(method, steps), &guided, &x0.view(), &cond)?;
            let err = mean_sq_diff(&sol.sample.view(), &reference.sample.view())?;
            row.push_str(&format!("  {method:?}: {err:>10.3e}"));
        }
        println!("{row}");
    }
    Ok(())
}
