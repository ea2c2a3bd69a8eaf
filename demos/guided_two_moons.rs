//! Two moons with classifier-free guidance: train the affine baseline, then sample each class at
//! several guidance scales.
//!
//! Run:
//! ```bash
//! cargo run --example guided_two_moons
//! ```
//!
//! Optional:
//! ```bash
//! VOXFLOW_CONFIG=moons.toml RUST_LOG=debug cargo run --example guided_two_moons
//! ```

use ndarray::{Array2, Axis, Ix2};
use tracing_subscriber::EnvFilter;
use voxflow::config::FlowConfig;
use voxflow::field::{unconditional, Condition};
use voxflow::generate::{generate, generate_guided};
use voxflow::metrics::nearest_center_accuracy;
use voxflow::toy::two_moons;
use voxflow::train::train_linear_field;
use voxflow::Result;

fn class_means(points: &Array2<f32>, labels: &[Condition], num_classes: usize) -> Array2<f32> {
    let mut means = Array2::<f32>::zeros((num_classes, points.ncols()));
    for k in 0..num_classes {
        let idx: Vec<usize> = (0..labels.len())
            .filter(|&i| labels[i] == Condition::Class(k as u32))
            .collect();
        if let Some(m) = points.select(Axis(0), &idx).mean_axis(Axis(0)) {
            means.row_mut(k).assign(&m);
        }
    }
    means
}

fn load_config() -> FlowConfig {
    let fallback = FlowConfig {
        num_classes: 2,
        ..FlowConfig::default()
    };
    let Ok(path) = std::env::var("VOXFLOW_CONFIG") else {
        return fallback;
    };
    match std::fs::read_to_string(&path).map(|s| toml::from_str::<FlowConfig>(&s)) {
        Ok(Ok(cfg)) => cfg,
        Ok(Err(e)) => {
            tracing::warn!(%path, error = %e, "bad config; using defaults");
            fallback
        }
        Err(e) => {
            tracing::warn!(%path, error = %e, "unreadable config; using defaults");
            fallback
        }
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = load_config();
    cfg.validate()?;

    let data = two_moons(4_000, 0.05, 42)?;
    let report = train_linear_field(
        &data.points.view().into_dyn(),
        &data.labels,
        cfg.num_classes,
        &cfg.objective,
        cfg.guidance.cfg_prob,
        &cfg.train,
    )?;
    let means = class_means(&data.points, &data.labels, cfg.num_classes);

    println!("two moons: n={}  classes={}", data.points.nrows(), cfg.num_classes);
    println!(
        "objective={:?}  solver={:?} x{}  cfg_prob={}",
        cfg.objective, cfg.solver.method, cfg.solver.steps, cfg.guidance.cfg_prob
    );
    println!(
        "final loss (mean of last 100 steps) = {:.4}",
        report.losses.iter().rev().take(100).sum::<f32>() / 100.0f32.min(report.losses.len() as f32)
    );
    println!();

    let m = 1_000usize;
    let uncond = generate(
        &report.field,
        cfg.objective.noise,
        &[2],
        &unconditional(m),
        &cfg.solver,
        7,
    )?;
    let u = uncond.sample.into_dimensionality::<Ix2>().unwrap_or_default();
    println!(
        "unconditional: mean=({:+.3}, {:+.3})  nfe={}",
        u.column(0).mean().unwrap_or(f32::NAN),
        u.column(1).mean().unwrap_or(f32::NAN),
        uncond.nfe
    );

    let cond: Vec<Condition> = (0..m).map(|i| Condition::Class((i % 2) as u32)).collect();
    for scale in [0.0f32, 1.0, 2.0, 3.0, 5.0] {
        let sol = generate_guided(
            &report.field,
            &report.guidance,
            scale,
            cfg.objective.noise,
            &[2],
            &cond,
            &cfg.solver,
            7,
        )?;
        let xs = sol.sample.into_dimensionality::<Ix2>().unwrap_or_default();
        let acc = nearest_center_accuracy(&xs.view(), &means.view(), &cond)?;
        println!(
            "scale={scale:>3.1}  nearest-class-mean accuracy={acc:.3}  nfe={}",
            sol.nfe
        );
    }
    Ok(())
}
