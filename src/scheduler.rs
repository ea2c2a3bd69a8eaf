//! Probability paths between noise and data.
//!
//! A scheduler defines path coefficients \(\alpha(t), \beta(t)\) with
//! \[
//! x_t = \alpha(t)\, x_{\text{data}} + \beta(t)\, x_{\text{noise}},
//! \]
//! and their time derivatives, which give the flow-matching regression target
//! \[
//! u_t = \alpha'(t)\, x_{\text{data}} + \beta'(t)\, x_{\text{noise}}.
//! \]
//!
//! Public invariants:
//! - \(\alpha(0)=0, \beta(0)=1\) and \(\alpha(1)=1, \beta(1)=0\) **exactly** (endpoints are not
//!   computed through trig roundoff).
//! - Derivatives at the endpoints are the analytic one-sided limits, and are always finite.
//! - `t` outside `[0,1]` (or NaN) is a [`Error::TimeDomain`]; nothing is clamped implicitly.
//!   Use [`clamp_time`] if clamping is what you want.

use crate::field::check_batch_pair;
use crate::{Component, Error, Result};
use ndarray::{ArrayD, ArrayView1, ArrayViewD, Axis, Zip};
use serde::Deserialize;

use core::f64::consts::FRAC_PI_2;

/// Interpolation path variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheduler {
    /// `alpha = t`, `beta = 1 - t` (straight lines, constant target `x_data - x_noise`).
    #[default]
    Linear,
    /// `alpha = sin(πt/2)`, `beta = cos(πt/2)` (variance-preserving for independent unit inputs).
    Cosine,
    /// Cubic smoothstep: `alpha = 3t² - 2t³`, `beta = 1 - alpha`.
    ///
    /// The path velocity vanishes at both endpoints, so the target is bounded by
    /// `1.5 |x_data - x_noise|` and few-step solvers start and end gently.
    Stable,
}

/// Path coefficients and their time derivatives at a single `t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathCoefficients {
    pub alpha: f32,
    pub beta: f32,
    pub d_alpha: f32,
    pub d_beta: f32,
}

/// Reject `t` outside `[0,1]` or non-finite.
pub(crate) fn check_time(t: f32, component: Component) -> Result<()> {
    if !(0.0..=1.0).contains(&t) {
        // NaN also fails `contains`.
        return Err(Error::TimeDomain { component, t });
    }
    Ok(())
}

/// Explicit clamping to `[0,1]`. NaN is still an error.
pub fn clamp_time(t: f32) -> Result<f32> {
    if t.is_nan() {
        return Err(Error::TimeDomain {
            component: Component::Scheduler,
            t,
        });
    }
    Ok(t.clamp(0.0, 1.0))
}

impl Scheduler {
    /// `(alpha, beta, alpha', beta')` at `t`.
    pub fn coefficients(self, t: f32) -> Result<PathCoefficients> {
        check_time(t, Component::Scheduler)?;
        let c = match self {
            Scheduler::Linear => PathCoefficients {
                alpha: t,
                beta: 1.0 - t,
                d_alpha: 1.0,
                d_beta: -1.0,
            },
            Scheduler::Cosine => {
                let half_pi = FRAC_PI_2 as f32;
                if t == 0.0 {
                    PathCoefficients {
                        alpha: 0.0,
                        beta: 1.0,
                        d_alpha: half_pi,
                        d_beta: 0.0,
                    }
                } else if t == 1.0 {
                    PathCoefficients {
                        alpha: 1.0,
                        beta: 0.0,
                        d_alpha: 0.0,
                        d_beta: -half_pi,
                    }
                } else {
                    let (s, c) = (FRAC_PI_2 * t as f64).sin_cos();
                    PathCoefficients {
                        alpha: s as f32,
                        beta: c as f32,
                        d_alpha: (FRAC_PI_2 * c) as f32,
                        d_beta: (-FRAC_PI_2 * s) as f32,
                    }
                }
            }
            Scheduler::Stable => {
                let t = t as f64;
                let alpha = t * t * (3.0 - 2.0 * t);
                let d_alpha = 6.0 * t * (1.0 - t);
                PathCoefficients {
                    alpha: alpha as f32,
                    beta: (1.0 - alpha) as f32,
                    d_alpha: d_alpha as f32,
                    d_beta: (-d_alpha) as f32,
                }
            }
        };
        Ok(c)
    }

    /// Coefficients for a batch of times. Fails on the first out-of-domain `t`.
    pub fn coefficients_batch(self, ts: &ArrayView1<f32>) -> Result<Vec<PathCoefficients>> {
        ts.iter().map(|&t| self.coefficients(t)).collect()
    }

    /// `x_t = alpha(t_i) * x_data[i] + beta(t_i) * x_noise[i]`, per batch element `i` (axis 0).
    pub fn interpolate(
        self,
        x_data: &ArrayViewD<f32>,
        x_noise: &ArrayViewD<f32>,
        ts: &ArrayView1<f32>,
    ) -> Result<ArrayD<f32>> {
        self.combine(x_data, x_noise, ts, |c| (c.alpha, c.beta))
    }

    /// `u_t = alpha'(t_i) * x_data[i] + beta'(t_i) * x_noise[i]`, per batch element `i` (axis 0).
    pub fn target_velocity(
        self,
        x_data: &ArrayViewD<f32>,
        x_noise: &ArrayViewD<f32>,
        ts: &ArrayView1<f32>,
    ) -> Result<ArrayD<f32>> {
        self.combine(x_data, x_noise, ts, |c| (c.d_alpha, c.d_beta))
    }

    fn combine(
        self,
        x_data: &ArrayViewD<f32>,
        x_noise: &ArrayViewD<f32>,
        ts: &ArrayView1<f32>,
        pick: impl Fn(&PathCoefficients) -> (f32, f32),
    ) -> Result<ArrayD<f32>> {
        check_batch_pair(Component::Scheduler, x_data, x_noise, ts.len())?;
        let coeffs = self.coefficients_batch(ts)?;

        let mut out = ArrayD::<f32>::zeros(x_data.raw_dim());
        for (i, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
            let (a, b) = pick(&coeffs[i]);
            Zip::from(&mut row)
                .and(x_data.index_axis(Axis(0), i))
                .and(x_noise.index_axis(Axis(0), i))
                .for_each(|o, &d, &n| *o = a * d + b * n);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, ArrayD, IxDyn};
    use proptest::prelude::*;

    const ALL: [Scheduler; 3] = [Scheduler::Linear, Scheduler::Cosine, Scheduler::Stable];

    #[test]
    fn boundary_values_are_exact() {
        for s in ALL {
            let c0 = s.coefficients(0.0).unwrap();
            let c1 = s.coefficients(1.0).unwrap();
            assert_eq!((c0.alpha, c0.beta), (0.0, 1.0), "{s:?} at t=0");
            assert_eq!((c1.alpha, c1.beta), (1.0, 0.0), "{s:?} at t=1");
            for c in [c0, c1] {
                assert!(c.d_alpha.is_finite() && c.d_beta.is_finite());
            }
        }
    }

    #[test]
    fn out_of_domain_time_is_an_error() {
        for s in ALL {
            for t in [-1e-6f32, 1.000_001, f32::NAN, f32::INFINITY, -3.0] {
                match s.coefficients(t) {
                    Err(Error::TimeDomain { component, .. }) => {
                        assert_eq!(component, Component::Scheduler)
                    }
                    other => panic!("expected TimeDomain for {s:?} t={t}, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn clamp_time_is_explicit() {
        assert_eq!(clamp_time(-0.5).unwrap(), 0.0);
        assert_eq!(clamp_time(1.5).unwrap(), 1.0);
        assert_eq!(clamp_time(0.25).unwrap(), 0.25);
        assert!(clamp_time(f32::NAN).is_err());
    }

    #[test]
    fn coefficients_move_from_noise_to_data() {
        for s in ALL {
            let mut prev = s.coefficients(0.0).unwrap();
            for k in 1..=200 {
                let c = s.coefficients(k as f32 / 200.0).unwrap();
                assert!(c.alpha >= prev.alpha - 1e-7, "{s:?}: alpha decreased at k={k}");
                assert!(c.beta <= prev.beta + 1e-7, "{s:?}: beta increased at k={k}");
                prev = c;
            }
        }
    }

    #[test]
    fn derivatives_match_central_differences() {
        let h = 1e-3f32;
        for s in ALL {
            for k in 1..20 {
                let t = k as f32 / 20.0;
                let c = s.coefficients(t).unwrap();
                let lo = s.coefficients(t - h).unwrap();
                let hi = s.coefficients(t + h).unwrap();
                let da = (hi.alpha - lo.alpha) / (2.0 * h);
                let db = (hi.beta - lo.beta) / (2.0 * h);
                assert!((c.d_alpha - da).abs() < 5e-3, "{s:?} d_alpha at t={t}");
                assert!((c.d_beta - db).abs() < 5e-3, "{s:?} d_beta at t={t}");
            }
        }
    }

    #[test]
    fn batch_with_mismatched_times_is_a_shape_error() {
        let x = ArrayD::<f32>::zeros(IxDyn(&[3, 2]));
        let ts = Array1::<f32>::zeros(2);
        let err = Scheduler::Linear
            .interpolate(&x.view(), &x.view(), &ts.view())
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_endpoints_recover_noise_and_data(
            which in 0usize..3,
            batch in 1usize..6,
            dim in 1usize..8,
            data in prop::collection::vec(-10.0f32..10.0f32, 48),
            noise in prop::collection::vec(-10.0f32..10.0f32, 48),
        ) {
            let s = ALL[which];
            let n = batch * dim;
            let xd = ArrayD::from_shape_vec(IxDyn(&[batch, dim]), data[..n].to_vec()).unwrap();
            let xn = ArrayD::from_shape_vec(IxDyn(&[batch, dim]), noise[..n].to_vec()).unwrap();

            let t0 = Array1::<f32>::zeros(batch);
            let t1 = Array1::<f32>::ones(batch);
            let at0 = s.interpolate(&xd.view(), &xn.view(), &t0.view()).unwrap();
            let at1 = s.interpolate(&xd.view(), &xn.view(), &t1.view()).unwrap();
            for ((a0, a1), (d, nz)) in at0.iter().zip(at1.iter()).zip(xd.iter().zip(xn.iter())) {
                prop_assert!((a0 - nz).abs() <= 1e-6, "{s:?}: x_0 != noise");
                prop_assert!((a1 - d).abs() <= 1e-6, "{s:?}: x_1 != data");
            }
        }

        #[test]
        fn prop_linear_target_is_data_minus_noise(
            t in 0.0f32..=1.0f32,
            data in prop::collection::vec(-10.0f32..10.0f32, 6),
            noise in prop::collection::vec(-10.0f32..10.0f32, 6),
        ) {
            let xd = ArrayD::from_shape_vec(IxDyn(&[2, 3]), data).unwrap();
            let xn = ArrayD::from_shape_vec(IxDyn(&[2, 3]), noise).unwrap();
            let ts = Array1::from_elem(2, t);
            let u = Scheduler::Linear.target_velocity(&xd.view(), &xn.view(), &ts.view()).unwrap();
            for ((u, d), n) in u.iter().zip(xd.iter()).zip(xn.iter()) {
                prop_assert!((u - (d - n)).abs() <= 1e-5);
            }
        }
    }
}
