//! A trainable affine vector field.
//!
//! This is an intentionally boring baseline: enough structure to exercise training, CFG, and
//! sampling end to end, without importing a full ML framework.

use crate::field::{check_batch, check_same_shape, Condition, VectorField};
use crate::objective::FmTargets;
use crate::{Component, Error, Result};
use ndarray::{s, Array2, ArrayD, ArrayView1, ArrayViewD};

/// A linear field conditioned on a class token:
///
/// \[
/// v_\theta(x, t; c) = W \cdot [\mathrm{vec}(x); \mathrm{onehot}(c); t; 1],
/// \]
///
/// where the one-hot has `num_classes + 1` entries (the last one is the unconditional token)
/// and `W` is `dim × (dim + num_classes + 3)` with `dim = prod(state_shape)`.
#[derive(Debug, Clone)]
pub struct LinearField {
    /// Parameters `W`.
    pub w: Array2<f32>,
    state_shape: Vec<usize>,
    num_classes: usize,
}

impl LinearField {
    pub fn new_zeros(state_shape: &[usize], num_classes: usize) -> Self {
        let dim = state_shape.iter().product::<usize>();
        Self {
            w: Array2::zeros((dim, dim + num_classes + 3)),
            state_shape: state_shape.to_vec(),
            num_classes,
        }
    }

    pub fn dim(&self) -> usize {
        self.w.nrows()
    }

    pub fn state_shape(&self) -> &[usize] {
        &self.state_shape
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn check_states(&self, x: &ArrayViewD<f32>, per_sample: usize) -> Result<usize> {
        let batch = check_batch(Component::Field, x, per_sample)?;
        check_same_shape(Component::Field, &self.state_shape, &x.shape()[1..])?;
        Ok(batch)
    }

    /// Feature rows `[vec(x), onehot(c), t, 1]`, one per batch element.
    fn features(
        &self,
        x: &ArrayViewD<f32>,
        t: &ArrayView1<f32>,
        cond: &[Condition],
    ) -> Result<Array2<f32>> {
        let batch = self.check_states(x, cond.len())?;
        check_same_shape(Component::Field, &[batch], &[t.len()])?;

        let d = self.dim();
        let k = self.num_classes + 1;
        let flat = Array2::from_shape_vec((batch, d), x.iter().copied().collect()).map_err(|_| {
            Error::ShapeMismatch {
                component: Component::Field,
                expected: vec![batch, d],
                got: x.shape().to_vec(),
            }
        })?;

        let mut f = Array2::<f32>::zeros((batch, d + k + 2));
        f.slice_mut(s![.., ..d]).assign(&flat);
        for (i, c) in cond.iter().enumerate() {
            f[[i, d + c.token(self.num_classes)?]] = 1.0;
            f[[i, d + k]] = t[i];
            f[[i, d + k + 1]] = 1.0;
        }
        Ok(f)
    }

    /// One SGD step on the flow-matching regression:
    ///
    /// \[
    /// L = \tfrac{1}{2B} \sum_i \|v_\theta(x_{t,i}, t_i; c_i) - u_i\|_2^2.
    /// \]
    pub fn sgd_step(&mut self, targets: &FmTargets, lr: f32) -> Result<()> {
        let f = self.features(&targets.x_t.view(), &targets.t.view(), &targets.cond)?;
        let batch = f.nrows();
        let u = Array2::from_shape_vec(
            (batch, self.dim()),
            targets.target.iter().copied().collect(),
        )
        .map_err(|_| Error::ShapeMismatch {
            component: Component::Field,
            expected: vec![batch, self.dim()],
            got: targets.target.shape().to_vec(),
        })?;

        let r = f.dot(&self.w.t()) - &u;
        // dL/dW = R^T F / B
        let grad = r.t().dot(&f);
        self.w.scaled_add(-lr / batch as f32, &grad);
        if self.w.iter().any(|w| !w.is_finite()) {
            return Err(Error::Domain {
                component: Component::Field,
                msg: "parameters became non-finite (learning rate too large?)".into(),
            });
        }
        Ok(())
    }
}

impl VectorField for LinearField {
    fn velocity(
        &self,
        x: &ArrayViewD<f32>,
        t: &ArrayView1<f32>,
        cond: &[Condition],
    ) -> Result<ArrayD<f32>> {
        let f = self.features(x, t, cond)?;
        let pred = f.dot(&self.w.t());
        ArrayD::from_shape_vec(x.raw_dim(), pred.iter().copied().collect()).map_err(|_| {
            Error::ShapeMismatch {
                component: Component::Field,
                expected: x.shape().to_vec(),
                got: pred.shape().to_vec(),
            }
        })
    }
}
