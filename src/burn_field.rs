//! Burn-backed (opt-in) conditional MLP vector field.
//!
//! Burn is a backend for **training** only: targets, CFG dropout, and sampling all go through the
//! same ndarray code as the default build. The trained network is exposed as a
//! [`VectorField`] on the (non-autodiff) inner backend, so it plugs straight into
//! [`crate::ode::integrate`] and [`crate::guidance::GuidedField`].
//!
//! Input features per batch element are `[vec(x), onehot(c), fourier(t)]`, where the one-hot has
//! `num_classes + 1` entries (the last one is the unconditional token) and
//! \[
//! \mathrm{fourier}(t) = \sqrt{2}\,[\sin(2\pi k t), \cos(2\pi k t)]_{k=1..K}.
//! \]

use burn_core as burn;

use burn::module::{AutodiffModule, Module};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_nn::{Linear, LinearConfig, Relu};
use burn_optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig};
use ndarray::{s, Array2, ArrayD, ArrayView1, ArrayViewD, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::field::{check_batch, check_same_shape, Condition, VectorField};
use crate::guidance::ClassifierFreeGuidance;
use crate::objective::{build_targets, ObjectiveConfig};
use crate::train::TrainConfig;
use crate::{Component, Error, Result};

/// Default burn backend for training: ndarray + autodiff.
pub type BurnBackend = Autodiff<NdArray<f32>>;

/// Backend the trained field runs on.
pub type BurnInference = NdArray<f32>;

/// Which burn optimizer drives training. The step size is always `TrainConfig::lr`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BurnOptimizer {
    #[default]
    Sgd,
    /// Adam with burn's default betas and epsilon; pair with a small `lr` (around 1e-3).
    Adam,
}

/// Network shape and optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurnFieldConfig {
    pub hidden: usize,
    /// Number of Fourier frequencies `K` (the time encoding has `2K` entries).
    pub fourier_features: usize,
    pub optimizer: BurnOptimizer,
}

impl Default for BurnFieldConfig {
    fn default() -> Self {
        Self {
            hidden: 64,
            fourier_features: 8,
            optimizer: BurnOptimizer::default(),
        }
    }
}

/// A three-layer ReLU MLP from features to velocities.
#[derive(Module, Debug)]
pub struct BurnCondMlp<B: Backend> {
    l1: Linear<B>,
    l2: Linear<B>,
    l3: Linear<B>,
}

impl<B: Backend> BurnCondMlp<B> {
    pub fn new(device: &B::Device, in_dim: usize, hidden: usize, out_dim: usize) -> Self {
        Self {
            l1: LinearConfig::new(in_dim, hidden).init(device),
            l2: LinearConfig::new(hidden, hidden).init(device),
            l3: LinearConfig::new(hidden, out_dim).init(device),
        }
    }

    /// `[batch, in_dim] -> [batch, out_dim]`.
    pub fn forward(&self, feats: Tensor<B, 2>) -> Tensor<B, 2> {
        let h = Relu.forward(self.l1.forward(feats));
        let h = Relu.forward(self.l2.forward(h));
        self.l3.forward(h)
    }
}

#[derive(Debug, Clone)]
struct Features {
    state_shape: Vec<usize>,
    num_classes: usize,
    fourier: usize,
}

impl Features {
    fn dim(&self) -> usize {
        self.state_shape.iter().product()
    }

    fn width(&self) -> usize {
        self.dim() + self.num_classes + 1 + 2 * self.fourier
    }

    fn build(
        &self,
        x: &ArrayViewD<f32>,
        t: &ArrayView1<f32>,
        cond: &[Condition],
    ) -> Result<Array2<f32>> {
        let batch = check_batch(Component::Field, x, cond.len())?;
        check_same_shape(Component::Field, &self.state_shape, &x.shape()[1..])?;
        check_same_shape(Component::Field, &[batch], &[t.len()])?;

        let d = self.dim();
        let k = self.num_classes + 1;
        let flat = flatten(x, batch, d)?;
        let mut f = Array2::<f32>::zeros((batch, self.width()));
        f.slice_mut(s![.., ..d]).assign(&flat);
        let tau = 2.0 * core::f32::consts::PI;
        let amp = core::f32::consts::SQRT_2;
        for (i, c) in cond.iter().enumerate() {
            f[[i, d + c.token(self.num_classes)?]] = 1.0;
            for j in 0..self.fourier {
                let w = tau * (j + 1) as f32 * t[i];
                f[[i, d + k + j]] = amp * w.sin();
                f[[i, d + k + self.fourier + j]] = amp * w.cos();
            }
        }
        Ok(f)
    }
}

fn flatten(x: &ArrayViewD<f32>, batch: usize, d: usize) -> Result<Array2<f32>> {
    Array2::from_shape_vec((batch, d), x.iter().copied().collect()).map_err(|_| {
        Error::ShapeMismatch {
            component: Component::Field,
            expected: vec![batch, d],
            got: x.shape().to_vec(),
        }
    })
}

fn to_tensor<B: Backend>(device: &B::Device, x: &Array2<f32>) -> Tensor<B, 2> {
    let (n, d) = x.dim();
    Tensor::from_data(TensorData::new(x.iter().copied().collect::<Vec<f32>>(), [n, d]), device)
}

/// A trained [`BurnCondMlp`] behind the [`VectorField`] seam.
pub struct BurnField<B: Backend> {
    model: BurnCondMlp<B>,
    device: B::Device,
    features: Features,
}

impl<B: Backend> BurnField<B> {
    pub fn model(&self) -> &BurnCondMlp<B> {
        &self.model
    }

    pub fn state_shape(&self) -> &[usize] {
        &self.features.state_shape
    }
}

impl<B: Backend> VectorField for BurnField<B> {
    fn velocity(
        &self,
        x: &ArrayViewD<f32>,
        t: &ArrayView1<f32>,
        cond: &[Condition],
    ) -> Result<ArrayD<f32>> {
        let feats = self.features.build(x, t, cond)?;
        let out = self.model.forward(to_tensor::<B>(&self.device, &feats));
        let v = out
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|_| Error::Domain {
                component: Component::Field,
                msg: "could not read burn output as f32".into(),
            })?;
        ArrayD::from_shape_vec(x.raw_dim(), v).map_err(|_| Error::ShapeMismatch {
            component: Component::Field,
            expected: x.shape().to_vec(),
            got: vec![feats.nrows()],
        })
    }
}

/// Minibatch source shared by every optimizer.
struct Batches<'a, 'd> {
    data: &'a ArrayViewD<'d, f32>,
    labels: &'a [Condition],
    objective: &'a ObjectiveConfig,
    train: &'a TrainConfig,
}

fn fit<O>(
    mut optim: O,
    mut model: BurnCondMlp<BurnBackend>,
    device: &<BurnBackend as Backend>::Device,
    features: &Features,
    batches: &Batches<'_, '_>,
    guidance: &mut ClassifierFreeGuidance,
) -> Result<(BurnCondMlp<BurnBackend>, Vec<f32>)>
where
    O: Optimizer<BurnCondMlp<BurnBackend>, BurnBackend>,
{
    let train = batches.train;
    let n = batches.labels.len();
    let d = features.dim();
    let mut rng = ChaCha8Rng::seed_from_u64(train.seed);
    let mut losses = Vec::with_capacity(train.steps);

    for step in 0..train.steps {
        let idx: Vec<usize> = (0..train.batch_size)
            .map(|_| rng.random_range(0..n))
            .collect();
        let xb = batches.data.select(Axis(0), &idx);
        let yb: Vec<Condition> = idx.iter().map(|&i| batches.labels[i]).collect();
        let cond = guidance.apply_dropout(&yb, &mut rng)?;

        let targets = build_targets(batches.objective, &xb.view(), &cond, &mut rng)?;
        let feats = features.build(&targets.x_t.view(), &targets.t.view(), &targets.cond)?;
        let u = flatten(&targets.target.view(), targets.batch_size(), d)?;

        let pred = model.forward(to_tensor::<BurnBackend>(device, &feats));
        let loss = (pred - to_tensor::<BurnBackend>(device, &u))
            .powf_scalar(2.0)
            .mean();
        let value: f32 = loss.clone().into_scalar().elem();
        if !value.is_finite() {
            return Err(Error::Domain {
                component: Component::Objective,
                msg: format!("loss is not finite ({value}) at step {step}"),
            });
        }
        losses.push(value);

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optim.step(train.lr as f64, model, grads);

        if train.log_interval > 0 && (step + 1) % train.log_interval == 0 {
            tracing::info!(step = step + 1, loss = value, backend = "burn", "train");
        }
    }
    Ok((model, losses))
}

/// Output of [`train_burn_field`].
pub struct BurnTrainReport {
    pub field: BurnField<BurnInference>,
    pub guidance: ClassifierFreeGuidance,
    pub losses: Vec<f32>,
}

/// Train a [`BurnCondMlp`] on the flow-matching objective, with CFG label dropout.
///
/// The optimizer is `net.optimizer` (SGD by default).
///
/// Minibatches, dropout, `t`, and noise come from `train.seed` exactly as in
/// [`crate::train::train_linear_field`]; parameter initialization is burn's.
#[allow(clippy::too_many_arguments)]
pub fn train_burn_field(
    device: &<BurnBackend as Backend>::Device,
    data: &ArrayViewD<f32>,
    labels: &[Condition],
    num_classes: usize,
    objective: &ObjectiveConfig,
    cfg_prob: f32,
    train: &TrainConfig,
    net: &BurnFieldConfig,
) -> Result<BurnTrainReport> {
    train.validate()?;
    if net.hidden == 0 {
        return Err(Error::Config {
            component: Component::Field,
            msg: format!("hidden must be >= 1, got {}", net.hidden),
        });
    }
    let n = check_batch(Component::Objective, data, labels.len())?;
    if n == 0 {
        return Err(Error::Domain {
            component: Component::Objective,
            msg: "training data must be non-empty".into(),
        });
    }
    for c in labels {
        c.token(num_classes)?;
    }

    let features = Features {
        state_shape: data.shape()[1..].to_vec(),
        num_classes,
        fourier: net.fourier_features,
    };
    let d = features.dim();
    let model = BurnCondMlp::<BurnBackend>::new(device, features.width(), net.hidden, d);
    let mut guidance = ClassifierFreeGuidance::new(cfg_prob)?;
    let batches = Batches {
        data,
        labels,
        objective,
        train,
    };
    let (model, losses) = match net.optimizer {
        BurnOptimizer::Sgd => {
            let optim = SgdConfig::new().init::<BurnBackend, BurnCondMlp<BurnBackend>>();
            fit(optim, model, device, &features, &batches, &mut guidance)?
        }
        BurnOptimizer::Adam => {
            let optim = AdamConfig::new().init::<BurnBackend, BurnCondMlp<BurnBackend>>();
            fit(optim, model, device, &features, &batches, &mut guidance)?
        }
    };

    Ok(BurnTrainReport {
        field: BurnField {
            model: model.valid(),
            device: device.clone(),
            features,
        },
        guidance,
        losses,
    })
}
