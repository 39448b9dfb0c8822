//! Built-in member architecture: one linear Gaussian head per feature set.
//!
//! Each head predicts `mu = w . x + b` and `sigma = softplus(v . x + c) + MIN_STD`.
//! In the independent-heads variant head `i` reads only feature set `i`; in the
//! multivariate variant every mean reads the concatenation of all feature sets
//! while the scale of component `i` still reads feature set `i`.

use ensemble_core::{
    EnsembleConfig, EnsembleError, EnsembleResult, GaussianPrediction, JointGaussian,
    ModelFactory, ModelVariant, ModelWeights, PredictionShape, ProbabilisticModel,
};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const MIN_STD: f64 = 1e-6;
/// softplus^-1(1): heads start out predicting unit standard deviation.
const UNIT_SCALE_BIAS: f64 = 0.541_324_854_612_918_1;
const HALF_LN_TWO_PI: f64 = 0.918_938_533_204_672_7;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-7;

/// Builds [`LinearGaussianModel`] members for the configured variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianHeadsFactory;

impl ModelFactory for GaussianHeadsFactory {
    fn build_model(
        &self,
        config: &EnsembleConfig,
        input_dims: &[usize],
        seed: u64,
    ) -> EnsembleResult<Box<dyn ProbabilisticModel>> {
        let model = LinearGaussianModel::new(config.build_model, input_dims, config.lr, seed)?;
        Ok(Box::new(model))
    }
}

#[derive(Debug, Clone, Copy)]
struct Head {
    mean_offset: usize,
    mean_dim: usize,
    scale_offset: usize,
    scale_dim: usize,
}

#[derive(Debug, Clone)]
struct Adam {
    lr: f64,
    m: Vec<f64>,
    v: Vec<f64>,
    t: i32,
}

impl Adam {
    fn new(lr: f64, n_params: usize) -> Self {
        Self {
            lr,
            m: vec![0.0; n_params],
            v: vec![0.0; n_params],
            t: 0,
        }
    }

    fn step(&mut self, params: &mut [f64], grads: &[f64]) {
        self.t += 1;
        let bias1 = 1.0 - ADAM_BETA1.powi(self.t);
        let bias2 = 1.0 - ADAM_BETA2.powi(self.t);
        for k in 0..params.len() {
            self.m[k] = ADAM_BETA1 * self.m[k] + (1.0 - ADAM_BETA1) * grads[k];
            self.v[k] = ADAM_BETA2 * self.v[k] + (1.0 - ADAM_BETA2) * grads[k] * grads[k];
            let m_hat = self.m[k] / bias1;
            let v_hat = self.v[k] / bias2;
            params[k] -= self.lr * m_hat / (v_hat.sqrt() + ADAM_EPSILON);
        }
    }
}

pub struct LinearGaussianModel {
    variant: ModelVariant,
    input_dims: Vec<usize>,
    heads: Vec<Head>,
    params: Vec<f64>,
    optimizer: Adam,
}

fn softplus(s: f64) -> f64 {
    s.max(0.0) + (-s.abs()).exp().ln_1p()
}

fn sigmoid(s: f64) -> f64 {
    1.0 / (1.0 + (-s).exp())
}

/// `params[..d] . x[row] + params[d]`.
fn affine(params: &[f64], x: &DMatrix<f64>, row: usize) -> f64 {
    let d = x.ncols();
    let mut z = params[d];
    for j in 0..d {
        z += params[j] * x[(row, j)];
    }
    z
}

fn concat_columns(inputs: &[DMatrix<f64>]) -> DMatrix<f64> {
    let nrows = inputs.first().map(|m| m.nrows()).unwrap_or(0);
    let ncols = inputs.iter().map(|m| m.ncols()).sum();
    let mut out = DMatrix::zeros(nrows, ncols);
    let mut offset = 0;
    for m in inputs {
        out.columns_mut(offset, m.ncols()).copy_from(m);
        offset += m.ncols();
    }
    out
}

impl LinearGaussianModel {
    pub fn new(
        variant: ModelVariant,
        input_dims: &[usize],
        lr: f64,
        seed: u64,
    ) -> EnsembleResult<Self> {
        if input_dims.is_empty() || input_dims.contains(&0) {
            return Err(EnsembleError::ShapeMismatch(format!(
                "every feature set needs at least one column, got dims {input_dims:?}"
            )));
        }

        let total_dim: usize = input_dims.iter().sum();
        let mut heads = Vec::with_capacity(input_dims.len());
        let mut offset = 0;
        for &dim in input_dims {
            let mean_dim = match variant {
                ModelVariant::IndependentHeads => dim,
                ModelVariant::Multivariate => total_dim,
            };
            let head = Head {
                mean_offset: offset,
                mean_dim,
                scale_offset: offset + mean_dim + 1,
                scale_dim: dim,
            };
            offset = head.scale_offset + dim + 1;
            heads.push(head);
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = vec![0.0; offset];
        for head in &heads {
            let limit = (6.0 / (head.mean_dim as f64 + 1.0)).sqrt();
            for p in &mut params[head.mean_offset..head.mean_offset + head.mean_dim] {
                *p = rng.gen_range(-limit..limit);
            }
            let limit = 0.1 * (6.0 / (head.scale_dim as f64 + 1.0)).sqrt();
            for p in &mut params[head.scale_offset..head.scale_offset + head.scale_dim] {
                *p = rng.gen_range(-limit..limit);
            }
            params[head.scale_offset + head.scale_dim] = UNIT_SCALE_BIAS;
        }

        Ok(Self {
            variant,
            input_dims: input_dims.to_vec(),
            heads,
            optimizer: Adam::new(lr, params.len()),
            params,
        })
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    fn architecture(&self) -> String {
        format!("linear_gaussian/{}", self.variant)
    }

    fn check_inputs(&self, inputs: &[DMatrix<f64>], n_target: Option<usize>) -> EnsembleResult<usize> {
        if inputs.len() != self.input_dims.len() {
            return Err(EnsembleError::ShapeMismatch(format!(
                "model expects {} feature sets, got {}",
                self.input_dims.len(),
                inputs.len()
            )));
        }
        let n = inputs[0].nrows();
        for (i, (m, &dim)) in inputs.iter().zip(&self.input_dims).enumerate() {
            if m.ncols() != dim || m.nrows() != n {
                return Err(EnsembleError::ShapeMismatch(format!(
                    "feature set {} is {}x{}, expected {}x{}",
                    i,
                    m.nrows(),
                    m.ncols(),
                    n,
                    dim
                )));
            }
        }
        if let Some(len) = n_target {
            if len != n {
                return Err(EnsembleError::ShapeMismatch(format!(
                    "{n} input rows but {len} targets"
                )));
            }
        }
        Ok(n)
    }

    fn joint_inputs(&self, inputs: &[DMatrix<f64>]) -> Option<DMatrix<f64>> {
        match self.variant {
            ModelVariant::IndependentHeads => None,
            ModelVariant::Multivariate => Some(concat_columns(inputs)),
        }
    }

    /// Returns `(mu, raw_scale)` for head `i` on `row`.
    fn head_output(
        &self,
        inputs: &[DMatrix<f64>],
        joint: Option<&DMatrix<f64>>,
        i: usize,
        row: usize,
    ) -> (f64, f64) {
        let head = self.heads[i];
        let mean_x = joint.unwrap_or(&inputs[i]);
        let mu = affine(
            &self.params[head.mean_offset..=head.mean_offset + head.mean_dim],
            mean_x,
            row,
        );
        let s = affine(
            &self.params[head.scale_offset..=head.scale_offset + head.scale_dim],
            &inputs[i],
            row,
        );
        (mu, s)
    }

    fn sample_nll(&self, inputs: &[DMatrix<f64>], joint: Option<&DMatrix<f64>>, y: f64, row: usize) -> f64 {
        (0..self.heads.len())
            .map(|i| {
                let (mu, s) = self.head_output(inputs, joint, i, row);
                let sigma = softplus(s) + MIN_STD;
                let z = y - mu;
                HALF_LN_TWO_PI + sigma.ln() + z * z / (2.0 * sigma * sigma)
            })
            .sum()
    }

    /// Accumulate the summed loss and its gradient over `rows`, then take one
    /// Adam step on the batch mean. Returns the summed loss.
    fn train_batch(
        &mut self,
        inputs: &[DMatrix<f64>],
        joint: Option<&DMatrix<f64>>,
        target: &DVector<f64>,
        rows: &[usize],
    ) -> f64 {
        let mut grads = vec![0.0; self.params.len()];
        let mut loss = 0.0;

        for &r in rows {
            let y = target[r];
            for (i, head) in self.heads.iter().enumerate() {
                let (mu, s) = self.head_output(inputs, joint, i, r);
                let sigma = softplus(s) + MIN_STD;
                let z = y - mu;
                let var = sigma * sigma;
                loss += HALF_LN_TWO_PI + sigma.ln() + z * z / (2.0 * var);

                let d_mu = -z / var;
                let d_s = (1.0 / sigma - z * z / (var * sigma)) * sigmoid(s);

                let mean_x = joint.unwrap_or(&inputs[i]);
                for j in 0..head.mean_dim {
                    grads[head.mean_offset + j] += d_mu * mean_x[(r, j)];
                }
                grads[head.mean_offset + head.mean_dim] += d_mu;

                let scale_x = &inputs[i];
                for j in 0..head.scale_dim {
                    grads[head.scale_offset + j] += d_s * scale_x[(r, j)];
                }
                grads[head.scale_offset + head.scale_dim] += d_s;
            }
        }

        let n = rows.len() as f64;
        for g in &mut grads {
            *g /= n;
        }
        self.optimizer.step(&mut self.params, &grads);
        loss
    }
}

impl ProbabilisticModel for LinearGaussianModel {
    fn predict(&self, inputs: &[DMatrix<f64>]) -> EnsembleResult<PredictionShape> {
        let n = self.check_inputs(inputs, None)?;
        let joint = self.joint_inputs(inputs);
        let k = self.heads.len();

        let prediction = match self.variant {
            ModelVariant::IndependentHeads => PredictionShape::PerFeatureSet(
                (0..k)
                    .map(|i| {
                        let outputs: Vec<(f64, f64)> = (0..n)
                            .map(|r| self.head_output(inputs, None, i, r))
                            .collect();
                        GaussianPrediction::new(
                            DVector::from_iterator(n, outputs.iter().map(|o| o.0)),
                            DVector::from_iterator(
                                n,
                                outputs.iter().map(|o| softplus(o.1) + MIN_STD),
                            ),
                        )
                    })
                    .collect(),
            ),
            ModelVariant::Multivariate => {
                let mut mean = DMatrix::zeros(n, k);
                let mut std_dev = DMatrix::zeros(n, k);
                for i in 0..k {
                    for r in 0..n {
                        let (mu, s) = self.head_output(inputs, joint.as_ref(), i, r);
                        mean[(r, i)] = mu;
                        std_dev[(r, i)] = softplus(s) + MIN_STD;
                    }
                }
                PredictionShape::Joint(JointGaussian { mean, std_dev })
            }
        };
        Ok(prediction)
    }

    fn fit_epoch(
        &mut self,
        inputs: &[DMatrix<f64>],
        target: &DVector<f64>,
        batch_size: usize,
        rng: &mut StdRng,
    ) -> EnsembleResult<f64> {
        let n = self.check_inputs(inputs, Some(target.len()))?;
        if n == 0 {
            return Err(EnsembleError::ShapeMismatch("empty training split".into()));
        }
        let joint = self.joint_inputs(inputs);

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);

        let mut total = 0.0;
        for batch in order.chunks(batch_size.max(1)) {
            let loss = self.train_batch(inputs, joint.as_ref(), target, batch);
            if !loss.is_finite() {
                return Err(EnsembleError::numerical(
                    0,
                    None,
                    format!("training loss diverged to {loss}"),
                ));
            }
            total += loss;
        }
        Ok(total / n as f64)
    }

    fn negative_log_likelihood(
        &self,
        inputs: &[DMatrix<f64>],
        target: &DVector<f64>,
    ) -> EnsembleResult<f64> {
        let n = self.check_inputs(inputs, Some(target.len()))?;
        if n == 0 {
            return Err(EnsembleError::ShapeMismatch("empty evaluation split".into()));
        }
        let joint = self.joint_inputs(inputs);
        let total: f64 = (0..n)
            .map(|r| self.sample_nll(inputs, joint.as_ref(), target[r], r))
            .sum();
        Ok(total / n as f64)
    }

    fn weights(&self) -> ModelWeights {
        ModelWeights {
            architecture: self.architecture(),
            input_dims: self.input_dims.clone(),
            params: self.params.clone(),
        }
    }

    fn set_weights(&mut self, weights: &ModelWeights) -> EnsembleResult<()> {
        if weights.architecture != self.architecture() {
            return Err(EnsembleError::ShapeMismatch(format!(
                "weights are for '{}', model is '{}'",
                weights.architecture,
                self.architecture()
            )));
        }
        if weights.input_dims != self.input_dims || weights.params.len() != self.params.len() {
            return Err(EnsembleError::ShapeMismatch(format!(
                "weights have dims {:?} with {} params, model has dims {:?} with {}",
                weights.input_dims,
                weights.params.len(),
                self.input_dims,
                self.params.len()
            )));
        }
        self.params.copy_from_slice(&weights.params);
        Ok(())
    }
}
