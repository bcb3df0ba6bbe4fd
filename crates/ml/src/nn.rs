use crate::error::Result;
use crate::recorder::Recorder;
use crate::tensor::{Tensor, TensorStore};
use parking_lot::Mutex;
use rand::{distributions::Uniform, Rng};

/// A differentiable layer with trainable parameters.
pub trait Layer {
    fn forward(&self, x: &Tensor, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor>;
    fn params(&self) -> Vec<&Tensor>;
    fn params_mut(&mut self) -> Vec<&mut Tensor>;
}

/// A fully connected neural network layer.
///
/// Not `Clone`: a copy would share parameter ids with the original. Use
/// [`Dense::duplicate`].
#[derive(Debug)]
pub struct Dense {
    /// The weight matrix for the layer, `[out_dim, in_dim]`.
    pub w: Tensor,
    /// The bias vector for the layer.
    pub b: Tensor,
    /// The number of input dimensions.
    pub in_dim: usize,
    /// The number of output dimensions.
    pub out_dim: usize,
}

impl Dense {
    /// Creates a new `Dense` layer with the given weights and biases.
    ///
    /// # Errors
    ///
    /// Fails if `weights` is not `in_dim * out_dim` long or `bias` is not
    /// `out_dim` long.
    pub fn new(weights: Vec<f32>, bias: Vec<f32>, in_dim: usize, out_dim: usize) -> Result<Self> {
        Ok(Self {
            w: Tensor::from_vec(vec![out_dim, in_dim], weights)?.with_grad(),
            b: Tensor::from_vec(vec![out_dim], bias)?.with_grad(),
            in_dim,
            out_dim,
        })
    }

    /// Glorot-uniform weights and zero bias.
    pub fn xavier(in_dim: usize, out_dim: usize, rng: &mut impl Rng) -> Self {
        let limit = (6.0f32 / (in_dim as f32 + out_dim as f32)).sqrt();
        let dist = Uniform::new(-limit, limit);
        let weights: Vec<f32> = (0..in_dim * out_dim).map(|_| rng.sample(dist)).collect();
        Self {
            w: Tensor::raw(vec![out_dim, in_dim], weights).with_grad(),
            b: Tensor::zeros(vec![out_dim]).with_grad(),
            in_dim,
            out_dim,
        }
    }

    /// Same weights, fresh parameter ids.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            w: self.w.duplicate(),
            b: self.b.duplicate(),
            in_dim: self.in_dim,
            out_dim: self.out_dim,
        }
    }
}

impl Layer for Dense {
    fn forward(&self, x: &Tensor, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor> {
        let wx = self.w.matmul(x, recorder, tensors)?;
        wx.add_broadcast(&self.b, recorder, tensors)
    }

    fn params(&self) -> Vec<&Tensor> {
        vec![&self.w, &self.b]
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.w, &mut self.b]
    }
}

#[derive(Clone, Debug)]
struct RunningStats {
    mean: Vec<f32>,
    var: Vec<f32>,
}

/// Batch normalization over the feature dimension of a `[B, D]` input.
///
/// Under a training recorder the batch statistics are used and folded into
/// the running statistics; otherwise the running statistics are used.
#[derive(Debug)]
pub struct BatchNorm1d {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub dim: usize,
    pub momentum: f32,
    pub eps: f32,
    running: Mutex<RunningStats>,
}

impl BatchNorm1d {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            gamma: Tensor::full(vec![dim], 1.0).with_grad(),
            beta: Tensor::zeros(vec![dim]).with_grad(),
            dim,
            momentum: 0.1,
            eps: 1e-5,
            running: Mutex::new(RunningStats {
                mean: vec![0.0; dim],
                var: vec![1.0; dim],
            }),
        }
    }

    /// Snapshot of `(running_mean, running_var)`.
    #[must_use]
    pub fn running_stats(&self) -> (Vec<f32>, Vec<f32>) {
        let stats = self.running.lock();
        (stats.mean.clone(), stats.var.clone())
    }

    /// Same affine parameters and running statistics, fresh parameter ids.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            gamma: self.gamma.duplicate(),
            beta: self.beta.duplicate(),
            dim: self.dim,
            momentum: self.momentum,
            eps: self.eps,
            running: Mutex::new(self.running.lock().clone()),
        }
    }

    fn update_running(&self, x: &Tensor) {
        let rows = x.rows();
        let (mean, var) = crate::ops::column_stats(&x.data, rows, self.dim);
        // running variance tracks the unbiased estimate
        let correction = if rows > 1 { rows as f32 / (rows - 1) as f32 } else { 1.0 };
        let mut stats = self.running.lock();
        for c in 0..self.dim {
            stats.mean[c] = (1.0 - self.momentum) * stats.mean[c] + self.momentum * mean[c];
            stats.var[c] = (1.0 - self.momentum) * stats.var[c] + self.momentum * var[c] * correction;
        }
    }
}

impl Layer for BatchNorm1d {
    fn forward(&self, x: &Tensor, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor> {
        let x_hat = if recorder.is_training() {
            let x_hat = x.batch_normalize(self.eps, recorder, tensors)?;
            self.update_running(x);
            x_hat
        } else {
            let (mean, var) = self.running_stats();
            let scale: Vec<f32> = var.iter().map(|v| 1.0 / (v + self.eps).sqrt()).collect();
            let shift: Vec<f32> = mean.iter().zip(&scale).map(|(m, s)| -m * s).collect();
            let scale = Tensor::raw(vec![self.dim], scale);
            let shift = Tensor::raw(vec![self.dim], shift);
            x.mul_broadcast(&scale, recorder, tensors)?
                .add_broadcast(&shift, recorder, tensors)?
        };
        x_hat
            .mul_broadcast(&self.gamma, recorder, tensors)?
            .add_broadcast(&self.beta, recorder, tensors)
    }

    fn params(&self) -> Vec<&Tensor> {
        vec![&self.gamma, &self.beta]
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.gamma, &mut self.beta]
    }
}
