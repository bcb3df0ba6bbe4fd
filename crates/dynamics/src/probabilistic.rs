//! A single Gaussian transition/reward model.
//!
//! The model predicts the mean and a bounded log standard deviation of
//! `(next_observation - observation, reward)` from encoded features.

use crate::encoder::{Encoder, EncoderHandle, VectorEncoder};
use crate::error::{expect_shape, DynamicsError, Result};
use ml::nn::{Dense, Layer};
use ml::{Graph, Recorder, Tensor, TensorStore};
use rand::Rng;
use std::collections::HashMap;

/// `0.5 * ln(2 * pi)`.
const HALF_LN_2PI: f32 = 0.918_938_5;

/// Initial log-std bounds and the weight of the penalty that tightens them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeadConfig {
    pub init_max_logstd: f32,
    pub init_min_logstd: f32,
    pub bound_penalty: f32,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            init_max_logstd: 2.0,
            init_min_logstd: -10.0,
            bound_penalty: 0.01,
        }
    }
}

/// Output of a dynamics prediction.
#[derive(Clone, Debug)]
pub struct DynamicsPrediction {
    /// `[B, O]` predicted next observation.
    pub observation: Tensor,
    /// `[B, 1]` predicted reward.
    pub reward: Tensor,
    /// `[B, 1]` predictive variance, when requested.
    pub variance: Option<Tensor>,
}

pub struct ProbabilisticDynamics<E = VectorEncoder> {
    encoder: EncoderHandle<E>,
    mu: Dense,
    logstd: Dense,
    max_logstd: Tensor,
    min_logstd: Tensor,
    observation_size: usize,
    bound_penalty: f32,
}

impl<E: Encoder> ProbabilisticDynamics<E> {
    /// Builds a model on top of `encoder` with the default [`HeadConfig`].
    ///
    /// # Errors
    ///
    /// See [`ProbabilisticDynamics::with_config`].
    pub fn new(encoder: impl Into<EncoderHandle<E>>, rng: &mut impl Rng) -> Result<Self> {
        Self::with_config(encoder, HeadConfig::default(), rng)
    }

    /// # Errors
    ///
    /// [`DynamicsError::Configuration`] if the encoder ignores the action or
    /// the initial bounds are not ordered.
    pub fn with_config(encoder: impl Into<EncoderHandle<E>>, head: HeadConfig, rng: &mut impl Rng) -> Result<Self> {
        let encoder = encoder.into();
        let (action_input, feature_size, observation_size) =
            encoder.with(|e| (e.action_input(), e.feature_size(), e.observation_size()));
        if !action_input {
            return Err(DynamicsError::Configuration(
                "dynamics encoders must consume the action".into(),
            ));
        }
        if head.init_min_logstd >= head.init_max_logstd {
            return Err(DynamicsError::Configuration(format!(
                "init_min_logstd {} must be below init_max_logstd {}",
                head.init_min_logstd, head.init_max_logstd
            )));
        }
        let out_size = observation_size + 1;
        tracing::debug!(
            feature_size,
            observation_size,
            shared_encoder = encoder.is_shared(),
            "building probabilistic dynamics model"
        );
        Ok(Self {
            encoder,
            mu: Dense::xavier(feature_size, out_size, rng),
            logstd: Dense::xavier(feature_size, out_size, rng),
            max_logstd: Tensor::full(vec![1, out_size], head.init_max_logstd).with_grad(),
            min_logstd: Tensor::full(vec![1, out_size], head.init_min_logstd).with_grad(),
            observation_size,
            bound_penalty: head.bound_penalty,
        })
    }

    #[must_use]
    pub fn observation_size(&self) -> usize {
        self.observation_size
    }

    #[must_use]
    pub fn encoder(&self) -> &EncoderHandle<E> {
        &self.encoder
    }

    /// Current `(max_logstd, min_logstd)` bounds.
    #[must_use]
    pub fn logstd_bounds(&self) -> (&Tensor, &Tensor) {
        (&self.max_logstd, &self.min_logstd)
    }

    /// The mean and log-std heads, for callers that need to inspect or pin
    /// their weights.
    pub fn heads_mut(&mut self) -> (&mut Dense, &mut Dense) {
        (&mut self.mu, &mut self.logstd)
    }

    fn check_inputs(&self, observation: &Tensor, action: &Tensor) -> Result<usize> {
        let batch = observation.rows();
        expect_shape("observation", observation.shape(), batch, self.observation_size)?;
        if action.rows() != batch || action.shape().len() != 2 {
            return Err(DynamicsError::ShapeMismatch {
                what: "action",
                expected: vec![batch, action.cols()],
                actual: action.shape().to_vec(),
            });
        }
        Ok(batch)
    }

    /// Checks the batch shapes and returns the encoder features.
    pub fn encode(
        &self,
        observation: &Tensor,
        action: &Tensor,
        recorder: &mut impl Recorder,
        tensors: &mut TensorStore,
    ) -> Result<Tensor> {
        self.check_inputs(observation, action)?;
        self.encoder
            .with(|e| e.encode(observation, Some(action), recorder, tensors))
    }

    /// Mean and bounded log-std of the `[B, O + 1]` output distribution.
    ///
    /// The log-std is soft-clamped into `(min_logstd, max_logstd)` so the
    /// variance stays finite and strictly positive.
    pub fn compute_stats(
        &self,
        observation: &Tensor,
        action: &Tensor,
        recorder: &mut impl Recorder,
        tensors: &mut TensorStore,
    ) -> Result<(Tensor, Tensor)> {
        let h = self.encode(observation, action, recorder, tensors)?;
        self.heads(&h, recorder, tensors)
    }

    fn heads(&self, h: &Tensor, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<(Tensor, Tensor)> {
        let mu = self.mu.forward(h, recorder, tensors)?;
        let raw = self.logstd.forward(h, recorder, tensors)?;

        // max - softplus(max - raw)
        let upper = raw
            .neg(recorder, tensors)
            .add_broadcast(&self.max_logstd, recorder, tensors)?
            .softplus(recorder, tensors)
            .neg(recorder, tensors)
            .add_broadcast(&self.max_logstd, recorder, tensors)?;
        // min + softplus(upper - min)
        let neg_min = self.min_logstd.neg(recorder, tensors);
        let logstd = upper
            .add_broadcast(&neg_min, recorder, tensors)?
            .softplus(recorder, tensors)
            .add_broadcast(&self.min_logstd, recorder, tensors)?;
        Ok((mu, logstd))
    }

    /// Inference-mode prediction.
    ///
    /// The predicted observation is `observation + delta`; with
    /// `with_variance` the variance is the sum of the per-dimension variances
    /// over the observation and reward outputs.
    ///
    /// # Errors
    ///
    /// Shape errors for mismatched observation or action batches.
    pub fn predict(&self, observation: &Tensor, action: &Tensor, with_variance: bool) -> Result<DynamicsPrediction> {
        let mut tensors = HashMap::new();
        self.predict_recorded(observation, action, with_variance, &mut Graph::new(), &mut tensors)
    }

    /// [`ProbabilisticDynamics::predict`] recorded into a caller's recorder,
    /// so the prediction can be differentiated.
    pub fn predict_recorded(
        &self,
        observation: &Tensor,
        action: &Tensor,
        with_variance: bool,
        recorder: &mut impl Recorder,
        tensors: &mut TensorStore,
    ) -> Result<DynamicsPrediction> {
        let (mu, logstd) = self.compute_stats(observation, action, recorder, tensors)?;
        let o = self.observation_size;
        let delta = mu.slice_cols(0, o, recorder, tensors)?;
        let next_observation = observation.add(&delta, recorder, tensors)?;
        let reward = mu.slice_cols(o, o + 1, recorder, tensors)?;
        let variance = if with_variance {
            let variance = logstd
                .mul_scalar(2.0, recorder, tensors)
                .exp(recorder, tensors)
                .sum_cols(recorder, tensors)?;
            Some(variance)
        } else {
            None
        };
        tracing::trace!(batch = observation.rows(), with_variance, "dynamics prediction");
        Ok(DynamicsPrediction {
            observation: next_observation,
            reward,
            variance,
        })
    }

    /// Per-sample Gaussian negative log-likelihood of the observed transition,
    /// `[B, 1]`, summed over the observation and reward dimensions and
    /// including the log-std bound penalty.
    ///
    /// The result is not reduced over the batch. Record into a
    /// [`ml::Tape`] to differentiate it. Under a training recorder, batch-norm
    /// layers in the encoder fold this batch into their running statistics;
    /// under a [`Graph`] the model is left untouched.
    ///
    /// # Errors
    ///
    /// Shape errors when `reward` is not `[B, 1]` or `next_observation` is
    /// not `[B, O]`.
    pub fn compute_error(
        &self,
        observation: &Tensor,
        action: &Tensor,
        reward: &Tensor,
        next_observation: &Tensor,
        recorder: &mut impl Recorder,
        tensors: &mut TensorStore,
    ) -> Result<Tensor> {
        self.check_targets(observation, action, reward, next_observation)?;
        let h = self.encode(observation, action, recorder, tensors)?;
        self.error_from_features(&h, observation, reward, next_observation, recorder, tensors)
    }

    pub(crate) fn check_targets(
        &self,
        observation: &Tensor,
        action: &Tensor,
        reward: &Tensor,
        next_observation: &Tensor,
    ) -> Result<()> {
        let batch = self.check_inputs(observation, action)?;
        expect_shape("reward", reward.shape(), batch, 1)?;
        expect_shape("next_observation", next_observation.shape(), batch, self.observation_size)
    }

    /// Loss from features already produced by this model's encoder. Inputs
    /// must have passed [`ProbabilisticDynamics::check_targets`].
    pub(crate) fn error_from_features(
        &self,
        h: &Tensor,
        observation: &Tensor,
        reward: &Tensor,
        next_observation: &Tensor,
        recorder: &mut impl Recorder,
        tensors: &mut TensorStore,
    ) -> Result<Tensor> {
        let (mu, logstd) = self.heads(h, recorder, tensors)?;
        let target = next_observation
            .sub(observation, recorder, tensors)?
            .concat_cols(reward, recorder, tensors)?;
        let diff = target.sub(&mu, recorder, tensors)?;
        let inv_var = logstd.mul_scalar(-2.0, recorder, tensors).exp(recorder, tensors);
        let nll = diff
            .mul(&diff, recorder, tensors)?
            .mul(&inv_var, recorder, tensors)?
            .mul_scalar(0.5, recorder, tensors)
            .add(&logstd, recorder, tensors)?
            .add_scalar(HALF_LN_2PI, recorder, tensors)
            .sum_cols(recorder, tensors)?;

        let bound = self
            .max_logstd
            .reduce_sum(recorder, tensors)
            .sub(&self.min_logstd.reduce_sum(recorder, tensors), recorder, tensors)?
            .mul_scalar(self.bound_penalty, recorder, tensors);
        let loss = nll.add_broadcast(&bound, recorder, tensors)?;

        if !loss.is_finite() {
            tracing::warn!(batch = observation.rows(), "dynamics loss contains non-finite values");
        }
        Ok(loss)
    }

    /// Visits every trainable tensor of the encoder, then the heads and bounds.
    pub fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        self.encoder.with(|e| e.params().into_iter().for_each(&mut *f));
        self.visit_head_params(f);
    }

    /// Visits the tensors this model always owns: both heads and the bounds.
    pub fn visit_head_params(&self, f: &mut dyn FnMut(&Tensor)) {
        for p in [&self.mu.w, &self.mu.b, &self.logstd.w, &self.logstd.b, &self.max_logstd, &self.min_logstd] {
            f(p);
        }
    }

    pub fn visit_params_mut(&mut self, f: &mut dyn FnMut(&mut Tensor)) {
        self.encoder.with_mut(|e| e.params_mut().into_iter().for_each(&mut *f));
        for p in [
            &mut self.mu.w,
            &mut self.mu.b,
            &mut self.logstd.w,
            &mut self.logstd.b,
            &mut self.max_logstd,
            &mut self.min_logstd,
        ] {
            f(p);
        }
    }

    /// Copies gradients from a backward pass onto this model's parameters.
    pub fn pull_grads(&mut self, tensors: &TensorStore) {
        self.visit_params_mut(&mut |p| p.pull_grad(tensors));
    }
}
