//! Feature encoders consumed by the dynamics models.
//!
//! A dynamics model only needs something that turns `(observation, action)`
//! into a fixed-width feature vector; [`Encoder`] is that seam.
//! [`VectorEncoder`] is the MLP used by the factory.

use crate::error::{expect_shape, DynamicsError, Result};
use ml::nn::{BatchNorm1d, Dense, Layer};
use ml::{Recorder, Tensor, TensorStore};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Maps `(observation[, action])` batches to `[B, feature_size]` features.
pub trait Encoder {
    fn observation_size(&self) -> usize;
    fn action_size(&self) -> usize;
    fn feature_size(&self) -> usize;
    /// Whether [`Encoder::encode`] consumes the action.
    fn action_input(&self) -> bool;

    fn encode(
        &self,
        observation: &Tensor,
        action: Option<&Tensor>,
        recorder: &mut impl Recorder,
        tensors: &mut TensorStore,
    ) -> Result<Tensor>;

    fn params(&self) -> Vec<&Tensor>;
    fn params_mut(&mut self) -> Vec<&mut Tensor>;
}

/// An encoder owned by one model, or shared between several.
///
/// Shared encoders live behind a lock so an optimizer can still update
/// them; the lock lives as long as the longest-lived model holding it.
pub enum EncoderHandle<E> {
    Owned(E),
    Shared(Arc<RwLock<E>>),
}

impl<E> EncoderHandle<E> {
    pub fn with<R>(&self, f: impl FnOnce(&E) -> R) -> R {
        match self {
            EncoderHandle::Owned(encoder) => f(encoder),
            EncoderHandle::Shared(encoder) => f(&encoder.read()),
        }
    }

    pub fn with_mut<R>(&mut self, f: impl FnOnce(&mut E) -> R) -> R {
        match self {
            EncoderHandle::Owned(encoder) => f(encoder),
            EncoderHandle::Shared(encoder) => f(&mut encoder.write()),
        }
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self, EncoderHandle::Shared(_))
    }

    /// Whether both handles point at the same shared encoder.
    #[must_use]
    pub fn shares_with(&self, other: &Self) -> bool {
        match (self, other) {
            (EncoderHandle::Shared(a), EncoderHandle::Shared(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<E> From<E> for EncoderHandle<E> {
    fn from(encoder: E) -> Self {
        EncoderHandle::Owned(encoder)
    }
}

impl<E> From<Arc<RwLock<E>>> for EncoderHandle<E> {
    fn from(encoder: Arc<RwLock<E>>) -> Self {
        EncoderHandle::Shared(encoder)
    }
}

/// How actions are fed to the model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionSpace {
    /// `[B, action_size]` real-valued actions.
    #[default]
    Continuous,
    /// `[B, 1]` integer indices in `[0, action_size)`, one-hot encoded.
    Discrete,
}

impl ActionSpace {
    /// Width of the action batch callers pass in.
    #[must_use]
    pub fn input_width(self, action_size: usize) -> usize {
        match self {
            ActionSpace::Continuous => action_size,
            ActionSpace::Discrete => 1,
        }
    }
}

/// Turns a caller's action batch into the `[B, action_size]` block that is
/// concatenated with the observation.
///
/// # Errors
///
/// [`DynamicsError::ShapeMismatch`] for a badly shaped batch and
/// [`DynamicsError::InvalidAction`] for a discrete index that is not an
/// integer in range.
pub fn action_features(action: &Tensor, space: ActionSpace, action_size: usize, batch: usize) -> Result<Tensor> {
    expect_shape("action", action.shape(), batch, space.input_width(action_size))?;
    match space {
        ActionSpace::Continuous => Ok(action.clone()),
        ActionSpace::Discrete => {
            let mut one_hot = vec![0.0f32; batch * action_size];
            for (row, &index) in action.data().iter().enumerate() {
                if index.fract() != 0.0 || index < 0.0 || index >= action_size as f32 {
                    return Err(DynamicsError::InvalidAction { index, action_size });
                }
                one_hot[row * action_size + index as usize] = 1.0;
            }
            Ok(Tensor::from_vec(vec![batch, action_size], one_hot)?)
        }
    }
}

#[derive(Debug)]
struct Block {
    dense: Dense,
    norm: Option<BatchNorm1d>,
}

/// MLP over `concat(observation, action)`: each hidden layer is
/// `Dense -> ReLU`, followed by batch normalization when enabled.
///
/// Use [`VectorEncoder::duplicate`] to give another model a copy of the same
/// weights; a copy that kept the parameter ids would be trained as one
/// encoder.
#[derive(Debug)]
pub struct VectorEncoder {
    observation_size: usize,
    action_size: usize,
    action_space: ActionSpace,
    blocks: Vec<Block>,
}

impl VectorEncoder {
    /// # Errors
    ///
    /// Returns [`DynamicsError::Configuration`] when `hidden_units` is empty
    /// or contains a zero width, or when a size is zero.
    pub fn new(
        observation_size: usize,
        action_size: usize,
        action_space: ActionSpace,
        hidden_units: &[usize],
        use_batch_norm: bool,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if observation_size == 0 || action_size == 0 {
            return Err(DynamicsError::Configuration(
                "observation and action sizes must be positive".into(),
            ));
        }
        if hidden_units.is_empty() || hidden_units.contains(&0) {
            return Err(DynamicsError::Configuration(format!(
                "hidden_units must be non-empty positive widths, got {hidden_units:?}"
            )));
        }
        let mut in_dim = observation_size + action_size;
        let mut blocks = Vec::with_capacity(hidden_units.len());
        for &units in hidden_units {
            blocks.push(Block {
                dense: Dense::xavier(in_dim, units, rng),
                norm: use_batch_norm.then(|| BatchNorm1d::new(units)),
            });
            in_dim = units;
        }
        Ok(Self {
            observation_size,
            action_size,
            action_space,
            blocks,
        })
    }

    #[must_use]
    pub fn action_space(&self) -> ActionSpace {
        self.action_space
    }

    #[must_use]
    pub fn uses_batch_norm(&self) -> bool {
        self.blocks.iter().any(|b| b.norm.is_some())
    }

    /// `(running_mean, running_var)` of every batch-norm layer, in order.
    #[must_use]
    pub fn running_stats(&self) -> Vec<(Vec<f32>, Vec<f32>)> {
        self.blocks
            .iter()
            .filter_map(|b| b.norm.as_ref().map(BatchNorm1d::running_stats))
            .collect()
    }

    /// Same weights and running statistics with fresh parameter ids.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            observation_size: self.observation_size,
            action_size: self.action_size,
            action_space: self.action_space,
            blocks: self
                .blocks
                .iter()
                .map(|b| Block {
                    dense: b.dense.duplicate(),
                    norm: b.norm.as_ref().map(BatchNorm1d::duplicate),
                })
                .collect(),
        }
    }
}

impl Encoder for VectorEncoder {
    fn observation_size(&self) -> usize {
        self.observation_size
    }

    fn action_size(&self) -> usize {
        self.action_size
    }

    fn feature_size(&self) -> usize {
        self.blocks.last().map_or(0, |b| b.dense.out_dim)
    }

    fn action_input(&self) -> bool {
        true
    }

    fn encode(
        &self,
        observation: &Tensor,
        action: Option<&Tensor>,
        recorder: &mut impl Recorder,
        tensors: &mut TensorStore,
    ) -> Result<Tensor> {
        let batch = observation.rows();
        expect_shape("observation", observation.shape(), batch, self.observation_size)?;
        let action = action.ok_or_else(|| {
            DynamicsError::Configuration("VectorEncoder requires an action batch".into())
        })?;
        let action = action_features(action, self.action_space, self.action_size, batch)?;

        let mut h = observation.concat_cols(&action, recorder, tensors)?;
        for block in &self.blocks {
            h = block.dense.forward(&h, recorder, tensors)?.relu(recorder, tensors);
            if let Some(norm) = &block.norm {
                h = norm.forward(&h, recorder, tensors)?;
            }
        }
        Ok(h)
    }

    fn params(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        for block in &self.blocks {
            out.extend(block.dense.params());
            if let Some(norm) = &block.norm {
                out.extend(norm.params());
            }
        }
        out
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        let mut out = Vec::new();
        for block in &mut self.blocks {
            out.extend(block.dense.params_mut());
            if let Some(norm) = &mut block.norm {
                out.extend(norm.params_mut());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ml::Graph;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    #[test]
    fn discrete_actions_are_one_hot() {
        let action = Tensor::from_vec(vec![3, 1], vec![2.0, 0.0, 1.0]).unwrap();
        let encoded = action_features(&action, ActionSpace::Discrete, 3, 3).unwrap();
        assert_eq!(encoded.shape(), &[3, 3]);
        assert_eq!(encoded.data(), &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn discrete_index_out_of_range() {
        let action = Tensor::from_vec(vec![2, 1], vec![0.0, 2.0]).unwrap();
        assert!(matches!(
            action_features(&action, ActionSpace::Discrete, 2, 2),
            Err(DynamicsError::InvalidAction { action_size: 2, .. })
        ));
        let fractional = Tensor::from_vec(vec![1, 1], vec![0.5]).unwrap();
        assert!(action_features(&fractional, ActionSpace::Discrete, 2, 1).is_err());
    }

    #[test]
    fn continuous_width_is_checked() {
        let action = Tensor::zeros(vec![4, 3]);
        assert!(matches!(
            action_features(&action, ActionSpace::Continuous, 2, 4),
            Err(DynamicsError::ShapeMismatch { what: "action", .. })
        ));
    }

    #[test]
    fn vector_encoder_layout() {
        let mut rng = StdRng::seed_from_u64(0);
        let encoder = VectorEncoder::new(5, 2, ActionSpace::Continuous, &[16, 8], true, &mut rng).unwrap();
        assert_eq!(encoder.feature_size(), 8);
        assert!(encoder.uses_batch_norm());
        // dense w, b + gamma, beta per block
        assert_eq!(encoder.params().len(), 8);

        let obs = Tensor::zeros(vec![4, 5]);
        let act = Tensor::zeros(vec![4, 2]);
        let h = encoder.encode(&obs, Some(&act), &mut Graph::new(), &mut HashMap::new()).unwrap();
        assert_eq!(h.shape(), &[4, 8]);
    }

    #[test]
    fn empty_hidden_units_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            VectorEncoder::new(5, 2, ActionSpace::Continuous, &[], false, &mut rng),
            Err(DynamicsError::Configuration(_))
        ));
    }

    #[test]
    fn shared_handle_sees_updates() {
        let mut rng = StdRng::seed_from_u64(0);
        let encoder = VectorEncoder::new(2, 1, ActionSpace::Continuous, &[4], false, &mut rng).unwrap();
        let shared = Arc::new(RwLock::new(encoder));
        let mut a: EncoderHandle<VectorEncoder> = shared.clone().into();
        let b: EncoderHandle<VectorEncoder> = shared.into();
        a.with_mut(|e| e.params_mut()[0].data[0] = 42.0);
        assert_eq!(b.with(|e| e.params()[0].data[0]), 42.0);
        assert!(a.is_shared() && b.is_shared());
        assert!(a.shares_with(&b));
    }

    #[test]
    fn duplicate_gets_fresh_ids() {
        let mut rng = StdRng::seed_from_u64(1);
        let encoder = VectorEncoder::new(2, 1, ActionSpace::Continuous, &[4], true, &mut rng).unwrap();
        let copy = encoder.duplicate();
        for (a, b) in encoder.params().iter().zip(copy.params()) {
            assert_eq!(a.data, b.data);
            assert_ne!(a.id, b.id);
        }
        assert_eq!(encoder.running_stats(), copy.running_stats());

        let owned: EncoderHandle<VectorEncoder> = encoder.into();
        let other: EncoderHandle<VectorEncoder> = copy.into();
        assert!(!owned.shares_with(&other));
    }
}
