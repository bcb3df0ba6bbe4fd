#![allow(dead_code)]

use dynamics::encoder::Encoder;
use dynamics::Result;
use ml::nn::{Dense, Layer};
use ml::{Adam, Recorder, Tape, Tensor, TensorStore};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

/// One linear layer over `concat(observation, action)`.
pub struct DummyEncoder {
    pub observation_size: usize,
    pub action_size: usize,
    pub dense: Dense,
    pub action_input: bool,
}

impl DummyEncoder {
    pub fn new(observation_size: usize, action_size: usize, feature_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self {
            observation_size,
            action_size,
            dense: Dense::xavier(observation_size + action_size, feature_size, &mut rng),
            action_input: true,
        }
    }

    /// An encoder over an existing layer, keeping its parameter tensors.
    pub fn from_dense(observation_size: usize, action_size: usize, dense: Dense) -> Self {
        Self {
            observation_size,
            action_size,
            dense,
            action_input: true,
        }
    }

    pub fn without_action(mut self) -> Self {
        self.action_input = false;
        self
    }
}

impl Encoder for DummyEncoder {
    fn observation_size(&self) -> usize {
        self.observation_size
    }

    fn action_size(&self) -> usize {
        self.action_size
    }

    fn feature_size(&self) -> usize {
        self.dense.out_dim
    }

    fn action_input(&self) -> bool {
        self.action_input
    }

    fn encode(
        &self,
        observation: &Tensor,
        action: Option<&Tensor>,
        recorder: &mut impl Recorder,
        tensors: &mut TensorStore,
    ) -> Result<Tensor> {
        let x = match action {
            Some(action) => observation.concat_cols(action, recorder, tensors)?,
            None => observation.clone(),
        };
        Ok(self.dense.forward(&x, recorder, tensors)?)
    }

    fn params(&self) -> Vec<&Tensor> {
        self.dense.params()
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        self.dense.params_mut()
    }
}

pub fn close(a: f32, b: f32, tol: f32) -> bool {
    (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs()))
}

pub struct Batch {
    pub observation: Tensor,
    pub action: Tensor,
    pub reward: Tensor,
    pub next_observation: Tensor,
}

pub fn random_batch(batch: usize, observation_size: usize, action_size: usize, seed: u64) -> Batch {
    let mut rng = StdRng::seed_from_u64(seed);
    Batch {
        observation: Tensor::rand_uniform(vec![batch, observation_size], -1.0, 1.0, &mut rng),
        action: Tensor::rand_uniform(vec![batch, action_size], -1.0, 1.0, &mut rng),
        reward: Tensor::rand_uniform(vec![batch, 1], -1.0, 1.0, &mut rng),
        next_observation: Tensor::rand_uniform(vec![batch, observation_size], -1.0, 1.0, &mut rng),
    }
}

/// Runs one Adam step on the batch mean of `loss_fn` and asserts that every
/// parameter tensor visited by `visit` changed.
pub fn check_parameter_updates<M>(
    model: &mut M,
    visit: impl Fn(&mut M, &mut dyn FnMut(&mut Tensor)),
    loss_fn: impl Fn(&M, &mut Tape, &mut TensorStore) -> Result<Tensor>,
) {
    let mut before = Vec::new();
    visit(&mut *model, &mut |p| before.push((p.id, p.data.clone())));
    assert!(!before.is_empty(), "model has no parameters");

    let mut tape = Tape::default();
    let mut tensors = HashMap::new();
    let loss = loss_fn(&*model, &mut tape, &mut tensors).expect("loss");
    let mean = loss.reduce_mean(&mut tape, &mut tensors);
    tape.backward(&mean, &mut tensors).expect("backward");

    let mut optimizer = Adam::new(1e-3);
    optimizer.begin_step();
    visit(&mut *model, &mut |p| {
        p.pull_grad(&tensors);
        optimizer.update(p);
    });

    let mut after = HashMap::new();
    visit(&mut *model, &mut |p| {
        after.insert(p.id, p.data.clone());
    });
    for (id, data) in before {
        assert_ne!(after[&id], data, "parameter {id} was not updated");
    }
}
