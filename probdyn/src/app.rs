//! # probdyn application logic
//!
//! [`run`] fits an ensemble of probabilistic dynamics models to random-action
//! transitions from a [`RollingSphereEnv`] and compares the ensemble's
//! uncertainty on the training distribution against inputs far outside it.

use crate::env::{Env, RollingSphereEnv};
use anyhow::{bail, Context, Result};
use clap::Parser;
use dynamics::{build_ensemble, DynamicsConfig, EnsembleDynamics, VarianceType, VectorEncoder};
use ml::{Adam, Graph, Tape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::PathBuf;

/// Episodes are cut after this many steps so the data covers the start state.
const MAX_EPISODE_STEPS: usize = 200;

#[derive(Parser, Debug, Clone)]
#[command(name = "probdyn", about = "Fit an ensemble dynamics model and report its uncertainty")]
pub struct Args {
    /// JSON `DynamicsConfig`; the environment's sizes are used when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, default_value_t = 500)]
    pub steps: usize,
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 4096)]
    pub transitions: usize,
    /// `max` or `data`; overrides the config.
    #[arg(long)]
    pub variance_type: Option<VarianceType>,
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    #[arg(long, default_value_t = 1e-3)]
    pub lr: f32,
}

/// Outcome of a training run.
#[derive(Clone, Debug)]
pub struct Report {
    pub initial_loss: f32,
    pub final_loss: f32,
    pub in_distribution_variance: f32,
    pub out_of_distribution_variance: f32,
}

impl Report {
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "initial_loss": self.initial_loss,
            "final_loss": self.final_loss,
            "in_distribution_variance": self.in_distribution_variance,
            "out_of_distribution_variance": self.out_of_distribution_variance,
        })
    }
}

/// Flat storage for `(s, a, r, s')` tuples.
#[derive(Clone, Debug, Default)]
pub struct Transitions {
    obs_size: usize,
    action_size: usize,
    observations: Vec<f32>,
    actions: Vec<f32>,
    rewards: Vec<f32>,
    next_observations: Vec<f32>,
}

/// One minibatch as model inputs.
pub struct Batch {
    pub observation: Tensor,
    pub action: Tensor,
    pub reward: Tensor,
    pub next_observation: Tensor,
}

impl Transitions {
    #[must_use]
    pub fn new(obs_size: usize, action_size: usize) -> Self {
        Self {
            obs_size,
            action_size,
            ..Self::default()
        }
    }

    pub fn push(&mut self, observation: &[f32], action: &[f32], reward: f32, next_observation: &[f32]) {
        self.observations.extend_from_slice(observation);
        self.actions.extend_from_slice(action);
        self.rewards.push(reward);
        self.next_observations.extend_from_slice(next_observation);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    /// Gathers the given rows into a batch.
    ///
    /// # Errors
    ///
    /// Fails if an index is out of range.
    pub fn batch(&self, indices: &[usize]) -> Result<Batch> {
        let (o, a) = (self.obs_size, self.action_size);
        let mut observation = Vec::with_capacity(indices.len() * o);
        let mut action = Vec::with_capacity(indices.len() * a);
        let mut reward = Vec::with_capacity(indices.len());
        let mut next_observation = Vec::with_capacity(indices.len() * o);
        for &i in indices {
            if i >= self.len() {
                bail!("transition {i} out of range for {} transitions", self.len());
            }
            observation.extend_from_slice(&self.observations[i * o..(i + 1) * o]);
            action.extend_from_slice(&self.actions[i * a..(i + 1) * a]);
            reward.push(self.rewards[i]);
            next_observation.extend_from_slice(&self.next_observations[i * o..(i + 1) * o]);
        }
        let n = indices.len();
        Ok(Batch {
            observation: Tensor::from_vec(vec![n, o], observation)?,
            action: Tensor::from_vec(vec![n, a], action)?,
            reward: Tensor::from_vec(vec![n, 1], reward)?,
            next_observation: Tensor::from_vec(vec![n, o], next_observation)?,
        })
    }
}

/// Rolls out uniformly random actions in `[-1, 1]`.
pub fn collect_transitions(env: &mut impl Env, count: usize, rng: &mut impl Rng) -> Transitions {
    let mut data = Transitions::new(env.obs_size(), env.action_size());
    let mut observation = env.reset();
    let mut episode_steps = 0;
    for _ in 0..count {
        let action: f32 = rng.gen_range(-1.0..=1.0);
        let (next_observation, reward, done) = env.step(action);
        data.push(&observation, &[action], reward, &next_observation);
        episode_steps += 1;
        if done || episode_steps >= MAX_EPISODE_STEPS {
            observation = env.reset();
            episode_steps = 0;
        } else {
            observation = next_observation;
        }
    }
    data
}

/// Mean per-sample ensemble loss over all of `data`.
///
/// # Errors
///
/// Propagates model shape errors.
pub fn dataset_loss(ensemble: &EnsembleDynamics<VectorEncoder>, data: &Transitions) -> Result<f32> {
    let indices: Vec<usize> = (0..data.len()).collect();
    let batch = data.batch(&indices)?;
    let mut graph = Graph::new();
    let mut tensors = HashMap::new();
    let loss = ensemble
        .compute_error(
            &batch.observation,
            &batch.action,
            &batch.reward,
            &batch.next_observation,
            &mut graph,
            &mut tensors,
        )?
        .reduce_mean(&mut graph, &mut tensors);
    Ok(loss.data()[0])
}

fn mean_variance(
    ensemble: &EnsembleDynamics<VectorEncoder>,
    observation: &Tensor,
    action: &Tensor,
    variance_type: VarianceType,
) -> Result<f32> {
    let variance = ensemble
        .predict(observation, action, true, variance_type)?
        .variance
        .context("ensemble returned no variance")?;
    Ok(variance.data().iter().sum::<f32>() / variance.len().max(1) as f32)
}

/// Trains an ensemble built from `config` and reports how its uncertainty
/// separates seen from unseen inputs.
///
/// # Errors
///
/// Returns an error if the config does not match the environment or training
/// hits a model error.
pub fn train(config: &DynamicsConfig, args: &Args) -> Result<Report> {
    let mut env = RollingSphereEnv::new();
    if config.observation_size()? != env.obs_size() || config.action_size != env.action_size() {
        bail!(
            "config expects observation {:?} and action size {}, environment has {} and {}",
            config.observation_shape,
            config.action_size,
            env.obs_size(),
            env.action_size()
        );
    }
    if config.discrete_action {
        bail!("the rolling sphere environment has a continuous action");
    }
    if args.batch_size == 0 || args.transitions == 0 {
        bail!("batch size and transition count must be positive");
    }
    let variance_type = args.variance_type.unwrap_or(config.variance_type);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let data = collect_transitions(&mut env, args.transitions, &mut rng);
    tracing::info!(transitions = data.len(), "collected random-action transitions");

    let mut ensemble = build_ensemble(config)?;
    tracing::info!(
        members = ensemble.len(),
        parameters = ensemble.param_count(),
        %variance_type,
        "built ensemble"
    );

    let initial_loss = dataset_loss(&ensemble, &data)?;
    let mut optimizer = Adam::new(args.lr);
    let log_every = (args.steps / 10).max(1);
    for step in 0..args.steps {
        let indices: Vec<usize> = (0..args.batch_size).map(|_| rng.gen_range(0..data.len())).collect();
        let batch = data.batch(&indices)?;
        let mut tape = Tape::default();
        let mut tensors = HashMap::new();
        let loss = ensemble
            .compute_error(
                &batch.observation,
                &batch.action,
                &batch.reward,
                &batch.next_observation,
                &mut tape,
                &mut tensors,
            )?
            .reduce_mean(&mut tape, &mut tensors);
        tape.backward(&loss, &mut tensors)?;
        ensemble.apply_gradients(&tensors, &mut optimizer);
        if step % log_every == 0 || step + 1 == args.steps {
            tracing::info!(step, loss = loss.data()[0], "training");
        }
    }
    let final_loss = dataset_loss(&ensemble, &data)?;

    let sample: Vec<usize> = (0..args.batch_size.min(data.len())).collect();
    let seen = data.batch(&sample)?;
    let in_distribution_variance = mean_variance(&ensemble, &seen.observation, &seen.action, variance_type)?;

    // positions and velocities an order of magnitude beyond anything collected
    let far_observation = seen.observation.data().iter().map(|v| v * 10.0 + 20.0).collect();
    let far_action = seen.action.data().iter().map(|v| v * 10.0).collect();
    let far_observation = Tensor::from_vec(seen.observation.shape().to_vec(), far_observation)?;
    let far_action = Tensor::from_vec(seen.action.shape().to_vec(), far_action)?;
    let out_of_distribution_variance = mean_variance(&ensemble, &far_observation, &far_action, variance_type)?;

    tracing::info!(
        initial_loss,
        final_loss,
        in_distribution_variance,
        out_of_distribution_variance,
        "finished"
    );
    Ok(Report {
        initial_loss,
        final_loss,
        in_distribution_variance,
        out_of_distribution_variance,
    })
}

/// Resolves the config from `args` and runs [`train`].
///
/// # Errors
///
/// Returns any config, environment, or training error.
pub fn run(args: &Args) -> Result<Report> {
    let env = RollingSphereEnv::new();
    let mut config = match &args.config {
        Some(path) => DynamicsConfig::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DynamicsConfig {
            hidden_units: vec![64, 64],
            ..DynamicsConfig::new(vec![env.obs_size()], env.action_size())
        },
    };
    config.seed = args.seed;
    train(&config, args)
}
