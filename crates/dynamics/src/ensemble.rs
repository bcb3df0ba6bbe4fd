//! Ensembles of [`ProbabilisticDynamics`] members.

use crate::encoder::{Encoder, VectorEncoder};
use crate::error::{DynamicsError, Result};
use crate::probabilistic::{DynamicsPrediction, ProbabilisticDynamics};
use crate::variance::{compute_ensemble_variance, stack_members, VarianceType};
use ml::{Adam, Recorder, Tensor, TensorStore};
use rand::Rng;
use std::collections::{HashMap, HashSet};

/// `N` independently initialised dynamics models trained on the same data.
///
/// Predictions are the member mean; the spread between members (or the
/// largest member variance) is the uncertainty estimate.
pub struct EnsembleDynamics<E = VectorEncoder> {
    models: Vec<ProbabilisticDynamics<E>>,
}

impl<E: Encoder> EnsembleDynamics<E> {
    /// # Errors
    ///
    /// [`DynamicsError::EmptyEnsemble`] if `models` is empty, and
    /// [`DynamicsError::Configuration`] if the members disagree on the
    /// observation size or two members hold the same parameter tensor
    /// without sharing their encoder through [`EncoderHandle::Shared`].
    ///
    /// [`EncoderHandle::Shared`]: crate::EncoderHandle::Shared
    pub fn new(models: Vec<ProbabilisticDynamics<E>>) -> Result<Self> {
        let first = models.first().ok_or(DynamicsError::EmptyEnsemble)?;
        let observation_size = first.observation_size();
        if let Some(other) = models.iter().find(|m| m.observation_size() != observation_size) {
            return Err(DynamicsError::Configuration(format!(
                "ensemble members predict observations of size {observation_size} and {}",
                other.observation_size()
            )));
        }
        check_distinct_params(&models)?;
        tracing::debug!(
            n_ensembles = models.len(),
            observation_size,
            shared_encoder = first.encoder().is_shared(),
            "built dynamics ensemble"
        );
        Ok(Self { models })
    }

    #[must_use]
    pub fn models(&self) -> &[ProbabilisticDynamics<E>] {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut [ProbabilisticDynamics<E>] {
        &mut self.models
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Always `false`; construction rejects empty ensembles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    #[must_use]
    pub fn observation_size(&self) -> usize {
        self.models[0].observation_size()
    }

    /// Every member's own prediction, in member order.
    ///
    /// # Errors
    ///
    /// Propagates the first member's shape error.
    pub fn predict_members(
        &self,
        observation: &Tensor,
        action: &Tensor,
        with_variance: bool,
    ) -> Result<Vec<DynamicsPrediction>> {
        self.models
            .iter()
            .map(|model| model.predict(observation, action, with_variance))
            .collect()
    }

    /// Mean observation and reward over the members.
    ///
    /// With `with_variance` the `[B, 1]` uncertainty is aggregated according
    /// to `variance_type`.
    ///
    /// # Errors
    ///
    /// Shape errors for mismatched inputs.
    pub fn predict(
        &self,
        observation: &Tensor,
        action: &Tensor,
        with_variance: bool,
        variance_type: VarianceType,
    ) -> Result<DynamicsPrediction> {
        let members = self.predict_members(observation, action, with_variance)?;
        let variance = if with_variance {
            Some(aggregate_variance(&members, variance_type)?)
        } else {
            None
        };
        Ok(DynamicsPrediction {
            observation: member_mean(members.iter().map(|m| &m.observation))?,
            reward: member_mean(members.iter().map(|m| &m.reward))?,
            variance,
        })
    }

    /// Like [`EnsembleDynamics::predict`], but each sample takes the
    /// observation and reward of one member picked uniformly at random.
    ///
    /// The variance is aggregated over all members as in `predict`.
    ///
    /// # Errors
    ///
    /// Shape errors for mismatched inputs.
    pub fn predict_sampled(
        &self,
        observation: &Tensor,
        action: &Tensor,
        with_variance: bool,
        variance_type: VarianceType,
        rng: &mut impl Rng,
    ) -> Result<DynamicsPrediction> {
        let members = self.predict_members(observation, action, with_variance)?;
        let batch = observation.rows();
        let picks: Vec<usize> = (0..batch).map(|_| rng.gen_range(0..members.len())).collect();
        let gather = |select: fn(&DynamicsPrediction) -> &Tensor| {
            let width = select(&members[0]).cols();
            let mut data = Vec::with_capacity(batch * width);
            for (b, &m) in picks.iter().enumerate() {
                data.extend_from_slice(select(&members[m]).row(b));
            }
            Tensor::from_vec(vec![batch, width], data)
        };
        let next_observation = gather(|m| &m.observation)?;
        let reward = gather(|m| &m.reward)?;
        let variance = if with_variance {
            Some(aggregate_variance(&members, variance_type)?)
        } else {
            None
        };
        Ok(DynamicsPrediction {
            observation: next_observation,
            reward,
            variance,
        })
    }

    /// Sum of the members' per-sample losses, `[B, 1]`.
    ///
    /// Every member sees the same batch, so each one receives the full
    /// gradient of its own loss. Members sharing an encoder reuse one
    /// encoding of the batch, so under a training recorder its batch-norm
    /// running statistics advance once per call.
    ///
    /// # Errors
    ///
    /// See [`ProbabilisticDynamics::compute_error`].
    pub fn compute_error(
        &self,
        observation: &Tensor,
        action: &Tensor,
        reward: &Tensor,
        next_observation: &Tensor,
        recorder: &mut impl Recorder,
        tensors: &mut TensorStore,
    ) -> Result<Tensor> {
        let mut features: Vec<Tensor> = Vec::with_capacity(self.models.len());
        let mut total: Option<Tensor> = None;
        for (i, model) in self.models.iter().enumerate() {
            model.check_targets(observation, action, reward, next_observation)?;
            let shared = self.models[..i]
                .iter()
                .position(|earlier| earlier.encoder().shares_with(model.encoder()));
            let h = match shared {
                Some(j) => features[j].clone(),
                None => model.encode(observation, action, recorder, tensors)?,
            };
            let loss = model.error_from_features(&h, observation, reward, next_observation, recorder, tensors)?;
            features.push(h);
            total = Some(match total {
                Some(acc) => acc.add(&loss, recorder, tensors)?,
                None => loss,
            });
        }
        total.ok_or(DynamicsError::EmptyEnsemble)
    }

    /// Visits each distinct trainable tensor once, even when members share an
    /// encoder.
    pub fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        let mut seen = HashSet::new();
        for model in &self.models {
            model.visit_params(&mut |p| {
                if seen.insert(p.id) {
                    f(p);
                }
            });
        }
    }

    pub fn visit_params_mut(&mut self, f: &mut dyn FnMut(&mut Tensor)) {
        let mut seen = HashSet::new();
        for model in &mut self.models {
            model.visit_params_mut(&mut |p| {
                if seen.insert(p.id) {
                    f(p);
                }
            });
        }
    }

    /// Number of distinct trainable scalars.
    #[must_use]
    pub fn param_count(&self) -> usize {
        let mut count = 0;
        self.visit_params(&mut |p| count += p.len());
        count
    }

    /// Pulls gradients out of `tensors` and applies one optimizer step to
    /// every distinct parameter.
    pub fn apply_gradients(&mut self, tensors: &TensorStore, optimizer: &mut Adam) {
        optimizer.begin_step();
        self.visit_params_mut(&mut |p| {
            p.pull_grad(tensors);
            optimizer.update(p);
        });
    }
}

/// Parameter ids must be unique to one member, except encoder parameters of
/// members holding the same shared encoder.
fn check_distinct_params<E: Encoder>(models: &[ProbabilisticDynamics<E>]) -> Result<()> {
    let mut owners: HashMap<usize, (usize, bool)> = HashMap::new();
    for (i, model) in models.iter().enumerate() {
        let mut ids: Vec<(usize, bool)> =
            model.encoder().with(|e| e.params().iter().map(|p| (p.id, true)).collect());
        model.visit_head_params(&mut |p| ids.push((p.id, false)));
        for (id, in_encoder) in ids {
            match owners.get(&id).copied() {
                None => {
                    owners.insert(id, (i, in_encoder));
                }
                Some((j, true)) if in_encoder && models[j].encoder().shares_with(model.encoder()) => {}
                Some((j, _)) => {
                    return Err(DynamicsError::Configuration(format!(
                        "parameter tensor {id} is held by ensemble members {j} and {i}; \
                         copy encoders with `duplicate` or share them explicitly"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn member_mean<'a>(outputs: impl Iterator<Item = &'a Tensor>) -> Result<Tensor> {
    let mut shape = Vec::new();
    let mut sum: Vec<f32> = Vec::new();
    let mut n = 0usize;
    for output in outputs {
        if n == 0 {
            shape = output.shape().to_vec();
            sum = output.data().to_vec();
        } else {
            for (acc, v) in sum.iter_mut().zip(output.data()) {
                *acc += v;
            }
        }
        n += 1;
    }
    if n == 0 {
        return Err(DynamicsError::EmptyEnsemble);
    }
    let inv_n = 1.0 / n as f32;
    sum.iter_mut().for_each(|v| *v *= inv_n);
    Ok(Tensor::from_vec(shape, sum)?)
}

fn aggregate_variance(members: &[DynamicsPrediction], variance_type: VarianceType) -> Result<Tensor> {
    let observations: Vec<Tensor> = members.iter().map(|m| m.observation.clone()).collect();
    let rewards: Vec<Tensor> = members.iter().map(|m| m.reward.clone()).collect();
    let variances = members
        .iter()
        .map(|m| {
            m.variance.clone().ok_or_else(|| {
                DynamicsError::Configuration("member prediction was made without variance".into())
            })
        })
        .collect::<Result<Vec<_>>>()?;
    compute_ensemble_variance(
        &stack_members(&observations)?,
        &stack_members(&rewards)?,
        &stack_members(&variances)?,
        variance_type,
    )
}
