use crate::config::DynamicsConfig;
use crate::encoder::{EncoderHandle, VectorEncoder};
use crate::ensemble::EnsembleDynamics;
use crate::error::Result;
use crate::probabilistic::ProbabilisticDynamics;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

/// Builds an ensemble of `n_ensembles` MLP-encoded models from `config`.
///
/// Members are initialised from one RNG seeded with `config.seed`, so two
/// calls with the same config produce identical ensembles.
///
/// # Errors
///
/// Any error from [`DynamicsConfig::validate`].
pub fn build_ensemble(config: &DynamicsConfig) -> Result<EnsembleDynamics<VectorEncoder>> {
    config.validate()?;
    let observation_size = config.observation_size()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let new_encoder = |rng: &mut StdRng| {
        VectorEncoder::new(
            observation_size,
            config.action_size,
            config.action_space(),
            &config.hidden_units,
            config.use_batch_norm,
            rng,
        )
    };

    let shared = if config.share_encoder {
        Some(Arc::new(RwLock::new(new_encoder(&mut rng)?)))
    } else {
        None
    };
    let mut models = Vec::with_capacity(config.n_ensembles);
    for _ in 0..config.n_ensembles {
        let encoder: EncoderHandle<VectorEncoder> = match &shared {
            Some(encoder) => Arc::clone(encoder).into(),
            None => new_encoder(&mut rng)?.into(),
        };
        models.push(ProbabilisticDynamics::with_config(encoder, config.head(), &mut rng)?);
    }
    tracing::debug!(
        observation_size,
        action_size = config.action_size,
        discrete_action = config.discrete_action,
        use_batch_norm = config.use_batch_norm,
        "created probabilistic dynamics"
    );
    EnsembleDynamics::new(models)
}

/// Builds the default ensemble for vector observations.
///
/// `observation_shape` must have exactly one dimension. Discrete actions are
/// passed as `[B, 1]` indices and one-hot encoded to `action_size`.
///
/// # Errors
///
/// [`crate::DynamicsError::Configuration`] for a multi-dimensional
/// observation shape, a zero size, or `n_ensembles == 0`.
pub fn create_probabilistic_dynamics(
    observation_shape: &[usize],
    action_size: usize,
    n_ensembles: usize,
    use_batch_norm: bool,
    discrete_action: bool,
) -> Result<EnsembleDynamics<VectorEncoder>> {
    build_ensemble(&DynamicsConfig {
        observation_shape: observation_shape.to_vec(),
        action_size,
        n_ensembles,
        use_batch_norm,
        discrete_action,
        ..DynamicsConfig::default()
    })
}
