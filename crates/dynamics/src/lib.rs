//! # dynamics
//!
//! Learned transition/reward models for model-based reinforcement learning.
//!
//! A [`ProbabilisticDynamics`] model maps `(observation, action)` to a Gaussian
//! over `(next_observation - observation, reward)`. An [`EnsembleDynamics`]
//! holds several independently initialised members; its prediction is the
//! member mean, and the members' spread or their largest learned variance
//! ([`VarianceType`]) gives a per-sample uncertainty that grows away from the
//! training data.
//!
//! ```no_run
//! use dynamics::{create_probabilistic_dynamics, VarianceType};
//! use ml::Tensor;
//!
//! let ensemble = create_probabilistic_dynamics(&[4], 2, 5, false, false)?;
//! let obs = Tensor::zeros(vec![8, 4]);
//! let act = Tensor::zeros(vec![8, 2]);
//! let pred = ensemble.predict(&obs, &act, true, VarianceType::Data)?;
//! assert_eq!(pred.variance.map(|v| v.shape().to_vec()), Some(vec![8, 1]));
//! # Ok::<(), dynamics::DynamicsError>(())
//! ```

pub mod config;
pub mod encoder;
pub mod ensemble;
pub mod error;
pub mod factory;
pub mod probabilistic;
pub mod variance;

pub use config::DynamicsConfig;
pub use encoder::{action_features, ActionSpace, Encoder, EncoderHandle, VectorEncoder};
pub use ensemble::EnsembleDynamics;
pub use error::{DynamicsError, Result};
pub use factory::{build_ensemble, create_probabilistic_dynamics};
pub use probabilistic::{DynamicsPrediction, HeadConfig, ProbabilisticDynamics};
pub use variance::{compute_ensemble_variance, stack_members, VarianceType};
