use crate::encoder::ActionSpace;
use crate::error::{DynamicsError, Result};
use crate::probabilistic::HeadConfig;
use crate::variance::VarianceType;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything needed to build an ensemble.
///
/// Missing JSON fields take their [`Default`] values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicsConfig {
    /// Must be one-dimensional.
    pub observation_shape: Vec<usize>,
    /// Continuous action width, or the number of discrete actions.
    pub action_size: usize,
    pub n_ensembles: usize,
    pub use_batch_norm: bool,
    pub discrete_action: bool,
    pub hidden_units: Vec<usize>,
    /// Use a single encoder instance for every member.
    pub share_encoder: bool,
    pub init_max_logstd: f32,
    pub init_min_logstd: f32,
    pub bound_penalty: f32,
    pub variance_type: VarianceType,
    pub seed: u64,
}

impl Default for DynamicsConfig {
    fn default() -> Self {
        let head = HeadConfig::default();
        Self {
            observation_shape: Vec::new(),
            action_size: 0,
            n_ensembles: 5,
            use_batch_norm: false,
            discrete_action: false,
            hidden_units: vec![256, 256],
            share_encoder: false,
            init_max_logstd: head.init_max_logstd,
            init_min_logstd: head.init_min_logstd,
            bound_penalty: head.bound_penalty,
            variance_type: VarianceType::Max,
            seed: 0,
        }
    }
}

impl DynamicsConfig {
    #[must_use]
    pub fn new(observation_shape: Vec<usize>, action_size: usize) -> Self {
        Self {
            observation_shape,
            action_size,
            ..Self::default()
        }
    }

    /// Parses and validates a JSON config.
    ///
    /// # Errors
    ///
    /// [`DynamicsError::Config`] for malformed JSON, otherwise whatever
    /// [`DynamicsConfig::validate`] reports.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// [`DynamicsError::Io`] if the file cannot be read, then as
    /// [`DynamicsConfig::from_json_str`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// # Errors
    ///
    /// [`DynamicsError::Configuration`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.observation_size()?;
        if self.action_size == 0 {
            return Err(DynamicsError::Configuration("action_size must be positive".into()));
        }
        if self.n_ensembles == 0 {
            return Err(DynamicsError::Configuration("n_ensembles must be positive".into()));
        }
        if self.hidden_units.is_empty() || self.hidden_units.contains(&0) {
            return Err(DynamicsError::Configuration(format!(
                "hidden_units must be non-empty positive widths, got {:?}",
                self.hidden_units
            )));
        }
        if !(self.init_min_logstd < self.init_max_logstd) {
            return Err(DynamicsError::Configuration(format!(
                "init_min_logstd {} must be below init_max_logstd {}",
                self.init_min_logstd, self.init_max_logstd
            )));
        }
        if !(self.bound_penalty >= 0.0) {
            return Err(DynamicsError::Configuration(format!(
                "bound_penalty must be non-negative, got {}",
                self.bound_penalty
            )));
        }
        Ok(())
    }

    /// The single observation dimension.
    ///
    /// # Errors
    ///
    /// [`DynamicsError::Configuration`] unless the shape is one positive
    /// dimension.
    pub fn observation_size(&self) -> Result<usize> {
        match self.observation_shape.as_slice() {
            &[size] if size > 0 => Ok(size),
            shape => Err(DynamicsError::Configuration(format!(
                "observation_shape must be one positive dimension, got {shape:?}"
            ))),
        }
    }

    #[must_use]
    pub fn action_space(&self) -> ActionSpace {
        if self.discrete_action {
            ActionSpace::Discrete
        } else {
            ActionSpace::Continuous
        }
    }

    #[must_use]
    pub fn head(&self) -> HeadConfig {
        HeadConfig {
            init_max_logstd: self.init_max_logstd,
            init_min_logstd: self.init_min_logstd,
            bound_penalty: self.bound_penalty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_need_shapes() {
        let config = DynamicsConfig::default();
        assert!(matches!(config.validate(), Err(DynamicsError::Configuration(_))));
        assert!(DynamicsConfig::new(vec![3], 1).validate().is_ok());
    }

    #[test]
    fn multi_dimensional_observation_rejected() {
        let config = DynamicsConfig::new(vec![3, 4], 1);
        assert!(config.observation_size().is_err());
    }
}
