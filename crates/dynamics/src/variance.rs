//! Aggregation of per-member uncertainty into one scalar per sample.

use crate::error::{DynamicsError, Result};
use ml::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Policy for turning member outputs into an ensemble uncertainty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarianceType {
    /// Largest learned variance among the members (aleatoric).
    #[default]
    Max,
    /// Disagreement between the members' predictions (epistemic).
    Data,
}

impl FromStr for VarianceType {
    type Err = DynamicsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "max" => Ok(VarianceType::Max),
            "data" => Ok(VarianceType::Data),
            other => Err(DynamicsError::UnknownVarianceType(other.to_string())),
        }
    }
}

impl fmt::Display for VarianceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VarianceType::Max => "max",
            VarianceType::Data => "data",
        })
    }
}

/// Stacks `N` member outputs of shape `[B, D]` into `[B, N, D]`.
///
/// # Errors
///
/// [`DynamicsError::EmptyEnsemble`] for no members and
/// [`DynamicsError::ShapeMismatch`] if the members disagree on shape.
pub fn stack_members(outputs: &[Tensor]) -> Result<Tensor> {
    let first = outputs.first().ok_or(DynamicsError::EmptyEnsemble)?;
    let batch = first.rows();
    let width = first.cols();
    for output in outputs {
        if output.shape() != [batch, width] {
            return Err(DynamicsError::ShapeMismatch {
                what: "member output",
                expected: vec![batch, width],
                actual: output.shape().to_vec(),
            });
        }
    }
    let n = outputs.len();
    let mut data = Vec::with_capacity(batch * n * width);
    for b in 0..batch {
        for output in outputs {
            data.extend_from_slice(output.row(b));
        }
    }
    Ok(Tensor::from_vec(vec![batch, n, width], data)?)
}

fn dims3(what: &'static str, t: &Tensor) -> Result<(usize, usize, usize)> {
    match *t.shape() {
        [b, n, d] => Ok((b, n, d)),
        _ => Err(DynamicsError::ShapeMismatch {
            what,
            expected: vec![0, 0, 0],
            actual: t.shape().to_vec(),
        }),
    }
}

/// Aggregates stacked member outputs into a `[B, 1]` uncertainty.
///
/// `observations` is `[B, N, O]`, `rewards` and `variances` are `[B, N, 1]`,
/// where `variances` holds each member's own predicted variance.
///
/// # Errors
///
/// [`DynamicsError::ShapeMismatch`] when the batch or member counts of the
/// three inputs disagree, or `N` is zero.
pub fn compute_ensemble_variance(
    observations: &Tensor,
    rewards: &Tensor,
    variances: &Tensor,
    variance_type: VarianceType,
) -> Result<Tensor> {
    let (batch, n, obs_dim) = dims3("observations", observations)?;
    let expected = vec![batch, n, 1];
    for (what, t) in [("rewards", rewards), ("variances", variances)] {
        if t.shape() != expected.as_slice() {
            return Err(DynamicsError::ShapeMismatch {
                what,
                expected: expected.clone(),
                actual: t.shape().to_vec(),
            });
        }
    }
    if n == 0 {
        return Err(DynamicsError::EmptyEnsemble);
    }

    let data = match variance_type {
        VarianceType::Max => max_member_variance(variances.data(), batch, n),
        VarianceType::Data => disagreement(observations.data(), rewards.data(), batch, n, obs_dim),
    };
    Ok(Tensor::from_vec(vec![batch, 1], data)?)
}

/// Largest variance per sample. A NaN from any member makes the sample NaN.
fn max_member_variance(variances: &[f32], batch: usize, n: usize) -> Vec<f32> {
    variances
        .chunks(n)
        .take(batch)
        .map(|members| {
            members
                .iter()
                .copied()
                .reduce(|a, b| if a.is_nan() || b.is_nan() { f32::NAN } else { a.max(b) })
                .unwrap_or(f32::NAN)
        })
        .collect()
}

/// Sum over the `O + 1` output dimensions of the population variance across
/// members.
fn disagreement(observations: &[f32], rewards: &[f32], batch: usize, n: usize, obs_dim: usize) -> Vec<f32> {
    let inv_n = 1.0 / n as f32;
    let population_variance = |value: &dyn Fn(usize) -> f32| {
        let mean = (0..n).map(value).sum::<f32>() * inv_n;
        (0..n).map(|m| (value(m) - mean).powi(2)).sum::<f32>() * inv_n
    };
    (0..batch)
        .map(|b| {
            let obs_var: f32 = (0..obs_dim)
                .map(|d| population_variance(&|m| observations[(b * n + m) * obs_dim + d]))
                .sum();
            obs_var + population_variance(&|m| rewards[b * n + m])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_variance_type() {
        assert_eq!("max".parse::<VarianceType>().unwrap(), VarianceType::Max);
        assert_eq!("data".parse::<VarianceType>().unwrap(), VarianceType::Data);
        assert!(matches!(
            "mean".parse::<VarianceType>(),
            Err(DynamicsError::UnknownVarianceType(s)) if s == "mean"
        ));
        assert_eq!(VarianceType::Data.to_string(), "data");
    }

    #[test]
    fn stack_interleaves_members_per_sample() {
        let a = Tensor::from_vec(vec![2, 1], vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_vec(vec![2, 1], vec![3.0, 4.0]).unwrap();
        let stacked = stack_members(&[a, b]).unwrap();
        assert_eq!(stacked.shape(), &[2, 2, 1]);
        assert_eq!(stacked.data(), &[1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn identical_members_have_no_disagreement() {
        let obs = Tensor::full(vec![3, 4, 2], 0.7);
        let rew = Tensor::full(vec![3, 4, 1], -1.0);
        let var = Tensor::full(vec![3, 4, 1], 0.5);
        let out = compute_ensemble_variance(&obs, &rew, &var, VarianceType::Data).unwrap();
        assert!(out.data().iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn max_keeps_nan() {
        assert!(max_member_variance(&[0.1, f32::NAN, 0.3], 1, 3)[0].is_nan());
        assert!(max_member_variance(&[f32::NAN, 0.3], 1, 2)[0].is_nan());
        assert_eq!(max_member_variance(&[0.1, 0.4, 0.3], 1, 3), vec![0.4]);
    }
}
