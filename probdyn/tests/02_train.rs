use dynamics::{DynamicsConfig, VarianceType};
use probdyn::app::{train, Args};

fn args(variance_type: VarianceType) -> Args {
    Args {
        config: None,
        steps: 150,
        batch_size: 32,
        transitions: 512,
        variance_type: Some(variance_type),
        seed: 3,
        lr: 1e-2,
    }
}

fn small_config() -> DynamicsConfig {
    DynamicsConfig {
        hidden_units: vec![16, 16],
        n_ensembles: 3,
        ..DynamicsConfig::new(vec![2], 1)
    }
}

#[test]
fn training_reduces_loss() {
    let report = train(&small_config(), &args(VarianceType::Data)).unwrap();
    assert!(report.final_loss.is_finite());
    assert!(report.final_loss < report.initial_loss, "{report:?}");
    assert!(report.in_distribution_variance > 0.0);
    assert!(report.out_of_distribution_variance.is_finite());
}

#[test]
fn mismatched_config_is_rejected() {
    let config = DynamicsConfig::new(vec![5], 1);
    assert!(train(&config, &args(VarianceType::Max)).is_err());
}
