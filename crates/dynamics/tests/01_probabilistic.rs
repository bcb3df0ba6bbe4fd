mod common;

use common::{check_parameter_updates, close, random_batch, DummyEncoder};
use dynamics::{DynamicsError, HeadConfig, ProbabilisticDynamics};
use ml::{Graph, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

const OBS: usize = 3;
const ACT: usize = 2;
const FEATURES: usize = 16;

fn model(seed: u64) -> ProbabilisticDynamics<DummyEncoder> {
    let mut rng = StdRng::seed_from_u64(seed);
    ProbabilisticDynamics::new(DummyEncoder::new(OBS, ACT, FEATURES, seed), &mut rng).unwrap()
}

fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Pins both heads to a constant output: zero mean and raw log-std `raw`.
fn pin_heads(model: &mut ProbabilisticDynamics<DummyEncoder>, raw: f32) {
    let (mu, logstd) = model.heads_mut();
    mu.w.data.iter_mut().for_each(|v| *v = 0.0);
    mu.b.data.iter_mut().for_each(|v| *v = 0.0);
    logstd.w.data.iter_mut().for_each(|v| *v = 0.0);
    logstd.b.data.iter_mut().for_each(|v| *v = raw);
}

#[test]
fn predict_shapes() {
    let model = model(0);
    let batch = random_batch(32, OBS, ACT, 1);

    let pred = model.predict(&batch.observation, &batch.action, false).unwrap();
    assert_eq!(pred.observation.shape(), &[32, OBS]);
    assert_eq!(pred.reward.shape(), &[32, 1]);
    assert!(pred.variance.is_none());

    let pred = model.predict(&batch.observation, &batch.action, true).unwrap();
    let variance = pred.variance.unwrap();
    assert_eq!(variance.shape(), &[32, 1]);
    assert!(variance.data().iter().all(|v| v.is_finite() && *v > 0.0));
}

#[test]
fn prediction_is_observation_plus_delta() {
    let mut model = model(1);
    pin_heads(&mut model, 0.0);
    {
        let (mu, _) = model.heads_mut();
        // delta = [0.5, -1.0, 2.0], reward = 3.0
        mu.b.data.copy_from_slice(&[0.5, -1.0, 2.0, 3.0]);
    }
    let batch = random_batch(4, OBS, ACT, 2);
    let pred = model.predict(&batch.observation, &batch.action, false).unwrap();
    for b in 0..4 {
        let obs = batch.observation.row(b);
        let next = pred.observation.row(b);
        assert!(close(next[0], obs[0] + 0.5, 1e-6));
        assert!(close(next[1], obs[1] - 1.0, 1e-6));
        assert!(close(next[2], obs[2] + 2.0, 1e-6));
        assert!(close(pred.reward.row(b)[0], 3.0, 1e-6));
    }
}

#[test]
fn variance_stays_within_logstd_bounds() {
    let batch = random_batch(8, OBS, ACT, 3);
    let upper = (OBS + 1) as f32 * 4.0f32.exp();

    let mut wide = model(2);
    pin_heads(&mut wide, 100.0);
    let variance = wide.predict(&batch.observation, &batch.action, true).unwrap().variance.unwrap();
    assert!(variance.data().iter().all(|v| v.is_finite() && *v <= upper * (1.0 + 1e-4)));

    let mut narrow = model(2);
    pin_heads(&mut narrow, -100.0);
    let variance = narrow.predict(&batch.observation, &batch.action, true).unwrap().variance.unwrap();
    assert!(variance.data().iter().all(|v| *v > 0.0 && v.is_finite()));
}

#[test]
fn compute_error_is_per_sample() {
    let model = model(3);
    let batch = random_batch(32, OBS, ACT, 4);
    let loss = model
        .compute_error(
            &batch.observation,
            &batch.action,
            &batch.reward,
            &batch.next_observation,
            &mut Graph::new(),
            &mut HashMap::new(),
        )
        .unwrap();
    assert_eq!(loss.shape(), &[32, 1]);
    assert!(loss.is_finite());
}

#[test]
fn compute_error_matches_gaussian_nll() {
    let mut model = model(4);
    pin_heads(&mut model, 0.0);
    let head = HeadConfig::default();
    let upper = head.init_max_logstd - softplus(head.init_max_logstd);
    let logstd = head.init_min_logstd + softplus(upper - head.init_min_logstd);
    let penalty = head.bound_penalty * (OBS + 1) as f32 * (head.init_max_logstd - head.init_min_logstd);

    let observation = Tensor::from_vec(vec![2, OBS], vec![0.0, 1.0, 2.0, -1.0, 0.5, 0.0]).unwrap();
    let next_observation = Tensor::from_vec(vec![2, OBS], vec![0.5, 1.0, 1.0, -1.0, 0.0, 2.0]).unwrap();
    let reward = Tensor::from_vec(vec![2, 1], vec![1.0, -0.5]).unwrap();
    let action = Tensor::zeros(vec![2, ACT]);

    let loss = model
        .compute_error(
            &observation,
            &action,
            &reward,
            &next_observation,
            &mut Graph::new(),
            &mut HashMap::new(),
        )
        .unwrap();

    let targets = [[0.5f32, 0.0, -1.0, 1.0], [0.0, -0.5, 2.0, -0.5]];
    for (b, target) in targets.iter().enumerate() {
        let expected: f32 = target
            .iter()
            .map(|t| 0.5 * t * t * (-2.0 * logstd).exp() + logstd + 0.5 * (2.0 * std::f32::consts::PI).ln())
            .sum::<f32>()
            + penalty;
        assert!(close(loss.data()[b], expected, 1e-4), "{} vs {expected}", loss.data()[b]);
    }
}

#[test]
fn every_parameter_is_trained() {
    let mut model = model(5);
    let batch = random_batch(16, OBS, ACT, 6);
    check_parameter_updates(
        &mut model,
        |m, f| m.visit_params_mut(f),
        |m, tape, tensors| {
            m.compute_error(
                &batch.observation,
                &batch.action,
                &batch.reward,
                &batch.next_observation,
                tape,
                tensors,
            )
        },
    );
}

#[test]
fn rejects_encoder_without_action() {
    let mut rng = StdRng::seed_from_u64(0);
    let encoder = DummyEncoder::new(OBS, ACT, FEATURES, 0).without_action();
    assert!(matches!(
        ProbabilisticDynamics::new(encoder, &mut rng),
        Err(DynamicsError::Configuration(_))
    ));
}

#[test]
fn rejects_unordered_bounds() {
    let mut rng = StdRng::seed_from_u64(0);
    let head = HeadConfig {
        init_max_logstd: -1.0,
        init_min_logstd: 1.0,
        ..HeadConfig::default()
    };
    assert!(ProbabilisticDynamics::with_config(DummyEncoder::new(OBS, ACT, FEATURES, 0), head, &mut rng).is_err());
}

#[test]
fn shape_mismatches_are_errors() {
    let model = model(6);
    let batch = random_batch(4, OBS, ACT, 7);
    let mut tensors = HashMap::new();

    let wide_obs = Tensor::zeros(vec![4, OBS + 1]);
    assert!(matches!(
        model.predict(&wide_obs, &batch.action, false),
        Err(DynamicsError::ShapeMismatch { what: "observation", .. })
    ));

    let short_action = Tensor::zeros(vec![3, ACT]);
    assert!(matches!(
        model.predict(&batch.observation, &short_action, false),
        Err(DynamicsError::ShapeMismatch { what: "action", .. })
    ));

    let wide_reward = Tensor::zeros(vec![4, 2]);
    assert!(matches!(
        model.compute_error(
            &batch.observation,
            &batch.action,
            &wide_reward,
            &batch.next_observation,
            &mut Graph::new(),
            &mut tensors,
        ),
        Err(DynamicsError::ShapeMismatch { what: "reward", .. })
    ));

    let short_next = Tensor::zeros(vec![2, OBS]);
    assert!(matches!(
        model.compute_error(
            &batch.observation,
            &batch.action,
            &batch.reward,
            &short_next,
            &mut Graph::new(),
            &mut tensors,
        ),
        Err(DynamicsError::ShapeMismatch { what: "next_observation", .. })
    ));
}
