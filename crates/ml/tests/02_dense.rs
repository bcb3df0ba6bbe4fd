use ml::nn::{Dense, Layer};
use ml::{Graph, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

#[test]
fn dense_forward_known_case() {
    let w = vec![1.0, -1.0, 0.2,
                 0.5, 2.0, 0.2];
    let b = vec![0.1, -0.1];
    let x = Tensor::from_vec(vec![1, 3], vec![1.0, 2.0, 3.0]).unwrap();
    let dense = Dense::new(w, b, 3, 2).unwrap();
    let y = dense.forward(&x, &mut Graph::new(), &mut HashMap::new()).unwrap();
    assert_eq!(y.shape(), &[1, 2]);
    assert!((y.data[0] - (-0.3)).abs() < 1e-6);
    assert!((y.data[1] - 5.0).abs() < 1e-6);
}

#[test]
fn dense_bias_only() {
    let dense = Dense::new(vec![0.0; 6], vec![0.5, -0.5], 3, 2).unwrap();
    let x = Tensor::from_vec(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let y = dense.forward(&x, &mut Graph::new(), &mut HashMap::new()).unwrap();
    assert_eq!(y.data(), &[0.5, -0.5, 0.5, -0.5]);
}

#[test]
fn dense_rejects_wrong_parameter_lengths() {
    assert!(Dense::new(vec![0.0; 5], vec![0.0; 2], 3, 2).is_err());
    assert!(Dense::new(vec![0.0; 6], vec![0.0; 3], 3, 2).is_err());
}

#[test]
fn dense_xavier_init_stats() {
    let mut rng = StdRng::seed_from_u64(42);
    let dense = Dense::xavier(40, 30, &mut rng);
    assert_eq!(dense.w.shape, vec![30, 40]);
    assert_eq!(dense.b.shape, vec![30]);
    assert!(dense.w.requires_grad && dense.b.requires_grad);
    assert!(dense.b.data.iter().all(|&v| v == 0.0));

    let n = dense.w.data.len() as f32;
    let mean: f32 = dense.w.data.iter().sum::<f32>() / n;
    assert!(mean.abs() < 0.05);
    let var: f32 = dense.w.data.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / n;
    let limit = (6.0f32 / 70.0).sqrt();
    let expected_var = limit * limit / 3.0;
    assert!((var - expected_var).abs() / expected_var < 0.2);
}

#[test]
fn xavier_is_reproducible_from_seed() {
    let a = Dense::xavier(4, 3, &mut StdRng::seed_from_u64(7));
    let b = Dense::xavier(4, 3, &mut StdRng::seed_from_u64(7));
    assert_eq!(a.w.data, b.w.data);
    assert_ne!(a.w.id, b.w.id);
}

#[test]
fn duplicate_has_independent_parameters() {
    let mut rng = StdRng::seed_from_u64(3);
    let dense = Dense::xavier(3, 2, &mut rng);
    let mut copy = dense.duplicate();
    assert_eq!(copy.w.data, dense.w.data);
    assert_ne!(copy.w.id, dense.w.id);
    assert_ne!(copy.b.id, dense.b.id);
    assert!(copy.w.requires_grad && copy.b.requires_grad);

    copy.w.data[0] += 1.0;
    assert_ne!(copy.w.data[0], dense.w.data[0]);
}
