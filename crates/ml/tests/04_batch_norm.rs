use ml::nn::{BatchNorm1d, Layer};
use ml::{Graph, Tape, Tensor};
use std::collections::HashMap;

fn batch() -> Tensor {
    Tensor::from_vec(vec![4, 2], vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]).unwrap()
}

#[test]
fn training_pass_normalizes_and_updates_running_stats() {
    let bn = BatchNorm1d::new(2);
    let y = bn.forward(&batch(), &mut Tape::new(), &mut HashMap::new()).unwrap();
    let col0: Vec<f32> = (0..4).map(|r| y.data[r * 2]).collect();
    assert!(col0.iter().sum::<f32>().abs() < 1e-5);

    let (mean, var) = bn.running_stats();
    // momentum 0.1 from (0, 1), unbiased batch variance
    assert!((mean[0] - 0.25).abs() < 1e-5);
    assert!((mean[1] - 2.5).abs() < 1e-4);
    let unbiased0 = 1.25 * 4.0 / 3.0;
    assert!((var[0] - (0.9 + 0.1 * unbiased0)).abs() < 1e-5);
}

#[test]
fn inference_pass_uses_running_stats() {
    let bn = BatchNorm1d::new(2);
    let x = batch();
    let y = bn.forward(&x, &mut Graph::new(), &mut HashMap::new()).unwrap();
    // fresh running stats are (0, 1): identity up to eps
    for (a, b) in y.data.iter().zip(&x.data) {
        assert!((a - b).abs() < 1e-3);
    }
    assert_eq!(bn.running_stats().0, vec![0.0, 0.0]);
}

#[test]
fn affine_parameters_receive_gradients() {
    let mut bn = BatchNorm1d::new(2);
    let weights = Tensor::from_vec(vec![4, 2], vec![1.0, -1.0, 0.5, 2.0, -0.3, 0.1, 0.7, 0.0]).unwrap();
    let mut tape = Tape::new();
    let mut tensors = HashMap::new();
    let y = bn.forward(&batch(), &mut tape, &mut tensors).unwrap();
    let loss = y.mul(&weights, &mut tape, &mut tensors).unwrap().reduce_sum(&mut tape, &mut tensors);
    tape.backward(&loss, &mut tensors).unwrap();

    for p in bn.params_mut() {
        p.pull_grad(&tensors);
        let grad = p.grad.as_ref().expect("affine parameter grad");
        assert!(grad.iter().any(|g| g.abs() > 1e-6));
    }
}

#[test]
fn duplicate_copies_running_stats_with_fresh_ids() {
    let bn = BatchNorm1d::new(2);
    bn.forward(&batch(), &mut Tape::new(), &mut HashMap::new()).unwrap();
    let copy = bn.duplicate();
    assert_eq!(copy.running_stats(), bn.running_stats());
    assert_eq!(copy.gamma.data, bn.gamma.data);
    assert_ne!(copy.gamma.id, bn.gamma.id);
    assert_ne!(copy.beta.id, bn.beta.id);
    assert!(copy.gamma.requires_grad);
}
