use crate::error::{MlError, Result};
use crate::graph::{EOp, Node};
use crate::ops::{column_stats, sigmoid};
use crate::recorder::Recorder;
use crate::tensor::{Tensor, TensorStore};
use std::collections::HashMap;

/// A tape that records operations for automatic differentiation.
///
/// Layers run in training mode while recording into a tape.
#[derive(Default)]
pub struct Tape {
    nodes: Vec<Node>,
}

impl Recorder for Tape {
    fn record(&mut self, node: Node) {
        self.nodes.push(node);
    }

    fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    fn is_training(&self) -> bool {
        true
    }
}

fn lookup(tensors: &TensorStore, id: usize) -> Result<&Tensor> {
    tensors.get(&id).ok_or(MlError::MissingTensor(id))
}

fn slot(grads: &mut HashMap<usize, Vec<f32>>, id: usize, len: usize) -> &mut Vec<f32> {
    grads.entry(id).or_insert_with(|| vec![0.0; len])
}

impl Tape {
    /// Creates a new, empty tape.
    #[must_use]
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Computes the gradients of the tensors on the tape with respect to a loss tensor.
    ///
    /// The loss is seeded with ones, so a non-scalar loss behaves like its sum.
    /// Gradients are written to the `grad` field of every `requires_grad`
    /// tensor in `tensors`; use [`Tensor::pull_grad`] to copy them back to
    /// the parameters a model owns.
    ///
    /// # Errors
    ///
    /// Returns [`MlError::MissingTensor`] if a recorded value is absent from
    /// `tensors`.
    pub fn backward(&self, loss: &Tensor, tensors: &mut TensorStore) -> Result<()> {
        let mut grads: HashMap<usize, Vec<f32>> = HashMap::new();
        grads.insert(loss.id, vec![1.0; loss.data.len()]);

        for node in self.nodes.iter().rev() {
            let Some(out_grad) = grads.get(&node.out).cloned() else {
                continue;
            };
            let a = lookup(tensors, node.a)?;
            let b = match node.b {
                Some(id) => Some(lookup(tensors, id)?),
                None => None,
            };

            match (node.op, b) {
                (EOp::Add, Some(b)) => {
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (g, og) in a_grad.iter_mut().zip(&out_grad) {
                        *g += og;
                    }
                    let b_grad = slot(&mut grads, b.id, b.len());
                    for (g, og) in b_grad.iter_mut().zip(&out_grad) {
                        *g += og;
                    }
                }
                (EOp::Sub, Some(b)) => {
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (g, og) in a_grad.iter_mut().zip(&out_grad) {
                        *g += og;
                    }
                    let b_grad = slot(&mut grads, b.id, b.len());
                    for (g, og) in b_grad.iter_mut().zip(&out_grad) {
                        *g -= og;
                    }
                }
                (EOp::Mul, Some(b)) => {
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (g, (d, og)) in a_grad.iter_mut().zip(b.data.iter().zip(&out_grad)) {
                        *g += d * og;
                    }
                    let b_grad = slot(&mut grads, b.id, b.len());
                    for (g, (d, og)) in b_grad.iter_mut().zip(a.data.iter().zip(&out_grad)) {
                        *g += d * og;
                    }
                }
                (EOp::AddBroadcast, Some(b)) => {
                    let cols = b.len();
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (g, og) in a_grad.iter_mut().zip(&out_grad) {
                        *g += og;
                    }
                    let b_grad = slot(&mut grads, b.id, cols);
                    for (i, og) in out_grad.iter().enumerate() {
                        b_grad[i % cols] += og;
                    }
                }
                (EOp::MulBroadcast, Some(b)) => {
                    let cols = b.len();
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (i, (g, og)) in a_grad.iter_mut().zip(&out_grad).enumerate() {
                        *g += og * b.data[i % cols];
                    }
                    let b_grad = slot(&mut grads, b.id, cols);
                    for (i, og) in out_grad.iter().enumerate() {
                        b_grad[i % cols] += og * a.data[i];
                    }
                }
                (EOp::MatMul, Some(x)) => {
                    let out_dim = a.shape[0];
                    let in_dim = a.shape[1];
                    let batch = x.shape[0];
                    {
                        let w_grad = slot(&mut grads, a.id, a.len());
                        for k in 0..batch {
                            for o in 0..out_dim {
                                let og = out_grad[k * out_dim + o];
                                if og == 0.0 {
                                    continue;
                                }
                                for i in 0..in_dim {
                                    w_grad[o * in_dim + i] += og * x.data[k * in_dim + i];
                                }
                            }
                        }
                    }
                    {
                        let x_grad = slot(&mut grads, x.id, x.len());
                        for k in 0..batch {
                            for o in 0..out_dim {
                                let og = out_grad[k * out_dim + o];
                                if og == 0.0 {
                                    continue;
                                }
                                for i in 0..in_dim {
                                    x_grad[k * in_dim + i] += og * a.data[o * in_dim + i];
                                }
                            }
                        }
                    }
                }
                (EOp::MulScalar(s), None) => {
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (g, og) in a_grad.iter_mut().zip(&out_grad) {
                        *g += s * og;
                    }
                }
                (EOp::AddScalar(_), None) => {
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (g, og) in a_grad.iter_mut().zip(&out_grad) {
                        *g += og;
                    }
                }
                (EOp::Exp, None) => {
                    let out = lookup(tensors, node.out)?;
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (g, (d, og)) in a_grad.iter_mut().zip(out.data.iter().zip(&out_grad)) {
                        *g += d * og;
                    }
                }
                (EOp::Tanh, None) => {
                    let out = lookup(tensors, node.out)?;
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (g, (d, og)) in a_grad.iter_mut().zip(out.data.iter().zip(&out_grad)) {
                        *g += (1.0 - d.powi(2)) * og;
                    }
                }
                (EOp::Relu, None) => {
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (g, (d, og)) in a_grad.iter_mut().zip(a.data.iter().zip(&out_grad)) {
                        if *d > 0.0 {
                            *g += og;
                        }
                    }
                }
                (EOp::Softplus, None) => {
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (g, (d, og)) in a_grad.iter_mut().zip(a.data.iter().zip(&out_grad)) {
                        *g += sigmoid(*d) * og;
                    }
                }
                (EOp::SumCols, None) => {
                    let cols = a.cols();
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (i, g) in a_grad.iter_mut().enumerate() {
                        *g += out_grad[i / cols];
                    }
                }
                (EOp::ReduceSum, None) => {
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for g in a_grad.iter_mut() {
                        *g += out_grad[0];
                    }
                }
                (EOp::ReduceMean, None) => {
                    let n = a.len().max(1) as f32;
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for g in a_grad.iter_mut() {
                        *g += out_grad[0] / n;
                    }
                }
                (EOp::SliceCols { start, end }, None) => {
                    let cols = a.cols();
                    let width = end - start;
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for (i, og) in out_grad.iter().enumerate() {
                        let r = i / width;
                        let j = i % width;
                        a_grad[r * cols + start + j] += og;
                    }
                }
                (EOp::ConcatCols, Some(b)) => {
                    let p = a.cols();
                    let q = b.cols();
                    let rows = a.rows();
                    {
                        let a_grad = slot(&mut grads, a.id, a.len());
                        for r in 0..rows {
                            for j in 0..p {
                                a_grad[r * p + j] += out_grad[r * (p + q) + j];
                            }
                        }
                    }
                    {
                        let b_grad = slot(&mut grads, b.id, b.len());
                        for r in 0..rows {
                            for j in 0..q {
                                b_grad[r * q + j] += out_grad[r * (p + q) + p + j];
                            }
                        }
                    }
                }
                (EOp::BatchNormalize { eps }, None) => {
                    let out = lookup(tensors, node.out)?;
                    let rows = a.rows();
                    let cols = a.cols();
                    let n = rows.max(1) as f32;
                    let (_, var) = column_stats(&a.data, rows, cols);
                    let mut sum_og = vec![0.0f32; cols];
                    let mut sum_og_xhat = vec![0.0f32; cols];
                    for r in 0..rows {
                        for c in 0..cols {
                            let i = r * cols + c;
                            sum_og[c] += out_grad[i];
                            sum_og_xhat[c] += out_grad[i] * out.data[i];
                        }
                    }
                    let a_grad = slot(&mut grads, a.id, a.len());
                    for r in 0..rows {
                        for c in 0..cols {
                            let i = r * cols + c;
                            let inv_std = 1.0 / (var[c] + eps).sqrt();
                            a_grad[i] += inv_std / n
                                * (n * out_grad[i] - sum_og[c] - out.data[i] * sum_og_xhat[c]);
                        }
                    }
                }
                (op, _) => return Err(MlError::MalformedNode(format!("{op:?}"))),
            }
        }

        for (id, grad) in grads {
            if let Some(tensor) = tensors.get_mut(&id) {
                if tensor.requires_grad {
                    tensor.grad = Some(grad);
                }
            }
        }

        Ok(())
    }
}
