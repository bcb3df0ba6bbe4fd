//! Recorded tensor ops.
//!
//! Every op computes its result eagerly on the CPU, stores inputs and output
//! in the [`TensorStore`], and records a [`Node`] so a [`crate::tape::Tape`]
//! can replay it backwards. Under a [`crate::graph::Graph`] the node is kept
//! but never differentiated.

use crate::error::{MlError, Result};
use crate::graph::{EOp, Node};
use crate::recorder::Recorder;
use crate::tensor::{Tensor, TensorStore};

fn finish(
    op: EOp,
    a: &Tensor,
    b: Option<&Tensor>,
    out: Tensor,
    recorder: &mut impl Recorder,
    tensors: &mut TensorStore,
) -> Tensor {
    tensors.entry(a.id).or_insert_with(|| a.clone());
    if let Some(b) = b {
        tensors.entry(b.id).or_insert_with(|| b.clone());
    }
    recorder.record(Node {
        op,
        a: a.id,
        b: b.map(|t| t.id),
        out: out.id,
    });
    tensors.insert(out.id, out.clone());
    out
}

fn same_shape(op: &'static str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.shape == b.shape {
        Ok(())
    } else {
        Err(MlError::ShapeMismatch {
            op,
            left: a.shape.clone(),
            right: b.shape.clone(),
        })
    }
}

fn require_2d(op: &'static str, a: &Tensor) -> Result<(usize, usize)> {
    if a.shape.len() == 2 {
        Ok((a.shape[0], a.shape[1]))
    } else {
        Err(MlError::ShapeMismatch {
            op,
            left: a.shape.clone(),
            right: vec![0, 0],
        })
    }
}

pub(crate) fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Tensor {
    fn zip_with(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Tensor {
        let data = self.data.iter().zip(&other.data).map(|(&x, &y)| f(x, y)).collect();
        Tensor::raw(self.shape.clone(), data)
    }

    fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        let data = self.data.iter().map(|&x| f(x)).collect();
        Tensor::raw(self.shape.clone(), data)
    }

    pub fn add(&self, other: &Tensor, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor> {
        same_shape("add", self, other)?;
        let out = self.zip_with(other, |x, y| x + y);
        Ok(finish(EOp::Add, self, Some(other), out, recorder, tensors))
    }

    pub fn sub(&self, other: &Tensor, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor> {
        same_shape("sub", self, other)?;
        let out = self.zip_with(other, |x, y| x - y);
        Ok(finish(EOp::Sub, self, Some(other), out, recorder, tensors))
    }

    pub fn mul(&self, other: &Tensor, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor> {
        same_shape("mul", self, other)?;
        let out = self.zip_with(other, |x, y| x * y);
        Ok(finish(EOp::Mul, self, Some(other), out, recorder, tensors))
    }

    /// Adds `row` (length `self.cols()`) to every row of `self`.
    pub fn add_broadcast(&self, row: &Tensor, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor> {
        let cols = self.cols();
        if row.len() != cols {
            return Err(MlError::ShapeMismatch {
                op: "add_broadcast",
                left: self.shape.clone(),
                right: row.shape.clone(),
            });
        }
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(i, &x)| x + row.data[i % cols])
            .collect();
        let out = Tensor::raw(self.shape.clone(), data);
        Ok(finish(EOp::AddBroadcast, self, Some(row), out, recorder, tensors))
    }

    /// Multiplies every row of `self` element-wise by `row`.
    pub fn mul_broadcast(&self, row: &Tensor, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor> {
        let cols = self.cols();
        if row.len() != cols {
            return Err(MlError::ShapeMismatch {
                op: "mul_broadcast",
                left: self.shape.clone(),
                right: row.shape.clone(),
            });
        }
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(i, &x)| x * row.data[i % cols])
            .collect();
        let out = Tensor::raw(self.shape.clone(), data);
        Ok(finish(EOp::MulBroadcast, self, Some(row), out, recorder, tensors))
    }

    /// `self` is a weight matrix `[out, in]`, `x` a batch `[B, in]`; the
    /// result is `x @ self^T` with shape `[B, out]`.
    pub fn matmul(&self, x: &Tensor, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor> {
        let (out_dim, in_dim) = require_2d("matmul", self)?;
        let (batch, x_cols) = require_2d("matmul", x)?;
        if x_cols != in_dim {
            return Err(MlError::ShapeMismatch {
                op: "matmul",
                left: self.shape.clone(),
                right: x.shape.clone(),
            });
        }
        let mut y = vec![0.0f32; batch * out_dim];
        for k in 0..batch {
            let xr = &x.data[k * in_dim..(k + 1) * in_dim];
            for o in 0..out_dim {
                let wr = &self.data[o * in_dim..(o + 1) * in_dim];
                y[k * out_dim + o] = wr.iter().zip(xr).map(|(w, v)| w * v).sum();
            }
        }
        let out = Tensor::raw(vec![batch, out_dim], y);
        Ok(finish(EOp::MatMul, self, Some(x), out, recorder, tensors))
    }

    pub fn mul_scalar(&self, s: f32, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Tensor {
        let out = self.map(|x| x * s);
        finish(EOp::MulScalar(s), self, None, out, recorder, tensors)
    }

    pub fn add_scalar(&self, s: f32, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Tensor {
        let out = self.map(|x| x + s);
        finish(EOp::AddScalar(s), self, None, out, recorder, tensors)
    }

    pub fn neg(&self, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Tensor {
        self.mul_scalar(-1.0, recorder, tensors)
    }

    pub fn exp(&self, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Tensor {
        let out = self.map(f32::exp);
        finish(EOp::Exp, self, None, out, recorder, tensors)
    }

    pub fn tanh(&self, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Tensor {
        let out = self.map(f32::tanh);
        finish(EOp::Tanh, self, None, out, recorder, tensors)
    }

    pub fn relu(&self, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Tensor {
        let out = self.map(|x| x.max(0.0));
        finish(EOp::Relu, self, None, out, recorder, tensors)
    }

    pub fn softplus(&self, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Tensor {
        let out = self.map(softplus);
        finish(EOp::Softplus, self, None, out, recorder, tensors)
    }

    /// Sums each row: `[B, D] -> [B, 1]`.
    pub fn sum_cols(&self, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor> {
        let (rows, cols) = require_2d("sum_cols", self)?;
        let data = (0..rows)
            .map(|r| self.data[r * cols..(r + 1) * cols].iter().sum())
            .collect();
        let out = Tensor::raw(vec![rows, 1], data);
        Ok(finish(EOp::SumCols, self, None, out, recorder, tensors))
    }

    pub fn reduce_sum(&self, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Tensor {
        let out = Tensor::raw(vec![1], vec![self.data.iter().sum()]);
        finish(EOp::ReduceSum, self, None, out, recorder, tensors)
    }

    pub fn reduce_mean(&self, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Tensor {
        let n = self.data.len().max(1) as f32;
        let out = Tensor::raw(vec![1], vec![self.data.iter().sum::<f32>() / n]);
        finish(EOp::ReduceMean, self, None, out, recorder, tensors)
    }

    /// Columns `start..end` of a 2-D tensor.
    pub fn slice_cols(&self, start: usize, end: usize, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor> {
        let (rows, cols) = require_2d("slice_cols", self)?;
        if start >= end || end > cols {
            return Err(MlError::ShapeMismatch {
                op: "slice_cols",
                left: self.shape.clone(),
                right: vec![start, end],
            });
        }
        let width = end - start;
        let mut data = Vec::with_capacity(rows * width);
        for r in 0..rows {
            data.extend_from_slice(&self.data[r * cols + start..r * cols + end]);
        }
        let out = Tensor::raw(vec![rows, width], data);
        Ok(finish(EOp::SliceCols { start, end }, self, None, out, recorder, tensors))
    }

    /// Concatenates along the second dimension: `[B, p] ++ [B, q] -> [B, p + q]`.
    pub fn concat_cols(&self, other: &Tensor, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor> {
        let (rows, p) = require_2d("concat_cols", self)?;
        let (other_rows, q) = require_2d("concat_cols", other)?;
        if rows != other_rows {
            return Err(MlError::ShapeMismatch {
                op: "concat_cols",
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        let mut data = Vec::with_capacity(rows * (p + q));
        for r in 0..rows {
            data.extend_from_slice(&self.data[r * p..(r + 1) * p]);
            data.extend_from_slice(&other.data[r * q..(r + 1) * q]);
        }
        let out = Tensor::raw(vec![rows, p + q], data);
        Ok(finish(EOp::ConcatCols, self, Some(other), out, recorder, tensors))
    }

    /// Normalizes each column with the batch mean and population variance.
    pub fn batch_normalize(&self, eps: f32, recorder: &mut impl Recorder, tensors: &mut TensorStore) -> Result<Tensor> {
        let (rows, cols) = require_2d("batch_normalize", self)?;
        let (mean, var) = column_stats(&self.data, rows, cols);
        let mut data = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                let i = r * cols + c;
                data[i] = (self.data[i] - mean[c]) / (var[c] + eps).sqrt();
            }
        }
        let out = Tensor::raw(self.shape.clone(), data);
        Ok(finish(EOp::BatchNormalize { eps }, self, None, out, recorder, tensors))
    }
}

/// Per-column mean and population variance of a row-major `[rows, cols]` buffer.
pub(crate) fn column_stats(data: &[f32], rows: usize, cols: usize) -> (Vec<f32>, Vec<f32>) {
    let n = rows.max(1) as f32;
    let mut mean = vec![0.0f32; cols];
    for r in 0..rows {
        for c in 0..cols {
            mean[c] += data[r * cols + c];
        }
    }
    for m in &mut mean {
        *m /= n;
    }
    let mut var = vec![0.0f32; cols];
    for r in 0..rows {
        for c in 0..cols {
            let d = data[r * cols + c] - mean[c];
            var[c] += d * d;
        }
    }
    for v in &mut var {
        *v /= n;
    }
    (mean, var)
}
