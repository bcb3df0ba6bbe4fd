use crate::error::{MlError, Result};
use rand::{distributions::Uniform, Rng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Values seen during a forward pass, keyed by tensor id.
///
/// Every recorded op inserts its inputs and its output here so that
/// [`crate::tape::Tape::backward`] can look them up again.
pub type TensorStore = HashMap<usize, Tensor>;

/// A dense row-major `f32` tensor.
///
/// Cloning keeps the `id`, so a clone stands for the same value in a
/// [`TensorStore`]. Freshly built tensors always get a new id; use
/// [`Tensor::duplicate`] for an independent copy.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub id: usize,
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
    pub requires_grad: bool,
    pub grad: Option<Vec<f32>>,
}

impl Tensor {
    pub fn from_vec(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(MlError::ElementCount {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self::raw(shape, data))
    }

    pub(crate) fn raw(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            id: next_id(),
            data,
            shape,
            requires_grad: false,
            grad: None,
        }
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    #[must_use]
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product::<usize>();
        Self::raw(shape, vec![value; len])
    }

    /// Samples every element uniformly from `[low, high)`.
    pub fn rand_uniform(shape: Vec<usize>, low: f32, high: f32, rng: &mut impl Rng) -> Self {
        let len = shape.iter().product::<usize>();
        let dist = Uniform::new(low, high);
        let data = (0..len).map(|_| rng.sample(dist)).collect();
        Self::raw(shape, data)
    }

    /// Copies the values into a new tensor with its own id and no gradient.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            requires_grad: self.requires_grad,
            ..Self::raw(self.shape.clone(), self.data.clone())
        }
    }

    /// Marks the tensor as a trainable leaf.
    #[must_use]
    pub fn with_grad(mut self) -> Self {
        self.requires_grad = true;
        self
    }

    pub fn set_requires_grad(&mut self) {
        self.requires_grad = true;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of rows of a 2-D tensor (the batch dimension).
    #[must_use]
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Number of elements per row.
    #[must_use]
    pub fn cols(&self) -> usize {
        if self.shape.len() < 2 {
            return self.data.len();
        }
        self.shape[1..].iter().product()
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Copies the gradient computed for this tensor's id out of `tensors`.
    ///
    /// Used after [`crate::tape::Tape::backward`], since the backward pass
    /// writes into the store rather than into the caller's parameters.
    pub fn pull_grad(&mut self, tensors: &TensorStore) {
        self.grad = tensors.get(&self.id).and_then(|t| t.grad.clone());
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    /// Returns row `i` of a 2-D tensor.
    #[must_use]
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }
}
