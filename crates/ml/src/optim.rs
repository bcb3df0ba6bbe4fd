use crate::Tensor;
use std::collections::HashMap;

/// Adam optimizer.
///
/// Moment estimates are keyed by parameter id, so parameters may be fed one
/// at a time in any order and a parameter shared by several models is only
/// tracked once.
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: u32,
    moments: HashMap<usize, (Vec<f32>, Vec<f32>)>,
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(1e-3)
    }
}

impl Adam {
    #[must_use]
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            moments: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    #[must_use]
    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// Starts a new optimization step. Call once before [`Adam::update`]ing
    /// the parameters of that step.
    pub fn begin_step(&mut self) {
        self.t += 1;
    }

    /// Applies the current step to one parameter. Parameters without a
    /// gradient are left untouched.
    pub fn update(&mut self, p: &mut Tensor) {
        let Some(grad) = p.grad.as_ref() else {
            return;
        };
        let t = self.t.max(1) as i32;
        let lr_t = self.lr * (1.0 - self.beta2.powi(t)).sqrt() / (1.0 - self.beta1.powi(t));
        let len = p.data.len();
        let (m, v) = self
            .moments
            .entry(p.id)
            .or_insert_with(|| (vec![0.0; len], vec![0.0; len]));
        for j in 0..len {
            m[j] = self.beta1 * m[j] + (1.0 - self.beta1) * grad[j];
            v[j] = self.beta2 * v[j] + (1.0 - self.beta2) * grad[j].powi(2);
            p.data[j] -= lr_t * m[j] / (v[j].sqrt() + self.eps);
        }
    }

    /// One full step over a slice of parameters.
    pub fn step(&mut self, params: &mut [&mut Tensor]) {
        self.begin_step();
        for p in params.iter_mut() {
            self.update(p);
        }
    }
}
