//! # ml
//!
//! A small CPU tensor library with reverse-mode automatic differentiation.
//!
//! Ops are evaluated eagerly and recorded into a [`recorder::Recorder`]:
//! a [`graph::Graph`] for inference or a [`tape::Tape`] when gradients are
//! needed. Values live in a [`TensorStore`] keyed by tensor id, which the
//! tape reads back during [`tape::Tape::backward`].

pub mod error;
pub mod graph;
pub mod nn;
pub mod ops;
pub mod optim;
pub mod recorder;
pub mod tape;
pub mod tensor;

pub use error::MlError;
pub use graph::Graph;
pub use nn::{BatchNorm1d, Dense, Layer};
pub use optim::Adam;
pub use recorder::Recorder;
pub use tape::Tape;
pub use tensor::{Tensor, TensorStore};
