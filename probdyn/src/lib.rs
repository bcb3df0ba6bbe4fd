//! # probdyn: ensemble probabilistic dynamics
//!
//! Documentation entry point for the workspace.
//!
//! ## Overview
//!
//! Model-based reinforcement learning plans against a learned model of the
//! environment. A model that is confidently wrong away from its training data
//! gets exploited by the planner, so the model must also say how much it can
//! be trusted. The crates here learn an ensemble of Gaussian transition/reward
//! models whose disagreement grows on unfamiliar inputs.
//!
//! ## The crates
//!
//! -   **[`ml`]:** a small CPU tensor library. Ops are recorded into a
//!     [`ml::Graph`] for inference or a [`ml::Tape`] for reverse-mode
//!     gradients, and [`ml::Adam`] updates parameters.
//! -   **[`dynamics`]:** [`dynamics::ProbabilisticDynamics`] predicts a mean
//!     and bounded log standard deviation for `(next_obs - obs, reward)`;
//!     [`dynamics::EnsembleDynamics`] averages several members and aggregates
//!     their uncertainty with [`dynamics::VarianceType`].
//! -   **`probdyn`:** this crate. The binary collects random transitions from
//!     [`env::RollingSphereEnv`], fits an ensemble, and logs its uncertainty on
//!     seen and unseen inputs ([`app::run`]).
//!
//! ## Running
//!
//! ```text
//! RUST_LOG=info cargo run -p probdyn -- --steps 500 --variance-type data
//! ```

pub mod app;
pub mod env;

pub use dynamics;
pub use ml;
