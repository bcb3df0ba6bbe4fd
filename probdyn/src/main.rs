//! # probdyn
//!
//! Fits an ensemble of probabilistic dynamics models on a small synthetic
//! environment and reports the ensemble's uncertainty. Set `RUST_LOG` to
//! control log output (default `info`).

use anyhow::Result;
use clap::Parser;
use probdyn::app::{self, Args};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    let report = app::run(&args)?;
    println!("{}", report.to_json());
    Ok(())
}
