//! Client-side sync layer of the cantina point of sale.
//!
//! Everything here is single-threaded: components share state through `Rc` and
//! spawn their background loops with `spawn_local`, so they have to be driven
//! from inside a [tokio::task::LocalSet]. [block_on_local] sets one up.

use std::{future::Future, time::Duration};

use color_eyre::eyre::{Result, WrapErr};
use tokio::task::LocalSet;

pub mod autosave;
pub mod cart;
pub mod config;
pub mod connectivity;
pub mod errors;
pub mod flush;
pub mod logging;
pub mod model;
pub mod persist;
pub mod queue;
pub mod realtime;
pub mod remote;
pub mod session;
pub mod views;

#[cfg(test)]
mod test_support;

/// Installs error reporting and file logging, then loads the layered configuration.
pub fn init() -> Result<config::Config> {
    errors::init()?;
    logging::init()?;
    config::Config::new().wrap_err("Failed to load configuration")
}

/// Runs `fut` to completion on a fresh single-threaded runtime with a `LocalSet`.
pub fn block_on_local<F: Future>(fut: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .wrap_err_with(|| "Failed to start Tokio runtime")?;
    let output = LocalSet::new().block_on(&runtime, fut);
    runtime.shutdown_timeout(Duration::from_secs(5));
    Ok(output)
}
