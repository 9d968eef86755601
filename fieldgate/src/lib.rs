//! Resilient transport layer of an industrial data gateway.
//!
//! South connectors acquire values and files, north connectors cache them
//! durably and deliver them, retrying through connection loss and
//! quarantining what the destination refuses.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod north;
pub mod south;
pub mod utils;

pub use engine::Engine;
pub use error::{Error, Result};
