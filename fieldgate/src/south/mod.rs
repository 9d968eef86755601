//! South (acquisition) side of the gateway.

pub mod connector;
pub mod drivers;
pub mod source;

pub use connector::SouthConnector;
pub use drivers::build_source;
pub use source::{AcquisitionSink, Source};
