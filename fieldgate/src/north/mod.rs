//! North (delivery) side of the gateway.

pub mod connector;
pub mod coordinator;
pub mod delivery;
pub mod drivers;
pub mod sink;

pub use connector::NorthConnector;
pub use coordinator::{CacheCoordinator, CachePaths};
pub use delivery::{DeliveryLoop, RunReport};
pub use drivers::build_sink;
pub use sink::{Batch, Rejection, SendOutcome, Sink};
