//! North cache: durable buffers between acquisition and delivery.
//!
//! ## Core Types
//!
//! - [`FileCache`] - FIFO of files awaiting delivery, with quarantine and archival
//! - [`ValueCache`] - Ordered store of values awaiting delivery
//! - [`ErrorStore`] - Shared quarantine area, injected into every cache
//! - [`ArchiveSweeper`] - Background retention sweep of archived files
//!
//! Everything a cache accepts is on disk before the call returns, and every
//! terminal transition of a file is a move, never a copy followed by a
//! delete that might fail silently.

pub mod archive;
pub mod error;
pub mod error_store;
pub mod file_cache;
pub mod fs;
pub mod naming;
pub mod value_cache;

pub use archive::{ArchiveConfig, ArchiveSweeper, SweepReport};
pub use error::{CacheError, Result};
pub use error_store::{ErrorFileFilter, ErrorFileInfo, ErrorStore};
pub use file_cache::{CachedFile, Deferred, FileCache};
pub use value_cache::{CachedValue, PointValue, ValueCache};
