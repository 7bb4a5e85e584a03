//! mapget core: the columnar feature model, the shared string pool, and the
//! service pipeline (scheduler, cache, data sources) that together resolve
//! tile requests against pluggable sources.
//!
//! HTTP routing, CLI glue and file-format converters live outside this
//! crate; it covers the in-memory model, the wire format, and the
//! scheduling/caching machinery that those surfaces sit on top of.

pub mod config;
pub mod error;
pub mod model;
pub mod service;

pub use error::{Error, Result};
pub use mapget_tile_utils::{BlobFormat, TileId};
