//! The request scheduler, the pluggable cache abstraction and its memory
//! and SQLite-backed implementations, the `DataSource` contract, the
//! remote (HTTP) data source, and the locate request/response types.

pub mod cache;
pub mod datasource;
pub mod locate;
pub mod memcache;
pub mod nullcache;
pub mod remote;
pub mod scheduler;
#[cfg(feature = "sqlite-cache")]
pub mod sqlitecache;

pub use cache::{Cache, CacheCommon, CacheStats};
pub use datasource::{AuthGate, DataSource};
pub use locate::{LocateRequest, LocateResponse, LocatedTileKey};
pub use memcache::MemCache;
pub use nullcache::NullCache;
pub use remote::RemoteDataSource;
pub use scheduler::{Request, RequestStatus, Service};
#[cfg(feature = "sqlite-cache")]
pub use sqlitecache::SqliteCache;
