use thiserror::Error;

/// The single error type threaded through model, service and config code,
/// mirroring the shape of the teacher's `FileError` in `src/file_config.rs`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("truncated frame: expected {expected} bytes, got {got}")]
    TruncatedFrame { expected: usize, got: usize },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("incompatible protocol version: peer {peer_major}.{peer_minor}, local {local_major}.{local_minor}")]
    IncompatibleVersion {
        peer_major: u16,
        peer_minor: u16,
        local_major: u16,
        local_minor: u16,
    },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("missing mandatory field: {0}")]
    MissingField(&'static str),

    #[error("invalid id part: {0}")]
    InvalidIdPart(String),

    #[error("no matching id composition for feature type {0}")]
    NoMatchingComposition(String),

    #[error("contract violation: {0}")]
    Contract(String),

    #[error("tile prefix already set, cannot change after features were added")]
    PrefixAlreadySet,

    #[error("string pool integrity error: id {id} already bound to a different string")]
    StringPoolConflict { id: u16 },

    #[error("unknown string id: {0}")]
    UnknownStringId(u16),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("sqlite error: {0}")]
    #[cfg(feature = "sqlite-cache")]
    Sqlite(#[from] rusqlite::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unauthorized")]
    Unauthorized,
}

pub type Result<T> = std::result::Result<T, Error>;
