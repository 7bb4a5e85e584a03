//! Tile addressing and blob-format helpers shared by the mapget model and
//! service crates. Kept dependency-light on purpose, the way `martin-tile-utils`
//! is kept free of the rest of martin's stack.

mod tile_id;

pub use tile_id::TileId;

/// Sniffs the format of an opaque blob, the way `martin-tile-utils::DataFormat`
/// sniffs tile bytes by magic prefix. Used by the cache and wire-stream code to
/// tell a raw model-pool blob apart from one that arrived gzip/zlib-compressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobFormat {
    Raw,
    Gzip,
    Zlib,
    Unknown,
}

impl BlobFormat {
    #[must_use]
    pub fn detect(data: &[u8]) -> Self {
        match data {
            v if v.len() >= 2 && v[0..2] == [0x1f, 0x8b] => Self::Gzip,
            v if v.len() >= 2 && v[0..2] == [0x78, 0x9c] => Self::Zlib,
            v if !v.is_empty() => Self::Raw,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_gzip_prefix() {
        assert_eq!(BlobFormat::detect(&[0x1f, 0x8b, 0x08, 0x00]), BlobFormat::Gzip);
    }

    #[test]
    fn detects_zlib_prefix() {
        assert_eq!(BlobFormat::detect(&[0x78, 0x9c, 0x00]), BlobFormat::Zlib);
    }

    #[test]
    fn falls_back_to_raw() {
        assert_eq!(BlobFormat::detect(&[0x02, 0x00, 0x00, 0x00]), BlobFormat::Raw);
    }

    #[test]
    fn empty_is_unknown() {
        assert_eq!(BlobFormat::detect(&[]), BlobFormat::Unknown);
    }
}
