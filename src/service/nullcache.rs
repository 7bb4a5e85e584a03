//! Always misses, never stores. Grounded on `original_source/libs/
//! service/include/mapget/service/nullcache.h`; used when TTL `<= 0`
//! effectively disables caching (§4.6).

use crate::error::Result;
use crate::model::MapTileKey;
use crate::service::cache::{Cache, CacheCommon};

#[derive(Default)]
pub struct NullCache {
    common: CacheCommon,
}

impl NullCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for NullCache {
    fn get_tile_layer_blob(&self, _key: &MapTileKey) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn put_tile_layer_blob(&self, _key: &MapTileKey, _blob: &[u8]) -> Result<()> {
        Ok(())
    }

    fn get_string_pool_blob(&self, _node_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn put_string_pool_blob(&self, _node_id: &str, _blob: &[u8]) -> Result<()> {
        Ok(())
    }

    fn for_each_tile_layer_blob(&self, _visitor: &mut dyn FnMut(&MapTileKey, &[u8])) -> Result<()> {
        Ok(())
    }

    fn common(&self) -> &CacheCommon {
        &self.common
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LayerType, TileId};

    #[test]
    fn never_hits() {
        let cache = NullCache::new();
        let key = MapTileKey::new(LayerType::Features, "Tropico", "WayLayer", TileId::from_value(1));
        cache.put_tile_layer_blob(&key, b"x").unwrap();
        assert!(cache.get_tile_layer_blob(&key).unwrap().is_none());
    }
}
