//! Capacity-bounded FIFO in-memory `Cache`. Grounded on `original_source/
//! libs/service/include/mapget/service/memcache.h` (`MemCache`, eviction
//! on insertion order).

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::error::Result;
use crate::model::MapTileKey;
use crate::service::cache::{Cache, CacheCommon};

struct TileStore {
    order: VecDeque<MapTileKey>,
    blobs: HashMap<MapTileKey, Vec<u8>>,
}

/// FIFO-evicting memory cache. `max_tiles == 0` behaves like a null cache
/// for tile blobs (every put is immediately evicted).
pub struct MemCache {
    max_tiles: usize,
    tiles: RwLock<TileStore>,
    pools: RwLock<HashMap<String, Vec<u8>>>,
    common: CacheCommon,
}

impl MemCache {
    #[must_use]
    pub fn new(max_tiles: usize) -> Self {
        Self {
            max_tiles,
            tiles: RwLock::new(TileStore {
                order: VecDeque::new(),
                blobs: HashMap::new(),
            }),
            pools: RwLock::new(HashMap::new()),
            common: CacheCommon::new(),
        }
    }
}

impl Cache for MemCache {
    fn get_tile_layer_blob(&self, key: &MapTileKey) -> Result<Option<Vec<u8>>> {
        Ok(self.tiles.read().expect("tile store lock poisoned").blobs.get(key).cloned())
    }

    fn put_tile_layer_blob(&self, key: &MapTileKey, blob: &[u8]) -> Result<()> {
        let mut store = self.tiles.write().expect("tile store lock poisoned");
        if !store.blobs.contains_key(key) {
            store.order.push_back(key.clone());
        }
        store.blobs.insert(key.clone(), blob.to_vec());
        while store.blobs.len() > self.max_tiles {
            if let Some(oldest) = store.order.pop_front() {
                store.blobs.remove(&oldest);
            } else {
                break;
            }
        }
        Ok(())
    }

    fn get_string_pool_blob(&self, node_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.pools.read().expect("pool map lock poisoned").get(node_id).cloned())
    }

    fn put_string_pool_blob(&self, node_id: &str, blob: &[u8]) -> Result<()> {
        self.pools
            .write()
            .expect("pool map lock poisoned")
            .insert(node_id.to_string(), blob.to_vec());
        Ok(())
    }

    fn for_each_tile_layer_blob(&self, visitor: &mut dyn FnMut(&MapTileKey, &[u8])) -> Result<()> {
        let store = self.tiles.read().expect("tile store lock poisoned");
        for key in &store.order {
            if let Some(blob) = store.blobs.get(key) {
                visitor(key, blob);
            }
        }
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

    fn key(tile: u64) -> MapTileKey {
        MapTileKey::new(LayerType::Features, "Tropico", "WayLayer", TileId::from_value(tile))
    }

    #[test]
    fn fifo_eviction_at_capacity_one() {
        let cache = MemCache::new(1);
        cache.put_tile_layer_blob(&key(1), b"a").unwrap();
        cache.put_tile_layer_blob(&key(2), b"b").unwrap();

        assert!(cache.get_tile_layer_blob(&key(1)).unwrap().is_none());
        assert_eq!(cache.get_tile_layer_blob(&key(2)).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn overwriting_existing_key_does_not_advance_eviction_order() {
        // Eviction order tracks original insertion, not last write: re-putting
        // key 1 doesn't move it to the back of the FIFO.
        let cache = MemCache::new(2);
        cache.put_tile_layer_blob(&key(1), b"a").unwrap();
        cache.put_tile_layer_blob(&key(2), b"b").unwrap();
        cache.put_tile_layer_blob(&key(1), b"a2").unwrap();
        cache.put_tile_layer_blob(&key(3), b"c").unwrap();

        assert!(cache.get_tile_layer_blob(&key(1)).unwrap().is_none());
        assert_eq!(cache.get_tile_layer_blob(&key(2)).unwrap(), Some(b"b".to_vec()));
        assert_eq!(cache.get_tile_layer_blob(&key(3)).unwrap(), Some(b"c".to_vec()));
    }
}
