//! Keyed blob store with derived tile (de)serialization helpers (§4.6).
//! Grounded on `original_source/libs/service/include/mapget/service/
//! cache.h` + `src/cache.cpp` (`Cache::getTileLayer`/`putTileLayer`,
//! per-node string pool cache, hit/miss/loaded-pool counters).

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::model::{DataSourceInfo, LayerType, MapTileKey, StringId, StringPool, TileFeatureLayer, TileHeader};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub loaded_string_pools: u64,
}

/// State shared by every `Cache` implementation: the per-node `StringPool`
/// cache (loaded lazily from persisted blobs) and hit/miss counters. Each
/// implementation owns one and exposes it through `Cache::common`.
#[derive(Default)]
pub struct CacheCommon {
    pools: RwLock<HashMap<String, Arc<RwLock<StringPool>>>>,
    persisted_offsets: RwLock<HashMap<String, StringId>>,
    hits: AtomicU64,
    misses: AtomicU64,
    loaded_pools: AtomicU64,
}

impl CacheCommon {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            loaded_string_pools: self.loaded_pools.load(Ordering::Relaxed),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the node's pool, loading it from `loader` on first demand.
    fn get_or_insert_pool(
        &self,
        node_id: &str,
        loader: impl FnOnce() -> Result<Option<Vec<u8>>>,
    ) -> Result<Arc<RwLock<StringPool>>> {
        if let Some(pool) = self.pools.read().expect("pool map lock poisoned").get(node_id) {
            return Ok(pool.clone());
        }
        let mut pool = StringPool::new(node_id);
        if let Some(blob) = loader()? {
            let mut cursor = Cursor::new(blob);
            StringPool::read_node_id(&mut cursor)?;
            pool.read(&mut cursor)?;
            self.loaded_pools.fetch_add(1, Ordering::Relaxed);
        }
        let arc = Arc::new(RwLock::new(pool));
        self.pools.write().expect("pool map lock poisoned").insert(node_id.to_string(), arc.clone());
        Ok(arc)
    }

    fn persisted_offset(&self, node_id: &str) -> StringId {
        *self.persisted_offsets.read().expect("offsets lock poisoned").get(node_id).unwrap_or(&0)
    }

    fn set_persisted_offset(&self, node_id: &str, offset: StringId) {
        self.persisted_offsets
            .write()
            .expect("offsets lock poisoned")
            .insert(node_id.to_string(), offset);
    }
}

/// A keyed blob store for tile layers and their source nodes' string
/// pools. Implementations only need to provide the four blob primitives
/// plus `common()`; `get_tile_layer`/`put_tile_layer` are derived.
pub trait Cache: Send + Sync {
    fn get_tile_layer_blob(&self, key: &MapTileKey) -> Result<Option<Vec<u8>>>;
    fn put_tile_layer_blob(&self, key: &MapTileKey, blob: &[u8]) -> Result<()>;
    fn get_string_pool_blob(&self, node_id: &str) -> Result<Option<Vec<u8>>>;
    fn put_string_pool_blob(&self, node_id: &str, blob: &[u8]) -> Result<()>;
    fn for_each_tile_layer_blob(&self, visitor: &mut dyn FnMut(&MapTileKey, &[u8])) -> Result<()>;
    fn common(&self) -> &CacheCommon;

    fn stats(&self) -> CacheStats {
        self.common().stats()
    }

    /// Reads the blob for `key`, resolving the node's string pool (loading
    /// it from a persisted pool blob on first demand), and parses the tile.
    /// Returns `None` on a miss or an expired TTL.
    fn get_tile_layer(&self, key: &MapTileKey, info: &DataSourceInfo) -> Result<Option<TileFeatureLayer>> {
        let Some(blob) = self.get_tile_layer_blob(key)? else {
            self.common().record_miss();
            return Ok(None);
        };
        let Some(layer_info) = info.get_layer(&key.layer_id) else {
            self.common().record_miss();
            return Ok(None);
        };
        let layer_info = Arc::new(layer_info.clone());

        let mut peek_cursor = Cursor::new(blob.clone());
        let header = TileHeader::read(&mut peek_cursor)?;

        let pool = self
            .common()
            .get_or_insert_pool(&header.node_id, || self.get_string_pool_blob(&header.node_id))?;

        let mut cursor = Cursor::new(blob);
        let layer = TileFeatureLayer::read(&mut cursor, layer_info, pool)?;

        if let Some(ttl) = layer.header.ttl_ms {
            if ttl <= 0 {
                self.common().record_miss();
                return Ok(None);
            }
            let expires_at_us = layer.header.timestamp_us + ttl * 1000;
            if now_us() >= expires_at_us {
                self.common().record_miss();
                return Ok(None);
            }
        }

        self.common().record_hit();
        Ok(Some(layer))
    }

    /// Persists the layer blob, and the node's full string pool if it has
    /// grown since it was last persisted. The pool is written in full
    /// (`fromOffset = 0`), never as a delta, since this is a backing store
    /// rather than a stream session — partial dictionaries would corrupt a
    /// later reader that never saw the earlier portion (§4.5).
    fn put_tile_layer(&self, layer: &TileFeatureLayer) -> Result<()> {
        {
            let pool = layer.string_pool.read().expect("string pool lock poisoned");
            let node_id = pool.node_id().to_string();
            let highest = pool.highest();
            if highest > self.common().persisted_offset(&node_id) {
                let mut pool_buf = Vec::new();
                pool.write(&mut pool_buf, 0)?;
                self.put_string_pool_blob(&node_id, &pool_buf)?;
                self.common().set_persisted_offset(&node_id, highest);
            }
        }

        let mut layer_buf = Vec::new();
        layer.write(&mut layer_buf)?;
        let key = MapTileKey::new(
            LayerType::Features,
            layer.header.map_id.clone(),
            layer.header.layer_id.clone(),
            layer.header.tile_id,
        );
        self.put_tile_layer_blob(&key, &layer_buf)
    }
}

/// Microseconds since the Unix epoch, used for TTL expiry checks.
fn now_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeatureTypeInfo, LayerInfo, LayerType, TileId};
    use crate::service::memcache::MemCache;

    fn layer_info() -> LayerInfo {
        LayerInfo {
            layer_id: "WayLayer".to_string(),
            layer_type: LayerType::Features,
            feature_types: vec![FeatureTypeInfo {
                name: "Way".to_string(),
                unique_id_compositions: vec![crate::model::info::IdComposition { parts: Vec::new() }],
            }],
            zoom_levels: Vec::new(),
            coverage: None,
            can_read: true,
            can_write: true,
            version: crate::model::Version::new(1, 0, 0),
        }
    }

    fn source_info() -> DataSourceInfo {
        DataSourceInfo {
            node_id: "node-a".to_string(),
            map_id: "Tropico".to_string(),
            layers: HashMap::from([("WayLayer".to_string(), layer_info())]),
            max_parallel_jobs: 1,
            is_add_on: false,
            protocol_version: None,
            extra_json_attachment: None,
        }
    }

    fn new_layer(ttl_ms: Option<i64>) -> TileFeatureLayer {
        let pool = Arc::new(RwLock::new(StringPool::new("node-a")));
        let mut layer = TileFeatureLayer::new(TileId::from_value(1), "node-a", "Tropico", Arc::new(layer_info()), pool);
        layer.header.ttl_ms = ttl_ms;
        layer.header.timestamp_us = now_us();
        layer.new_feature("Way", vec![]).unwrap();
        layer
    }

    #[test]
    fn put_then_get_round_trips_through_blob_cache() {
        let cache = MemCache::new(10);
        let layer = new_layer(None);
        cache.put_tile_layer(&layer).unwrap();

        let key = MapTileKey::new(LayerType::Features, "Tropico", "WayLayer", TileId::from_value(1));
        let fetched = cache.get_tile_layer(&key, &source_info()).unwrap().expect("cache hit");
        assert_eq!(fetched.size(), 1);
        assert_eq!(cache.stats().cache_hits, 1);
        assert_eq!(cache.stats().cache_misses, 0);
    }

    #[test]
    fn miss_records_stat_and_returns_none() {
        let cache = MemCache::new(10);
        let key = MapTileKey::new(LayerType::Features, "Tropico", "WayLayer", TileId::from_value(99));
        let fetched = cache.get_tile_layer(&key, &source_info()).unwrap();
        assert!(fetched.is_none());
        assert_eq!(cache.stats().cache_misses, 1);
    }

    /// §8: "TTL <= 0 causes cache `get` to report expired immediately,
    /// forcing refetch."
    #[test]
    fn non_positive_ttl_is_reported_as_an_immediate_miss() {
        let cache = MemCache::new(10);
        let layer = new_layer(Some(0));
        cache.put_tile_layer(&layer).unwrap();

        let key = MapTileKey::new(LayerType::Features, "Tropico", "WayLayer", TileId::from_value(1));
        let fetched = cache.get_tile_layer(&key, &source_info()).unwrap();
        assert!(fetched.is_none());
        assert_eq!(cache.stats().cache_misses, 1);
    }

    #[test]
    fn already_elapsed_ttl_is_a_miss() {
        let cache = MemCache::new(10);
        let mut layer = new_layer(Some(1));
        layer.header.timestamp_us = now_us() - 10_000_000;
        cache.put_tile_layer(&layer).unwrap();

        let key = MapTileKey::new(LayerType::Features, "Tropico", "WayLayer", TileId::from_value(1));
        assert!(cache.get_tile_layer(&key, &source_info()).unwrap().is_none());
    }

    #[test]
    fn string_pool_is_persisted_once_and_reused_across_puts() {
        let cache = MemCache::new(10);
        let layer = new_layer(None);
        cache.put_tile_layer(&layer).unwrap();
        assert_eq!(cache.stats().loaded_string_pools, 0);

        let key = MapTileKey::new(LayerType::Features, "Tropico", "WayLayer", TileId::from_value(1));
        cache.get_tile_layer(&key, &source_info()).unwrap();
        assert_eq!(cache.stats().loaded_string_pools, 1);

        // Second get reuses the already-loaded pool, not a fresh load.
        cache.get_tile_layer(&key, &source_info()).unwrap();
        assert_eq!(cache.stats().loaded_string_pools, 1);
    }
}
