//! On-disk `Cache` backed by SQLite. Grounded on `original_source/libs/
//! service/src/sqlitecache.cpp` (table DDL, WAL pragmas, oldest-first
//! eviction). Gated behind the `sqlite-cache` feature.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::model::MapTileKey;
use crate::service::cache::{Cache, CacheCommon};

/// `rusqlite::Connection` is `Send` but not `Sync`; a single mutex
/// serializes both reads and writes, trading the original's WAL
/// concurrent-reader path for a simpler, still-correct one.
pub struct SqliteCache {
    max_tiles: i64,
    conn: Mutex<Connection>,
    common: CacheCommon,
}

impl SqliteCache {
    pub fn open(path: &Path, max_tiles: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tiles (
                key TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                timestamp INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS tiles_timestamp_idx ON tiles (timestamp ASC);
             CREATE TABLE IF NOT EXISTS string_pools (
                node_id TEXT PRIMARY KEY,
                data BLOB NOT NULL
             );",
        )?;

        let cache = Self {
            max_tiles: max_tiles as i64,
            conn: Mutex::new(conn),
            common: CacheCommon::new(),
        };
        cache.evict_until_within_capacity()?;
        Ok(cache)
    }

    fn evict_until_within_capacity(&self) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite connection lock poisoned");
        loop {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM tiles", [], |row| row.get(0))?;
            if count <= self.max_tiles {
                break;
            }
            conn.execute(
                "DELETE FROM tiles WHERE key = (SELECT key FROM tiles ORDER BY timestamp ASC LIMIT 1)",
                [],
            )?;
        }
        Ok(())
    }
}

impl Cache for SqliteCache {
    fn get_tile_layer_blob(&self, key: &MapTileKey) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("sqlite connection lock poisoned");
        let blob = conn
            .query_row("SELECT data FROM tiles WHERE key = ?1", params![key.to_canonical_string()], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(blob)
    }

    fn put_tile_layer_blob(&self, key: &MapTileKey, blob: &[u8]) -> Result<()> {
        let now_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        {
            let conn = self.conn.lock().expect("sqlite connection lock poisoned");
            conn.execute(
                "INSERT INTO tiles (key, data, timestamp) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET data = excluded.data, timestamp = excluded.timestamp",
                params![key.to_canonical_string(), blob, now_us],
            )?;
        }
        self.evict_until_within_capacity()
    }

    fn get_string_pool_blob(&self, node_id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("sqlite connection lock poisoned");
        let blob = conn
            .query_row("SELECT data FROM string_pools WHERE node_id = ?1", params![node_id], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(blob)
    }

    fn put_string_pool_blob(&self, node_id: &str, blob: &[u8]) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite connection lock poisoned");
        conn.execute(
            "INSERT INTO string_pools (node_id, data) VALUES (?1, ?2)
             ON CONFLICT(node_id) DO UPDATE SET data = excluded.data",
            params![node_id, blob],
        )?;
        Ok(())
    }

    fn for_each_tile_layer_blob(&self, visitor: &mut dyn FnMut(&MapTileKey, &[u8])) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite connection lock poisoned");
        let mut stmt = conn.prepare("SELECT key, data FROM tiles ORDER BY timestamp ASC")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key_str: String = row.get(0)?;
            let data: Vec<u8> = row.get(1)?;
            if let Some(key) = parse_canonical_key(&key_str) {
                visitor(&key, &data);
            }
        }
        Ok(())
    }

    fn common(&self) -> &CacheCommon {
        &self.common
    }
}

fn parse_canonical_key(s: &str) -> Option<MapTileKey> {
    let mut parts = s.splitn(4, ':');
    let layer_type = match parts.next()? {
        "features" => crate::model::LayerType::Features,
        "source-data" => crate::model::LayerType::SourceData,
        _ => return None,
    };
    let map_id = parts.next()?;
    let layer_id = parts.next()?;
    let tile_id_hex = parts.next()?;
    let tile_id = crate::model::TileId::from_value(u64::from_str_radix(tile_id_hex, 16).ok()?);
    Some(MapTileKey::new(layer_type, map_id, layer_id, tile_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LayerType, TileId};
    use tempfile::tempdir;

    fn key(tile: u64) -> MapTileKey {
        MapTileKey::new(LayerType::Features, "Tropico", "WayLayer", TileId::from_value(tile))
    }

    #[test]
    fn oldest_tile_is_evicted_at_capacity() {
        let dir = tempdir().unwrap();
        let cache = SqliteCache::open(&dir.path().join("cache.sqlite"), 1).unwrap();
        cache.put_tile_layer_blob(&key(1), b"a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.put_tile_layer_blob(&key(2), b"b").unwrap();

        assert!(cache.get_tile_layer_blob(&key(1)).unwrap().is_none());
        assert_eq!(cache.get_tile_layer_blob(&key(2)).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn reopening_evicts_down_to_capacity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.sqlite");
        {
            let cache = SqliteCache::open(&path, 10).unwrap();
            cache.put_tile_layer_blob(&key(1), b"a").unwrap();
            cache.put_tile_layer_blob(&key(2), b"b").unwrap();
        }
        let reopened = SqliteCache::open(&path, 1).unwrap();
        assert!(reopened.get_tile_layer_blob(&key(1)).unwrap().is_none());
        assert_eq!(reopened.get_tile_layer_blob(&key(2)).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn string_pool_blob_round_trips() {
        let dir = tempdir().unwrap();
        let cache = SqliteCache::open(&dir.path().join("cache.sqlite"), 10).unwrap();
        cache.put_string_pool_blob("node-a", b"pool-bytes").unwrap();
        assert_eq!(cache.get_string_pool_blob("node-a").unwrap(), Some(b"pool-bytes".to_vec()));
    }
}
