//! Uniform fill/locate contract over local code or HTTP (§4.7). Grounded
//! on `original_source/libs/service/include/mapget/service/datasource.h`
//! + `src/datasource.cpp` (`DataSource::get` timing wrapper, header/regex
//! auth alternatives).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use regex::Regex;

use crate::error::{Error, Result};
use crate::model::{DataSourceInfo, MapTileKey, StringPool, TileFeatureLayer, TileSourceDataLayer};
use crate::service::cache::Cache;
use crate::service::locate::{LocateRequest, LocateResponse};

/// One `(header, pattern)` alternative. A request is authorized if it
/// matches any registered alternative, or if none are registered.
struct AuthAlternative {
    header: String,
    pattern: Regex,
}

#[derive(Default)]
pub struct AuthGate {
    alternatives: Vec<AuthAlternative>,
}

impl AuthGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_alternative(&mut self, header: impl Into<String>, pattern: &str) -> Result<()> {
        let pattern = Regex::new(pattern).map_err(|e| Error::Config(e.to_string()))?;
        self.alternatives.push(AuthAlternative {
            header: header.into(),
            pattern,
        });
        Ok(())
    }

    #[must_use]
    pub fn is_authorized(&self, headers: &HashMap<String, String>) -> bool {
        if self.alternatives.is_empty() {
            return true;
        }
        self.alternatives
            .iter()
            .any(|alt| headers.get(&alt.header).is_some_and(|v| alt.pattern.is_match(v)))
    }
}

/// A provider of tile content for one or more layers of one map. Local
/// sources implement `fill` directly; `service::remote::RemoteDataSource`
/// wraps the same contract over HTTP.
pub trait DataSource: Send + Sync {
    fn info(&self) -> DataSourceInfo;

    /// Populates an empty `TileFeatureLayer` the caller allocated.
    fn fill(&self, tile: &mut TileFeatureLayer) -> Result<()>;

    /// Populates an empty `TileSourceDataLayer`. Most sources never
    /// advertise a `source-data` layer, so the default is a no-op.
    fn fill_source_data(&self, _tile: &mut TileSourceDataLayer) -> Result<()> {
        Ok(())
    }

    /// Resolves a feature id to the tile(s) that contain it. Empty by
    /// default; sources that support id-based lookup override this.
    fn locate(&self, _request: &LocateRequest) -> Result<Vec<LocateResponse>> {
        Ok(Vec::new())
    }

    fn is_authorized(&self, _headers: &HashMap<String, String>) -> bool {
        true
    }

    /// Checks the cache, and on a miss allocates the right empty tile,
    /// times `fill`, records `fill-time-ms` into the tile's info JSON, and
    /// stores the result back into the cache.
    fn get(&self, key: &MapTileKey, cache: &dyn Cache, info: &DataSourceInfo) -> Result<TileFeatureLayer> {
        if let Some(cached) = cache.get_tile_layer(key, info)? {
            return Ok(cached);
        }

        let layer_info = info
            .get_layer(&key.layer_id)
            .cloned()
            .ok_or_else(|| Error::Schema(format!("unknown layer {}", key.layer_id)))?;
        let layer_info = Arc::new(layer_info);
        let pool = Arc::new(RwLock::new(StringPool::new(info.node_id.clone())));
        let mut tile = TileFeatureLayer::new(key.tile_id, info.node_id.clone(), key.map_id.clone(), layer_info, pool);

        let started = Instant::now();
        self.fill(&mut tile)?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        tile.header.info_json = serde_json::json!({ "fill-time-ms": elapsed_ms });

        cache.put_tile_layer(&tile)?;
        Ok(tile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_gate_accepts_everything() {
        let gate = AuthGate::new();
        assert!(gate.is_authorized(&HashMap::new()));
    }

    #[test]
    fn scenario_6_header_pattern_gate() {
        let mut gate = AuthGate::new();
        gate.add_alternative("X-USER-ROLE", r"\bTropico-Viewer\b").unwrap();

        assert!(!gate.is_authorized(&HashMap::new()));

        let mut headers = HashMap::new();
        headers.insert("X-USER-ROLE".to_string(), "Tropico-Viewer".to_string());
        assert!(gate.is_authorized(&headers));

        let mut wrong = HashMap::new();
        wrong.insert("X-USER-ROLE".to_string(), "Somewhere-Else-Viewer".to_string());
        assert!(!gate.is_authorized(&wrong));
    }
}
