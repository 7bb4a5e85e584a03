//! Feature-id to tile resolution request/response objects. Grounded on
//! `original_source/libs/service/include/mapget/service/locate.h`
//! (`LocateRequest`, `LocateResponse`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::MapTileKey;

/// A feature-id-shaped query: `(mapId, typeId, featureId key/value parts)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocateRequest {
    #[serde(rename = "mapId")]
    pub map_id: String,
    #[serde(rename = "typeId")]
    pub type_id: String,
    #[serde(rename = "featureId")]
    pub feature_id: BTreeMap<String, Value>,
}

impl LocateRequest {
    #[must_use]
    pub fn new(map_id: impl Into<String>, type_id: impl Into<String>, feature_id: BTreeMap<String, Value>) -> Self {
        Self {
            map_id: map_id.into(),
            type_id: type_id.into(),
            feature_id,
        }
    }
}

/// A JSON-facing projection of `MapTileKey`, since the wire-exposed field
/// names (`layerId`, `tileId`) differ from the Rust struct's.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocatedTileKey {
    #[serde(rename = "mapId")]
    pub map_id: String,
    #[serde(rename = "layerId")]
    pub layer_id: String,
    #[serde(rename = "tileId")]
    pub tile_id: u64,
}

impl From<&MapTileKey> for LocatedTileKey {
    fn from(key: &MapTileKey) -> Self {
        Self {
            map_id: key.map_id.clone(),
            layer_id: key.layer_id.clone(),
            tile_id: key.tile_id.value(),
        }
    }
}

/// The resolved tile (and the original request echoed back) for one
/// `LocateRequest`, possibly with the id remapped to a primary
/// composition by the data source, per §4.7.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocateResponse {
    #[serde(rename = "mapId")]
    pub map_id: String,
    #[serde(rename = "typeId")]
    pub type_id: String,
    #[serde(rename = "featureId")]
    pub feature_id: BTreeMap<String, Value>,
    #[serde(rename = "tileKey")]
    pub tile_key: LocatedTileKey,
}

impl LocateResponse {
    #[must_use]
    pub fn from_request(request: &LocateRequest, tile_key: &MapTileKey) -> Self {
        Self {
            map_id: request.map_id.clone(),
            type_id: request.type_id.clone(),
            feature_id: request.feature_id.clone(),
            tile_key: tile_key.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LayerType, TileId};
    use serde_json::json;

    #[test]
    fn scenario_5_locate_round_trip() {
        let request = LocateRequest::new("Tropico", "Way", BTreeMap::from([("wayId".to_string(), json!(0))]));
        let key = MapTileKey::new(LayerType::Features, "Tropico", "WayLayer", TileId::from_value(1));
        let response = LocateResponse::from_request(&request, &key);

        assert_eq!(response.tile_key.layer_id, "WayLayer");
        assert_eq!(response.tile_key.tile_id, 1);
    }
}
