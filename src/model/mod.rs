//! The columnar feature model: string pool, paged-arena node storage,
//! geometry, features, attributes, relations, validity, the tile layer
//! that composes them, and the wire stream / query surfaces built on top.

mod attribute;
mod feature_id;
mod geometry;
mod hash;
pub mod info;
mod layer;
mod object;
mod pool;
mod query;
mod relation;
mod source_data;
mod stream;
mod string_pool;
mod validity;

pub use attribute::{Attribute, AttributeLayer, Direction};
pub use feature_id::FeatureId;
pub use geometry::{Geometry, GeometryCollection, GeometryType};
pub use hash::hash_feature_id;
pub use info::{Coverage, DataSourceInfo, FeatureTypeInfo, IdPart, IdPartDataType, LayerInfo, LayerType, Version};
pub use layer::{Feature, TileFeatureLayer, TileHeader};
pub use object::{NodeValue, ObjectEntry};
pub use pool::{ColumnId, ModelPool, NodeAddress};
pub use query::{evaluate, QueryDiagnostics, QueryOutcome};
pub use relation::Relation;
pub use source_data::{SourceDataReferenceItem, TileSourceDataLayer};
pub use stream::{
    read_stream, write_end_of_stream, write_source_data_layer, write_string_pool_delta, write_tile_layer, MessageType,
    StreamReaderCallbacks, StreamWriter, PROTOCOL_VERSION,
};
pub use string_pool::{StringId, StringPool};
pub use validity::{MultiValidity, OffsetType, Validity};

pub use mapget_tile_utils::TileId;

/// Cache key identifying one tile of one layer: `(layerType, mapId, layerId, tileId)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapTileKey {
    pub layer_type: LayerType,
    pub map_id: String,
    pub layer_id: String,
    pub tile_id: TileId,
}

impl MapTileKey {
    #[must_use]
    pub fn new(layer_type: LayerType, map_id: impl Into<String>, layer_id: impl Into<String>, tile_id: TileId) -> Self {
        Self {
            layer_type,
            map_id: map_id.into(),
            layer_id: layer_id.into(),
            tile_id,
        }
    }

    #[must_use]
    pub fn to_canonical_string(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.layer_type.as_str(),
            self.map_id,
            self.layer_id,
            self.tile_id.to_hex()
        )
    }
}

impl std::fmt::Display for MapTileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}
