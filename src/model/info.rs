//! JSON-facing descriptor types: `DataSourceInfo`, `LayerInfo`,
//! `FeatureTypeInfo`, `IdPart`, `Coverage`, `Version`. Shapes are grounded on
//! `original_source/libs/model/include/mapget/model/info.h`. Unknown JSON
//! fields are ignored (no `deny_unknown_fields`); missing mandatory fields
//! are errors surfaced by serde's own `Result`.

use crate::error::{Error, Result};
use crate::model::feature_id::IdPartValue;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    #[must_use]
    pub fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self { major, minor, patch }
    }

    /// Only `(major, minor)` must match; `patch` differences are compatible.
    #[must_use]
    pub fn is_compatible(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdPartDataType {
    I32,
    U32,
    I64,
    U64,
    #[serde(rename = "UUID128")]
    Uuid128,
    Str,
}

/// One named, typed slot in a `uniqueIdCompositions` entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdPart {
    pub name: String,
    pub datatype: IdPartDataType,
    #[serde(default)]
    pub is_optional: bool,
}

impl IdPart {
    pub fn validate_value(&self, value: &IdPartValue) -> Result<()> {
        let ok = match (self.datatype, value) {
            (IdPartDataType::I32, IdPartValue::I32(_)) => true,
            (IdPartDataType::U32, IdPartValue::U32(_)) => true,
            (IdPartDataType::I64, IdPartValue::I64(_)) => true,
            (IdPartDataType::U64, IdPartValue::U64(_)) => true,
            (IdPartDataType::Uuid128, IdPartValue::Uuid128(bytes)) => bytes.len() == 16,
            (IdPartDataType::Str, IdPartValue::Str(_)) => true,
            _ => false,
        };
        if !ok {
            return Err(Error::InvalidIdPart(format!(
                "part {} expected {:?}, got {:?}",
                self.name,
                self.datatype,
                value.datatype()
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdComposition {
    pub parts: Vec<IdPart>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureTypeInfo {
    pub name: String,
    #[serde(rename = "uniqueIdCompositions")]
    pub unique_id_compositions: Vec<IdComposition>,
}

/// A filled bitset of zoom levels the layer covers, bounded by `min`/`max`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Coverage {
    pub min: u16,
    pub max: u16,
    pub filled: Vec<u16>,
}

impl Coverage {
    #[must_use]
    pub fn covers(&self, zoom: u16) -> bool {
        zoom >= self.min && zoom <= self.max && self.filled.contains(&zoom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerType {
    Features,
    SourceData,
}

impl LayerType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerType::Features => "features",
            LayerType::SourceData => "source-data",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerInfo {
    #[serde(rename = "layerId")]
    pub layer_id: String,
    #[serde(rename = "type")]
    pub layer_type: LayerType,
    #[serde(default, rename = "featureTypes")]
    pub feature_types: Vec<FeatureTypeInfo>,
    #[serde(default, rename = "zoomLevels")]
    pub zoom_levels: Vec<u16>,
    pub coverage: Option<Coverage>,
    #[serde(default = "default_true", rename = "canRead")]
    pub can_read: bool,
    #[serde(default, rename = "canWrite")]
    pub can_write: bool,
    pub version: Version,
}

fn default_true() -> bool {
    true
}

impl LayerInfo {
    pub fn feature_type(&self, name: &str) -> Option<&FeatureTypeInfo> {
        self.feature_types.iter().find(|t| t.name == name)
    }

    /// A feature id is valid for this layer if its type exists and its
    /// parts match one of that type's compositions.
    pub fn validate_feature_id(
        &self,
        type_id: &str,
        prefix: &[crate::model::feature_id::NamedIdPart],
        parts: &[crate::model::feature_id::NamedIdPart],
    ) -> Result<()> {
        let type_info = self
            .feature_type(type_id)
            .ok_or_else(|| Error::Schema(format!("unknown feature type {type_id}")))?;
        crate::model::feature_id::FeatureId::validate_composition(type_info, prefix, parts)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataSourceInfo {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "mapId")]
    pub map_id: String,
    pub layers: std::collections::HashMap<String, LayerInfo>,
    #[serde(default = "default_max_parallel_jobs", rename = "maxParallelJobs")]
    pub max_parallel_jobs: u32,
    #[serde(default, rename = "isAddOn")]
    pub is_add_on: bool,
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<Version>,
    #[serde(default, rename = "extraJsonAttachment")]
    pub extra_json_attachment: Option<serde_json::Value>,
}

fn default_max_parallel_jobs() -> u32 {
    1
}

impl DataSourceInfo {
    pub fn get_layer(&self, layer_id: &str) -> Option<&LayerInfo> {
        self.layers.get(layer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_ignored() {
        let json = serde_json::json!({
            "nodeId": "node-a",
            "mapId": "Tropico",
            "layers": {},
            "somethingUnknown": 42
        });
        let info: DataSourceInfo = serde_json::from_value(json).unwrap();
        assert_eq!(info.map_id, "Tropico");
        assert_eq!(info.max_parallel_jobs, 1);
    }

    #[test]
    fn missing_mandatory_field_is_an_error() {
        let json = serde_json::json!({ "mapId": "Tropico", "layers": {} });
        let result: std::result::Result<DataSourceInfo, _> = serde_json::from_value(json);
        assert!(result.is_err());
    }

    #[test]
    fn version_compatibility_ignores_patch() {
        let a = Version::new(1, 2, 3);
        let b = Version::new(1, 2, 9);
        assert!(a.is_compatible(&b));
        let c = Version::new(1, 3, 0);
        assert!(!a.is_compatible(&c));
    }
}
