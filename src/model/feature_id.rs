use crate::error::{Error, Result};
use crate::model::info::{FeatureTypeInfo, IdPartDataType};
use crate::model::string_pool::StringId;

/// A single resolved id-part value, validated against its `IdPartDataType`.
///
/// Grounded on `original_source/libs/model/include/mapget/model/featureid.h`
/// and `src/featureid.cpp`.
#[derive(Clone, Debug, PartialEq)]
pub enum IdPartValue {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Uuid128([u8; 16]),
    Str(String),
}

impl IdPartValue {
    pub(crate) fn mix_into(&self, h: &mut crate::model::hash::Hash) {
        match self {
            IdPartValue::I32(v) => {
                h.i32(*v);
            }
            IdPartValue::U32(v) => {
                h.u32(*v);
            }
            IdPartValue::I64(v) => {
                h.i64(*v);
            }
            IdPartValue::U64(v) => {
                h.u64(*v);
            }
            IdPartValue::Uuid128(bytes) => {
                h.bytes(bytes);
            }
            IdPartValue::Str(s) => {
                h.str(s);
            }
        }
    }

    fn to_display_string(&self) -> String {
        match self {
            IdPartValue::I32(v) => v.to_string(),
            IdPartValue::U32(v) => v.to_string(),
            IdPartValue::I64(v) => v.to_string(),
            IdPartValue::U64(v) => v.to_string(),
            IdPartValue::Uuid128(bytes) => uuid::Uuid::from_bytes(*bytes).to_string(),
            IdPartValue::Str(s) => s.clone(),
        }
    }

    pub fn datatype(&self) -> IdPartDataType {
        match self {
            IdPartValue::I32(_) => IdPartDataType::I32,
            IdPartValue::U32(_) => IdPartDataType::U32,
            IdPartValue::I64(_) => IdPartDataType::I64,
            IdPartValue::U64(_) => IdPartDataType::U64,
            IdPartValue::Uuid128(_) => IdPartDataType::Uuid128,
            IdPartValue::Str(_) => IdPartDataType::Str,
        }
    }
}

/// A named, typed id-part supplied by the caller of `newFeature`, before
/// validation against the layer's `uniqueIdCompositions`.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedIdPart {
    pub name: String,
    pub value: IdPartValue,
    pub is_optional: bool,
}

/// A feature's identity: a type label plus an ordered list of id-parts,
/// which may share a tile-wide prefix.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureId {
    pub type_id_string: StringId,
    pub type_id: String,
    pub prefix: Vec<NamedIdPart>,
    pub parts: Vec<NamedIdPart>,
}

impl FeatureId {
    /// Validates `parts` (with `prefix` prepended) against the feature
    /// type's `uniqueIdCompositions`, picking the first composition whose
    /// part names and datatypes match.
    pub fn validate_composition<'a>(
        type_info: &'a FeatureTypeInfo,
        prefix: &[NamedIdPart],
        parts: &[NamedIdPart],
    ) -> Result<&'a crate::model::info::IdComposition> {
        let all: Vec<&NamedIdPart> = prefix.iter().chain(parts.iter()).collect();
        'outer: for composition in &type_info.unique_id_compositions {
            if composition.parts.len() != all.len() {
                continue;
            }
            for (spec, given) in composition.parts.iter().zip(all.iter()) {
                if spec.name != given.name {
                    continue 'outer;
                }
                spec.validate_value(&given.value)?;
            }
            return Ok(composition);
        }
        Err(Error::NoMatchingComposition(type_info.name.clone()))
    }

    /// All parts in composition order: tile prefix first, then per-feature
    /// parts.
    #[must_use]
    pub fn all_parts(&self) -> Vec<&NamedIdPart> {
        self.prefix.iter().chain(self.parts.iter()).collect()
    }

    /// Parts with any composition-marked-optional entries removed, used for
    /// hashing so `find` matches on primary identifying parts only.
    #[must_use]
    pub fn stripped_parts(&self) -> Vec<IdPartValue> {
        self.all_parts()
            .into_iter()
            .filter(|p| !p.is_optional)
            .map(|p| p.value.clone())
            .collect()
    }

    /// `typeId + "." + prefix-parts + "." + specific-parts`, matching
    /// `FeatureId::toString()` in `src/featureid.cpp`.
    #[must_use]
    pub fn to_string_repr(&self) -> String {
        let mut out = self.type_id.clone();
        for part in &self.prefix {
            out.push('.');
            out.push_str(&part.value.to_display_string());
        }
        for part in &self.parts {
            out.push('.');
            out.push_str(&part.value.to_display_string());
        }
        out
    }
}

impl std::fmt::Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_repr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_string_matches_scenario_1() {
        let id = FeatureId {
            type_id_string: 0,
            type_id: "Way".to_string(),
            prefix: vec![NamedIdPart {
                name: "areaId".to_string(),
                value: IdPartValue::Str("TheBestArea".to_string()),
                is_optional: false,
            }],
            parts: vec![NamedIdPart {
                name: "wayId".to_string(),
                value: IdPartValue::I64(42),
                is_optional: false,
            }],
        };
        assert_eq!(id.to_string_repr(), "Way.TheBestArea.42");
    }
}
