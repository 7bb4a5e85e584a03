//! `TileFeatureLayer`: composes the model pool, the shared string pool and
//! the feature index into the tile container described in §4.4. Grounded on
//! `original_source/libs/model/include/mapget/model/featurelayer.h` and
//! `src/featurelayer.cpp`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::model::attribute::{Attribute, AttributeLayer, AttributeLayerList, Direction};
use crate::model::feature_id::{FeatureId, IdPartValue, NamedIdPart};
use crate::model::geometry::{Geometry, GeometryCollection, GeometryCollectionRow, GeometryRow, GeometryType, GeometryView};
use crate::model::hash::hash_feature_id;
use crate::model::info::{LayerInfo, Version};
use crate::model::object::{NodeValue, ObjectEntry, ObjectRow};
use crate::model::pool::{ColumnId, FeatureRow, ModelPool, NodeAddress, ResolvedNode};
use crate::model::relation::Relation;
use crate::model::source_data::SourceDataReferenceItem;
use crate::model::string_pool::{read_string, write_string, StringId, StringPool};
use crate::model::validity::{GeometryRef, MultiValidity, OffsetType, OffsetValue, Validity, ValidityShape};
use crate::model::TileId;

/// The framing written ahead of the model pool for both `TileFeatureLayer`
/// and `TileSourceDataLayer`, per §6's wire header.
#[derive(Clone, Debug, PartialEq)]
pub struct TileHeader {
    pub map_id: String,
    pub layer_id: String,
    pub map_version: Version,
    pub tile_id: TileId,
    pub node_id: String,
    pub timestamp_us: i64,
    pub ttl_ms: Option<i64>,
    pub info_json: serde_json::Value,
}

impl TileHeader {
    pub fn write(&self, out: &mut impl Write) -> Result<()> {
        write_string(out, &self.map_id)?;
        write_string(out, &self.layer_id)?;
        out.write_all(&self.map_version.major.to_le_bytes())?;
        out.write_all(&self.map_version.minor.to_le_bytes())?;
        out.write_all(&self.map_version.patch.to_le_bytes())?;
        out.write_all(&self.tile_id.value().to_le_bytes())?;
        write_string(out, &self.node_id)?;
        out.write_all(&self.timestamp_us.to_le_bytes())?;
        match self.ttl_ms {
            Some(ttl) => {
                out.write_all(&[1u8])?;
                out.write_all(&ttl.to_le_bytes())?;
            }
            None => out.write_all(&[0u8])?,
        }
        write_string(out, &self.info_json.to_string())?;
        Ok(())
    }

    pub fn read(input: &mut impl Read) -> Result<Self> {
        let map_id = read_string(input)?;
        let layer_id = read_string(input)?;
        let mut u16_buf = [0u8; 2];
        input.read_exact(&mut u16_buf)?;
        let major = u16::from_le_bytes(u16_buf);
        input.read_exact(&mut u16_buf)?;
        let minor = u16::from_le_bytes(u16_buf);
        input.read_exact(&mut u16_buf)?;
        let patch = u16::from_le_bytes(u16_buf);
        let mut u64_buf = [0u8; 8];
        input.read_exact(&mut u64_buf)?;
        let tile_id = TileId::from_value(u64::from_le_bytes(u64_buf));
        let node_id = read_string(input)?;
        let mut i64_buf = [0u8; 8];
        input.read_exact(&mut i64_buf)?;
        let timestamp_us = i64::from_le_bytes(i64_buf);
        let mut flag = [0u8; 1];
        input.read_exact(&mut flag)?;
        let ttl_ms = if flag[0] != 0 {
            input.read_exact(&mut i64_buf)?;
            Some(i64::from_le_bytes(i64_buf))
        } else {
            None
        };
        let info_json_str = read_string(input)?;
        let info_json = if info_json_str.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&info_json_str)?
        };
        Ok(Self {
            map_id,
            layer_id,
            map_version: Version::new(major, minor, patch),
            tile_id,
            node_id,
            timestamp_us,
            ttl_ms,
            info_json,
        })
    }
}

/// A materialized view of a feature, resolved from the columnar pool:
/// id, geometry collection, properties object, named attribute layers and
/// relations.
#[derive(Clone, Debug)]
pub struct Feature {
    pub id: FeatureId,
    pub geometry: GeometryCollection,
    pub attributes: ObjectRow,
    pub attribute_layers: Vec<(String, Vec<Attribute>)>,
    pub relations: Vec<Relation>,
}

impl Feature {
    #[must_use]
    pub fn attribute_layer(&self, name: &str) -> Option<&Vec<Attribute>> {
        self.attribute_layers.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }
}

struct HashIndex {
    entries: Vec<(u64, NodeAddress)>,
    sorted: bool,
}

/// The tile's feature container: the columnar pool, the shared per-node
/// string pool, the optional tile-wide id prefix, and a lazily-sorted hash
/// index over feature ids. Single-writer during `fill`; read-only (except
/// for the lazy sort) once published, per §5.
pub struct TileFeatureLayer {
    pub header: TileHeader,
    pub layer_info: Arc<LayerInfo>,
    pub string_pool: Arc<RwLock<StringPool>>,
    pool: ModelPool,
    prefix: Option<Vec<NamedIdPart>>,
    features: Vec<NodeAddress>,
    hash_index: Mutex<HashIndex>,
}

impl TileFeatureLayer {
    #[must_use]
    pub fn new(
        tile_id: TileId,
        node_id: impl Into<String>,
        map_id: impl Into<String>,
        layer_info: Arc<LayerInfo>,
        string_pool: Arc<RwLock<StringPool>>,
    ) -> Self {
        let map_id = map_id.into();
        let layer_id = layer_info.layer_id.clone();
        let node_id = node_id.into();
        Self {
            header: TileHeader {
                map_id,
                layer_id,
                map_version: layer_info.version,
                tile_id,
                node_id,
                timestamp_us: 0,
                ttl_ms: None,
                info_json: serde_json::Value::Null,
            },
            layer_info,
            string_pool,
            pool: ModelPool::new(),
            prefix: None,
            features: Vec::new(),
            hash_index: Mutex::new(HashIndex {
                entries: Vec::new(),
                sorted: true,
            }),
        }
    }

    /// Sets the tile-wide id prefix shared by every feature created from
    /// now on. Must be called before the first `new_feature`.
    pub fn set_prefix(&mut self, prefix: Vec<NamedIdPart>) -> Result<()> {
        if !self.features.is_empty() {
            return Err(Error::PrefixAlreadySet);
        }
        self.prefix = Some(prefix);
        Ok(())
    }

    #[must_use]
    pub fn prefix(&self) -> &[NamedIdPart] {
        self.prefix.as_deref().unwrap_or(&[])
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.features.len()
    }

    pub fn at(&self, i: usize) -> Result<Feature> {
        let addr = *self
            .features
            .get(i)
            .ok_or_else(|| Error::Contract(format!("feature index {i} out of range")))?;
        self.resolve_feature(addr)
    }

    pub fn features(&self) -> impl Iterator<Item = Result<Feature>> + '_ {
        self.features.iter().map(move |&addr| self.resolve_feature(addr))
    }

    /// The node address backing the `i`th feature, for callers (e.g.
    /// `clone_feature`) that need to address a specific source feature
    /// rather than its materialized `Feature` view.
    pub fn feature_address(&self, i: usize) -> Result<NodeAddress> {
        self.features
            .get(i)
            .copied()
            .ok_or_else(|| Error::Contract(format!("feature index {i} out of range")))
    }

    /// Node addresses of every feature in insertion order.
    pub fn feature_addresses(&self) -> impl Iterator<Item = NodeAddress> + '_ {
        self.features.iter().copied()
    }

    /// Creates a new feature, validating `id_parts` (with the tile prefix
    /// prepended) against the layer's `uniqueIdCompositions`, and inserts a
    /// hash-index entry for it.
    pub fn new_feature(&mut self, type_id: &str, id_parts: Vec<NamedIdPart>) -> Result<NodeAddress> {
        let prefix = self.prefix.clone().unwrap_or_default();
        self.layer_info.validate_feature_id(type_id, &prefix, &id_parts)?;
        let type_id_string = self.intern(type_id);
        let feature_id = FeatureId {
            type_id_string,
            type_id: type_id.to_string(),
            prefix,
            parts: id_parts,
        };
        let hash = hash_feature_id(&feature_id.type_id, &feature_id.stripped_parts());
        let row = FeatureRow {
            id: feature_id,
            geometry: None,
            attributes: None,
            attribute_layers: None,
            relations: Vec::new(),
        };
        let addr = self.pool.new_feature_node(row);
        self.features.push(addr);
        let mut idx = self.hash_index.lock().expect("hash index lock poisoned");
        idx.entries.push((hash, addr));
        idx.sorted = false;
        Ok(addr)
    }

    /// Creates a standalone feature id (e.g. as a relation target), without
    /// the tile prefix, since it may reference a feature in another tile.
    pub fn new_feature_id(&mut self, type_id: &str, id_parts: Vec<NamedIdPart>) -> FeatureId {
        let type_id_string = self.intern(type_id);
        let feature_id = FeatureId {
            type_id_string,
            type_id: type_id.to_string(),
            prefix: Vec::new(),
            parts: id_parts,
        };
        self.pool.new_feature_id(feature_id.clone());
        feature_id
    }

    pub fn new_relation(&mut self, name: &str, target: FeatureId) -> NodeAddress {
        let name_id = self.intern(name);
        self.pool.new_relation(Relation {
            name: name_id,
            target,
            source_validity: None,
            target_validity: None,
            source_data: None,
        })
    }

    pub fn new_attribute(&mut self, name: &str) -> NodeAddress {
        let name_id = self.intern(name);
        self.pool.new_attribute(Attribute {
            name: name_id,
            direction: Direction::Empty,
            validity: None,
            fields: ObjectRow::default(),
        })
    }

    pub fn new_attribute_layer(&mut self, name: &str) -> NodeAddress {
        let name_id = self.intern(name);
        self.pool.new_attribute_layer(AttributeLayer {
            name: name_id,
            attributes: Vec::new(),
        })
    }

    pub fn new_attribute_layer_list(&mut self) -> NodeAddress {
        self.pool.new_attribute_layers(AttributeLayerList::default())
    }

    pub fn new_geometry_collection(&mut self) -> NodeAddress {
        self.pool.new_geometry_collection(GeometryCollectionRow::default())
    }

    pub fn new_geometry(&mut self, geometry_type: GeometryType) -> NodeAddress {
        self.pool.new_geometry(geometry_type)
    }

    pub fn new_geometry_view(&mut self, geometry_type: GeometryType, base: NodeAddress, offset: usize, size: usize) -> NodeAddress {
        self.pool.new_geometry_view(geometry_type, base, offset, size)
    }

    pub fn new_source_data_reference_collection(&mut self, items: Vec<SourceDataReferenceItem>) -> NodeAddress {
        self.pool.new_source_data_reference_collection(items)
    }

    pub fn new_validity(&mut self, validity: Validity) -> NodeAddress {
        self.pool.new_validity(validity)
    }

    pub fn new_validity_collection(&mut self) -> NodeAddress {
        self.pool.new_validity_collection(MultiValidity::default())
    }

    pub fn append_point(&mut self, geometry_addr: NodeAddress, point: (f64, f64, f64)) -> Result<()> {
        self.pool.get_geometry_mut(geometry_addr)?.append(point)
    }

    pub fn push_geometry_to_collection(&mut self, collection_addr: NodeAddress, geometry_addr: NodeAddress) -> Result<()> {
        self.pool.get_geometry_collection_mut(collection_addr)?.0.push(geometry_addr);
        Ok(())
    }

    pub fn add_attribute_to_layer(&mut self, layer_addr: NodeAddress, attribute_addr: NodeAddress) -> Result<()> {
        self.pool.get_attribute_layer_mut(layer_addr)?.attributes.push(attribute_addr);
        Ok(())
    }

    pub fn add_layer_to_list(&mut self, list_addr: NodeAddress, layer_addr: NodeAddress) -> Result<()> {
        self.pool.get_attribute_layers_mut(list_addr)?.0.push(layer_addr);
        Ok(())
    }

    pub fn object_mut(&mut self, addr: NodeAddress) -> Result<&mut ObjectRow> {
        self.pool.get_object_mut(addr)
    }

    pub fn set_feature_geometry(&mut self, feature_addr: NodeAddress, collection_addr: NodeAddress) -> Result<()> {
        self.pool.get_feature_node_mut(feature_addr)?.geometry = Some(collection_addr);
        Ok(())
    }

    pub fn set_feature_attributes(&mut self, feature_addr: NodeAddress, object_addr: NodeAddress) -> Result<()> {
        self.pool.get_feature_node_mut(feature_addr)?.attributes = Some(object_addr);
        Ok(())
    }

    pub fn set_feature_attribute_layers(&mut self, feature_addr: NodeAddress, list_addr: NodeAddress) -> Result<()> {
        self.pool.get_feature_node_mut(feature_addr)?.attribute_layers = Some(list_addr);
        Ok(())
    }

    pub fn add_feature_relation(&mut self, feature_addr: NodeAddress, relation_addr: NodeAddress) -> Result<()> {
        self.pool.get_feature_node_mut(feature_addr)?.relations.push(relation_addr);
        Ok(())
    }

    fn intern(&self, value: &str) -> StringId {
        self.string_pool.write().expect("string pool lock poisoned").intern(value)
    }

    fn resolve_string(&self, id: StringId) -> Result<String> {
        self.string_pool
            .read()
            .expect("string pool lock poisoned")
            .resolve(id)
            .map(str::to_string)
            .ok_or(Error::UnknownStringId(id))
    }

    /// Case-insensitive, non-mutating field-name lookup, used by
    /// `model::query` to resolve a query's field names without interning
    /// new ones into the pool.
    #[must_use]
    pub fn find_string(&self, value: &str) -> Option<StringId> {
        self.string_pool.read().expect("string pool lock poisoned").find(value)
    }

    /// Public form of `resolve_string`, used by `model::query` to compare
    /// string attribute values against literal operands.
    #[must_use]
    pub fn resolve_string_pub(&self, id: StringId) -> Option<String> {
        self.resolve_string(id).ok()
    }

    /// Runs a simfil-narrowed query (§4.4) over this layer's features.
    /// Compilation errors surface as diagnostics rather than as an `Err`.
    pub fn evaluate(&self, query: &str) -> Result<crate::model::query::QueryOutcome> {
        crate::model::query::evaluate(self, query)
    }

    /// Resolves a feature address into an owned `Feature` view.
    pub fn resolve_feature(&self, addr: NodeAddress) -> Result<Feature> {
        let row = self.pool.get_feature_node(addr)?.clone();
        let geometry = match row.geometry {
            Some(a) => self.resolve_geometry_collection(a)?,
            None => GeometryCollection { geometries: Vec::new() },
        };
        let attributes = match row.attributes {
            Some(a) => self.pool.get_object(a)?.clone(),
            None => ObjectRow::default(),
        };
        let attribute_layers = match row.attribute_layers {
            Some(a) => {
                let list = self.pool.get_attribute_layers(a)?.clone();
                let mut resolved = Vec::with_capacity(list.0.len());
                for layer_addr in list.0 {
                    let layer = self.pool.get_attribute_layer(layer_addr)?.clone();
                    let name = self.resolve_string(layer.name)?;
                    let mut attrs = Vec::with_capacity(layer.attributes.len());
                    for attr_addr in layer.attributes {
                        attrs.push(self.pool.get_attribute(attr_addr)?.clone());
                    }
                    resolved.push((name, attrs));
                }
                resolved
            }
            None => Vec::new(),
        };
        let mut relations = Vec::with_capacity(row.relations.len());
        for relation_addr in &row.relations {
            relations.push(self.pool.get_relation(*relation_addr)?.clone());
        }
        Ok(Feature {
            id: row.id,
            geometry,
            attributes,
            attribute_layers,
            relations,
        })
    }

    pub fn resolve_geometry(&self, addr: NodeAddress) -> Result<Geometry> {
        let row = self.pool.get_geometry(addr)?;
        let name = row.name.map(|id| self.resolve_string(id)).transpose()?;
        if let Some(polygon_addr) = row.polygon {
            return self.resolve_polygon_geometry(polygon_addr, name);
        }
        let (buf, offset, size, geometry_type) = self.pool.resolve_geometry_buffer(addr)?;
        if geometry_type == GeometryType::Mesh && size % 3 != 0 {
            return Err(Error::Contract(format!("mesh vertex count {size} is not a multiple of 3")));
        }
        let points = buf.points().skip(offset).take(size).collect();
        Ok(Geometry {
            geometry_type,
            points,
            rings: Vec::new(),
            name,
        })
    }

    /// Reads every ring of a ring-structured polygon, auto-closing each
    /// and reorienting the outer ring (index 0) to CCW when it was stored
    /// clockwise, per §4.3.
    fn resolve_polygon_geometry(&self, polygon_addr: NodeAddress, name: Option<String>) -> Result<Geometry> {
        let polygon = self.pool.get_polygon(polygon_addr)?.clone();
        let mut rings = Vec::with_capacity(polygon.rings.len());
        for (i, ring_addr) in polygon.rings.iter().enumerate() {
            let ring_row = self.pool.get_linear_ring(*ring_addr)?.clone();
            let buf = self.pool.get_point_buffer(ring_row.buffer)?;
            let mut points: Vec<_> = buf.points().collect();
            crate::model::geometry::close_ring(&mut points);
            if i == 0 && ring_row.stored_clockwise {
                points.reverse();
            }
            rings.push(points);
        }
        let points = rings.first().cloned().unwrap_or_default();
        Ok(Geometry {
            geometry_type: GeometryType::Polygon,
            points,
            rings,
            name,
        })
    }

    /// Builds a ring-structured polygon geometry from raw rings (outer
    /// ring first), computing each ring's stored orientation from its
    /// input point order. Rejects a ring with fewer than 3 points.
    pub fn new_polygon(&mut self, rings: Vec<Vec<(f64, f64, f64)>>) -> Result<NodeAddress> {
        if rings.is_empty() {
            return Err(Error::Contract("polygon must have at least one ring".to_string()));
        }
        let mut ring_addrs = Vec::with_capacity(rings.len());
        for ring in &rings {
            if ring.len() < 3 {
                return Err(Error::Contract("polygon ring must have at least 3 points".to_string()));
            }
            let stored_clockwise = crate::model::geometry::ring_signed_area(ring) < 0.0;
            let mut buf = crate::model::geometry::PointBufferRow::default();
            for p in ring {
                buf.append(*p);
            }
            let buffer = self.pool.new_point_buffer(buf);
            ring_addrs.push(self.pool.new_linear_ring(crate::model::geometry::LinearRingRow { buffer, stored_clockwise }));
        }
        let polygon_addr = self.pool.new_polygon(crate::model::geometry::PolygonRow { rings: ring_addrs });
        Ok(self.pool.new_geometry_row(GeometryRow::polygon(polygon_addr)))
    }

    /// Builds one view per consecutive vertex triple of a `Mesh` geometry,
    /// the `MeshTriangleCollection`/`LinearRing` views from §4.3. Rejects
    /// a mesh whose vertex count is not a multiple of 3 (§8).
    pub fn mesh_triangles(&mut self, mesh_addr: NodeAddress) -> Result<Vec<NodeAddress>> {
        let (_, _, size, geometry_type) = self.pool.resolve_geometry_buffer(mesh_addr)?;
        if geometry_type != GeometryType::Mesh {
            return Err(Error::Contract("mesh_triangles requires a Mesh geometry".to_string()));
        }
        if size % 3 != 0 {
            return Err(Error::Contract(format!("mesh vertex count {size} is not a multiple of 3")));
        }
        let mut triangles = Vec::with_capacity(size / 3);
        for offset in (0..size).step_by(3) {
            triangles.push(self.pool.new_geometry_view(GeometryType::Polygon, mesh_addr, offset, 3));
        }
        Ok(triangles)
    }

    pub fn resolve_geometry_collection(&self, addr: NodeAddress) -> Result<GeometryCollection> {
        let row = self.pool.get_geometry_collection(addr)?.clone();
        let geometries = row.0.iter().map(|a| self.resolve_geometry(*a)).collect::<Result<Vec<_>>>()?;
        Ok(GeometryCollection { geometries })
    }

    fn stripped_hash_and_values(&self, type_id: &str, id_parts: &[NamedIdPart]) -> (u64, Vec<IdPartValue>) {
        let prefix = self.prefix.clone().unwrap_or_default();
        let values: Vec<IdPartValue> = prefix
            .iter()
            .chain(id_parts.iter())
            .filter(|p| !p.is_optional)
            .map(|p| p.value.clone())
            .collect();
        (hash_feature_id(type_id, &values), values)
    }

    fn find_feature_address(&self, type_id: &str, id_parts: &[NamedIdPart]) -> Result<Option<NodeAddress>> {
        let (target_hash, values) = self.stripped_hash_and_values(type_id, id_parts);
        let mut idx = self.hash_index.lock().expect("hash index lock poisoned");
        if !idx.sorted {
            idx.entries.sort_by_key(|(h, _)| *h);
            idx.sorted = true;
        }
        let start = idx.entries.partition_point(|(h, _)| *h < target_hash);
        for &(h, addr) in &idx.entries[start..] {
            if h != target_hash {
                break;
            }
            let row = self.pool.get_feature_node(addr)?;
            if row.id.type_id == type_id && row.id.stripped_parts() == values {
                return Ok(Some(addr));
            }
        }
        Ok(None)
    }

    /// Hash lookup with collision fallback to an exact compare on stripped
    /// id parts.
    pub fn find(&self, type_id: &str, id_parts: &[NamedIdPart]) -> Result<Option<Feature>> {
        match self.find_feature_address(type_id, id_parts)? {
            Some(addr) => Ok(Some(self.resolve_feature(addr)?)),
            None => Ok(None),
        }
    }

    /// Linear scan comparing against each feature's `"typeId.part.part"`
    /// string form; there is no secondary string index, so this is O(n).
    pub fn find_by_string(&self, feature_id_str: &str) -> Result<Option<Feature>> {
        for &addr in &self.features {
            let row = self.pool.get_feature_node(addr)?;
            if row.id.to_string_repr() == feature_id_str {
                return Ok(Some(self.resolve_feature(addr)?));
            }
        }
        Ok(None)
    }

    /// Creates or reuses the feature `(type_id, id_parts)` in this layer and
    /// deep-copies `other`'s geometry, attributes, attribute layers and
    /// relations into it, reusing shared sub-nodes via `memo`.
    pub fn clone_feature(
        &mut self,
        other: &TileFeatureLayer,
        other_feature_addr: NodeAddress,
        type_id: &str,
        id_parts: Vec<NamedIdPart>,
        memo: &mut HashMap<u32, NodeAddress>,
    ) -> Result<NodeAddress> {
        let other_row = other.pool.get_feature_node(other_feature_addr)?.clone();
        let target_addr = match self.find_feature_address(type_id, &id_parts)? {
            Some(a) => a,
            None => self.new_feature(type_id, id_parts)?,
        };

        if let Some(other_geom_addr) = other_row.geometry {
            let other_collection = other.pool.get_geometry_collection(other_geom_addr)?.clone();
            let cloned: Vec<NodeAddress> = other_collection
                .0
                .iter()
                .map(|a| self.clone_node(other, *a, memo))
                .collect::<Result<_>>()?;
            let collection_addr = match self.pool.get_feature_node(target_addr)?.geometry {
                Some(a) => a,
                None => self.new_geometry_collection(),
            };
            self.pool.get_geometry_collection_mut(collection_addr)?.0.extend(cloned);
            self.pool.get_feature_node_mut(target_addr)?.geometry = Some(collection_addr);
        }

        if let Some(other_attrs_addr) = other_row.attributes {
            let other_obj = other.pool.get_object(other_attrs_addr)?.clone();
            let obj_addr = match self.pool.get_feature_node(target_addr)?.attributes {
                Some(a) => a,
                None => self.pool.new_object(ObjectRow::default()),
            };
            for entry in other_obj.0 {
                let key = self.reintern(other, entry.key)?;
                let value = self.clone_value(other, entry.value, memo)?;
                self.pool.get_object_mut(obj_addr)?.set(key, value);
            }
            self.pool.get_feature_node_mut(target_addr)?.attributes = Some(obj_addr);
        }

        if let Some(other_layers_addr) = other_row.attribute_layers {
            let other_list = other.pool.get_attribute_layers(other_layers_addr)?.clone();
            let list_addr = match self.pool.get_feature_node(target_addr)?.attribute_layers {
                Some(a) => a,
                None => self.new_attribute_layer_list(),
            };
            for layer_addr in other_list.0 {
                let other_layer = other.pool.get_attribute_layer(layer_addr)?.clone();
                let layer_name = self.reintern(other, other_layer.name)?;
                let cloned_attrs: Vec<NodeAddress> = other_layer
                    .attributes
                    .iter()
                    .map(|a| self.clone_node(other, *a, memo))
                    .collect::<Result<_>>()?;
                let existing_layer_addr = self
                    .pool
                    .get_attribute_layers(list_addr)?
                    .0
                    .iter()
                    .copied()
                    .find(|a| self.pool.get_attribute_layer(*a).map(|l| l.name == layer_name).unwrap_or(false));
                match existing_layer_addr {
                    Some(a) => {
                        self.pool.get_attribute_layer_mut(a)?.attributes.extend(cloned_attrs);
                    }
                    None => {
                        let new_layer_addr = self.pool.new_attribute_layer(AttributeLayer {
                            name: layer_name,
                            attributes: cloned_attrs,
                        });
                        self.pool.get_attribute_layers_mut(list_addr)?.0.push(new_layer_addr);
                    }
                }
            }
            self.pool.get_feature_node_mut(target_addr)?.attribute_layers = Some(list_addr);
        }

        for relation_addr in &other_row.relations {
            let cloned = self.clone_node(other, *relation_addr, memo)?;
            self.pool.get_feature_node_mut(target_addr)?.relations.push(cloned);
        }

        Ok(target_addr)
    }

    /// Clones an arbitrary pool node from `other` into `self`, memoized by
    /// `other`'s raw address so shared sub-nodes are copied once.
    fn clone_node(&mut self, other: &TileFeatureLayer, addr: NodeAddress, memo: &mut HashMap<u32, NodeAddress>) -> Result<NodeAddress> {
        if let Some(&existing) = memo.get(&addr.raw()) {
            return Ok(existing);
        }
        let cloned = match other.pool.resolve(addr)? {
            ResolvedNode::Object(row) => {
                let mut new_row = ObjectRow::default();
                for entry in row.0 {
                    let key = self.reintern(other, entry.key)?;
                    let value = self.clone_value(other, entry.value, memo)?;
                    new_row.0.push(ObjectEntry { key, value });
                }
                self.pool.new_object(new_row)
            }
            ResolvedNode::Array(row) => {
                let mut new_row = crate::model::object::ArrayRow::default();
                for v in row.0 {
                    new_row.0.push(self.clone_value(other, v, memo)?);
                }
                self.pool.new_array(new_row)
            }
            ResolvedNode::Feature(_) => {
                return Err(Error::Contract("feature nodes must be cloned via clone_feature".to_string()));
            }
            ResolvedNode::FeatureId(id) => {
                let cloned_id = self.reintern_feature_id(other, &id)?;
                self.pool.new_feature_id(cloned_id)
            }
            ResolvedNode::Attribute(row) => {
                let name = self.reintern(other, row.name)?;
                let validity = match row.validity {
                    Some(a) => Some(self.clone_node(other, a, memo)?),
                    None => None,
                };
                let mut fields = ObjectRow::default();
                for entry in row.fields.0 {
                    let key = self.reintern(other, entry.key)?;
                    let value = self.clone_value(other, entry.value, memo)?;
                    fields.0.push(ObjectEntry { key, value });
                }
                self.pool.new_attribute(Attribute {
                    name,
                    direction: row.direction,
                    validity,
                    fields,
                })
            }
            ResolvedNode::AttributeLayer(row) => {
                let name = self.reintern(other, row.name)?;
                let mut attributes = Vec::with_capacity(row.attributes.len());
                for a in row.attributes {
                    attributes.push(self.clone_node(other, a, memo)?);
                }
                self.pool.new_attribute_layer(AttributeLayer { name, attributes })
            }
            ResolvedNode::AttributeLayerList(row) => {
                let mut addrs = Vec::with_capacity(row.0.len());
                for a in row.0 {
                    addrs.push(self.clone_node(other, a, memo)?);
                }
                self.pool.new_attribute_layers(AttributeLayerList(addrs))
            }
            ResolvedNode::Relation(row) => {
                let name = self.reintern(other, row.name)?;
                let target = self.reintern_feature_id(other, &row.target)?;
                let source_validity = match row.source_validity {
                    Some(a) => Some(self.clone_node(other, a, memo)?),
                    None => None,
                };
                let target_validity = match row.target_validity {
                    Some(a) => Some(self.clone_node(other, a, memo)?),
                    None => None,
                };
                let source_data = match row.source_data {
                    Some(a) => Some(self.clone_node(other, a, memo)?),
                    None => None,
                };
                self.pool.new_relation(Relation {
                    name,
                    target,
                    source_validity,
                    target_validity,
                    source_data,
                })
            }
            ResolvedNode::PointBuffer(row) => self.pool.new_point_buffer(row),
            ResolvedNode::Geometry(row) => {
                let buffer = row.buffer;
                let view = match row.view {
                    Some(v) => Some(GeometryView {
                        base: self.clone_node(other, v.base, memo)?,
                        offset: v.offset,
                        size: v.size,
                        type_override: v.type_override,
                    }),
                    None => None,
                };
                let polygon = match row.polygon {
                    Some(a) => Some(self.clone_node(other, a, memo)?),
                    None => None,
                };
                let name = row.name.map(|id| self.reintern(other, id)).transpose()?;
                let source_data = match row.source_data {
                    Some(a) => Some(self.clone_node(other, a, memo)?),
                    None => None,
                };
                self.pool.new_geometry_row(GeometryRow {
                    geometry_type: row.geometry_type,
                    buffer,
                    view,
                    polygon,
                    name,
                    source_data,
                })
            }
            ResolvedNode::GeometryCollection(row) => {
                let mut addrs = Vec::with_capacity(row.0.len());
                for a in row.0 {
                    addrs.push(self.clone_node(other, a, memo)?);
                }
                self.pool.new_geometry_collection(GeometryCollectionRow(addrs))
            }
            ResolvedNode::Polygon(row) => {
                let mut rings = Vec::with_capacity(row.rings.len());
                for a in row.rings {
                    rings.push(self.clone_node(other, a, memo)?);
                }
                self.pool.new_polygon(crate::model::geometry::PolygonRow { rings })
            }
            ResolvedNode::LinearRing(row) => {
                let buffer = self.clone_node(other, row.buffer, memo)?;
                self.pool.new_linear_ring(crate::model::geometry::LinearRingRow {
                    buffer,
                    stored_clockwise: row.stored_clockwise,
                })
            }
            ResolvedNode::SourceDataReference(items) => {
                let mut new_items = Vec::with_capacity(items.len());
                for item in items {
                    let qualifier = self.reintern(other, item.qualifier)?;
                    new_items.push(SourceDataReferenceItem {
                        address: item.address,
                        qualifier,
                    });
                }
                self.pool.new_source_data_reference_collection(new_items)
            }
            ResolvedNode::Validity(v) => {
                let shape = self.clone_validity_shape(other, v.shape, memo)?;
                self.pool.new_validity(Validity { shape, direction: v.direction })
            }
            ResolvedNode::ValidityCollection(row) => {
                let mut addrs = Vec::with_capacity(row.0.len());
                for a in row.0 {
                    addrs.push(self.clone_node(other, a, memo)?);
                }
                self.pool.new_validity_collection(MultiValidity(addrs))
            }
        };
        memo.insert(addr.raw(), cloned);
        Ok(cloned)
    }

    fn clone_value(&mut self, other: &TileFeatureLayer, value: NodeValue, memo: &mut HashMap<u32, NodeAddress>) -> Result<NodeValue> {
        Ok(match value {
            NodeValue::Null => NodeValue::Null,
            NodeValue::Bool(b) => NodeValue::Bool(b),
            NodeValue::Int64(v) => NodeValue::Int64(v),
            NodeValue::Float64(v) => NodeValue::Float64(v),
            NodeValue::String(id) => NodeValue::String(self.reintern(other, id)?),
            NodeValue::Array(addr) => NodeValue::Array(self.clone_node(other, addr, memo)?),
            NodeValue::Object(addr) => NodeValue::Object(self.clone_node(other, addr, memo)?),
            NodeValue::TransientObject(entries) => {
                let mut new_entries = Vec::with_capacity(entries.len());
                for e in entries {
                    new_entries.push(ObjectEntry {
                        key: self.reintern(other, e.key)?,
                        value: self.clone_value(other, e.value, memo)?,
                    });
                }
                NodeValue::TransientObject(new_entries)
            }
        })
    }

    fn clone_validity_shape(
        &mut self,
        other: &TileFeatureLayer,
        shape: ValidityShape,
        memo: &mut HashMap<u32, NodeAddress>,
    ) -> Result<ValidityShape> {
        Ok(match shape {
            ValidityShape::None => ValidityShape::None,
            ValidityShape::SimpleGeometry(addr) => ValidityShape::SimpleGeometry(self.clone_node(other, addr, memo)?),
            ValidityShape::OffsetPoint {
                geometry,
                offset_type,
                offset,
            } => ValidityShape::OffsetPoint {
                geometry: self.clone_geometry_ref(other, geometry, memo)?,
                offset_type,
                offset,
            },
            ValidityShape::OffsetRange {
                geometry,
                offset_type,
                start,
                end,
            } => ValidityShape::OffsetRange {
                geometry: self.clone_geometry_ref(other, geometry, memo)?,
                offset_type,
                start,
                end,
            },
        })
    }

    fn clone_geometry_ref(
        &mut self,
        other: &TileFeatureLayer,
        r: GeometryRef,
        memo: &mut HashMap<u32, NodeAddress>,
    ) -> Result<GeometryRef> {
        Ok(match r {
            GeometryRef::Address(addr) => GeometryRef::Address(self.clone_node(other, addr, memo)?),
            GeometryRef::Name(id) => GeometryRef::Name(self.reintern(other, id)?),
        })
    }

    fn reintern(&mut self, other: &TileFeatureLayer, id: StringId) -> Result<StringId> {
        let s = other.resolve_string(id)?;
        Ok(self.intern(&s))
    }

    fn reintern_feature_id(&mut self, other: &TileFeatureLayer, id: &FeatureId) -> Result<FeatureId> {
        let type_id_string = self.reintern(other, id.type_id_string)?;
        Ok(FeatureId {
            type_id_string,
            type_id: id.type_id.clone(),
            prefix: id.prefix.clone(),
            parts: id.parts.clone(),
        })
    }

    /// Binary round-trip: the header followed by the model pool columns.
    pub fn write(&self, out: &mut impl Write) -> Result<()> {
        self.header.write(out)?;
        self.pool.write(out)
    }

    /// Parses a `TileFeatureLayer` previously produced by `write`, given the
    /// already-resolved `LayerInfo` and `StringPool` for its header's
    /// `(mapId, layerId)` and `nodeId`.
    pub fn read(input: &mut impl Read, layer_info: Arc<LayerInfo>, string_pool: Arc<RwLock<StringPool>>) -> Result<Self> {
        let header = TileHeader::read(input)?;
        if !header.map_version.is_compatible(&layer_info.version) {
            return Err(Error::IncompatibleVersion {
                peer_major: header.map_version.major,
                peer_minor: header.map_version.minor,
                local_major: layer_info.version.major,
                local_minor: layer_info.version.minor,
            });
        }
        let pool = ModelPool::read(input)?;
        let feature_count = pool.column_len(ColumnId::Feature) as u32;
        let features: Vec<NodeAddress> = (0..feature_count).map(|row| NodeAddress::new(ColumnId::Feature, row)).collect();
        let mut entries = Vec::with_capacity(features.len());
        for addr in &features {
            let row = pool.get_feature_node(*addr)?;
            entries.push((hash_feature_id(&row.id.type_id, &row.id.stripped_parts()), *addr));
        }
        Ok(Self {
            header,
            layer_info,
            string_pool,
            pool,
            prefix: None,
            features,
            hash_index: Mutex::new(HashIndex { entries, sorted: false }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::info::{FeatureTypeInfo, IdComposition, IdPart, IdPartDataType, LayerType};
    use std::io::Cursor;

    fn way_layer_info() -> Arc<LayerInfo> {
        Arc::new(LayerInfo {
            layer_id: "WayLayer".to_string(),
            layer_type: LayerType::Features,
            feature_types: vec![FeatureTypeInfo {
                name: "Way".to_string(),
                unique_id_compositions: vec![IdComposition {
                    parts: vec![
                        IdPart {
                            name: "areaId".to_string(),
                            datatype: IdPartDataType::Str,
                            is_optional: false,
                        },
                        IdPart {
                            name: "wayId".to_string(),
                            datatype: IdPartDataType::I64,
                            is_optional: false,
                        },
                    ],
                }],
            }],
            zoom_levels: vec![],
            coverage: None,
            can_read: true,
            can_write: true,
            version: Version::new(1, 0, 0),
        })
    }

    fn area_prefix() -> Vec<NamedIdPart> {
        vec![NamedIdPart {
            name: "areaId".to_string(),
            value: IdPartValue::Str("TheBestArea".to_string()),
            is_optional: false,
        }]
    }

    fn way_id(n: i64) -> Vec<NamedIdPart> {
        vec![NamedIdPart {
            name: "wayId".to_string(),
            value: IdPartValue::I64(n),
            is_optional: false,
        }]
    }

    fn new_layer(node_id: &str) -> TileFeatureLayer {
        let pool = Arc::new(RwLock::new(StringPool::new(node_id)));
        TileFeatureLayer::new(TileId::new(0, 0, 0), node_id, "Tropico", way_layer_info(), pool)
    }

    /// §8: `L.find(f.typeId, f.idParts) == f` for every inserted feature.
    #[test]
    fn find_returns_the_inserted_feature() {
        let mut layer = new_layer("node-a");
        layer.set_prefix(area_prefix()).unwrap();
        layer.new_feature("Way", way_id(42)).unwrap();
        layer.new_feature("Way", way_id(7)).unwrap();

        let found = layer.find("Way", &way_id(42)).unwrap().expect("feature present");
        assert_eq!(found.id.to_string_repr(), "Way.TheBestArea.42");

        let found_other = layer.find("Way", &way_id(7)).unwrap().expect("feature present");
        assert_eq!(found_other.id.to_string_repr(), "Way.TheBestArea.7");

        assert!(layer.find("Way", &way_id(99)).unwrap().is_none());
    }

    #[test]
    fn find_by_string_matches_full_id_representation() {
        let mut layer = new_layer("node-a");
        layer.set_prefix(area_prefix()).unwrap();
        layer.new_feature("Way", way_id(42)).unwrap();

        let found = layer.find_by_string("Way.TheBestArea.42").unwrap();
        assert!(found.is_some());
        assert!(layer.find_by_string("Way.TheBestArea.43").unwrap().is_none());
    }

    #[test]
    fn setting_prefix_after_first_feature_is_rejected() {
        let mut layer = new_layer("node-a");
        layer.new_feature("Way", way_id(1)).unwrap();
        let err = layer.set_prefix(area_prefix()).unwrap_err();
        assert!(matches!(err, Error::PrefixAlreadySet));
    }

    fn build_rich_feature(layer: &mut TileFeatureLayer) -> NodeAddress {
        layer.set_prefix(area_prefix()).unwrap();
        let feature_addr = layer.new_feature("Way", way_id(42)).unwrap();

        let geom = layer.new_geometry(GeometryType::Line);
        layer.append_point(geom, (41.0, 10.0, 0.0)).unwrap();
        layer.append_point(geom, (43.0, 11.0, 0.0)).unwrap();
        let collection = layer.new_geometry_collection();
        layer.push_geometry_to_collection(collection, geom).unwrap();
        layer.set_feature_geometry(feature_addr, collection).unwrap();

        let attrs_addr = layer.pool.new_object(ObjectRow::default());
        let name_key = layer.intern("name");
        layer.object_mut(attrs_addr).unwrap().set(name_key, NodeValue::String(layer.intern("Hauptstrasse")));
        layer.set_feature_attributes(feature_addr, attrs_addr).unwrap();

        let attr_addr = layer.new_attribute("speedLimit");
        let limit_key = layer.intern("value");
        layer.pool.get_attribute_mut(attr_addr).unwrap().fields.set(limit_key, NodeValue::Int64(80));
        let attr_layer_addr = layer.new_attribute_layer("properties");
        layer.add_attribute_to_layer(attr_layer_addr, attr_addr).unwrap();
        let layer_list_addr = layer.new_attribute_layer_list();
        layer.add_layer_to_list(layer_list_addr, attr_layer_addr).unwrap();
        layer.set_feature_attribute_layers(feature_addr, layer_list_addr).unwrap();

        let target = layer.new_feature_id("Way", way_id(7));
        let relation_addr = layer.new_relation("continuesAs", target);
        layer.add_feature_relation(feature_addr, relation_addr).unwrap();

        feature_addr
    }

    /// §8 round-trip law: `parse(serialize(L))` yields a layer equal to `L`
    /// by public observation.
    #[test]
    fn serialize_then_parse_round_trips_features_attributes_and_relations() {
        let mut layer = new_layer("node-a");
        let feature_addr = build_rich_feature(&mut layer);
        let original = layer.resolve_feature(feature_addr).unwrap();

        let mut buf = Vec::new();
        layer.write(&mut buf).unwrap();

        let mut cursor = Cursor::new(buf);
        let parsed = TileFeatureLayer::read(&mut cursor, way_layer_info(), layer.string_pool.clone()).unwrap();

        assert_eq!(parsed.size(), 1);
        let roundtripped = parsed.at(0).unwrap();

        assert_eq!(roundtripped.id, original.id);
        assert_eq!(roundtripped.geometry.geometries, original.geometry.geometries);
        assert_eq!(roundtripped.attributes, original.attributes);
        assert_eq!(roundtripped.attribute_layers, original.attribute_layers);
        assert_eq!(roundtripped.relations, original.relations);

        assert_eq!(parsed.header.map_id, layer.header.map_id);
        assert_eq!(parsed.header.tile_id, layer.header.tile_id);

        let found = parsed.find("Way", &way_id(42)).unwrap().expect("feature survives round-trip");
        assert_eq!(found.id.to_string_repr(), "Way.TheBestArea.42");
    }

    #[test]
    fn clone_feature_deep_copies_into_another_layer() {
        let mut source = new_layer("node-a");
        let feature_addr = build_rich_feature(&mut source);
        let original = source.resolve_feature(feature_addr).unwrap();

        let mut target = new_layer("node-b");
        let mut memo = HashMap::new();
        let cloned_addr = target
            .clone_feature(&source, feature_addr, "Way", way_id(42), &mut memo)
            .unwrap();
        let cloned = target.resolve_feature(cloned_addr).unwrap();

        assert_eq!(cloned.id.type_id, original.id.type_id);
        assert_eq!(cloned.id.parts, original.id.parts);
        assert_eq!(cloned.geometry.geometries, original.geometry.geometries);
        assert_eq!(cloned.attribute_layers.len(), original.attribute_layers.len());
        assert_eq!(cloned.relations.len(), original.relations.len());

        // The clone lives in its own node pool: re-running find on the
        // target layer resolves through target's own hash index, not the
        // source's.
        let found = target.find("Way", &way_id(42)).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn incompatible_major_version_is_rejected_on_read() {
        let layer = new_layer("node-a");
        let mut buf = Vec::new();
        layer.write(&mut buf).unwrap();

        let mismatched_info = Arc::new(LayerInfo {
            version: Version::new(2, 0, 0),
            ..(*way_layer_info()).clone()
        });
        let mut cursor = Cursor::new(buf);
        let err = TileFeatureLayer::read(&mut cursor, mismatched_info, layer.string_pool.clone()).unwrap_err();
        assert!(matches!(err, Error::IncompatibleVersion { .. }));
    }

    /// §4.3/§8: an open ring is auto-closed on read without mutating the
    /// stored data, and a clockwise-stored outer ring is reoriented to CCW.
    #[test]
    fn polygon_outer_ring_auto_closes_and_reorients_to_ccw() {
        let mut layer = new_layer("node-a");
        // Clockwise, unclosed square.
        let cw_ring = vec![(0.0, 0.0, 0.0), (0.0, 1.0, 0.0), (1.0, 1.0, 0.0), (1.0, 0.0, 0.0)];
        let polygon_addr = layer.new_polygon(vec![cw_ring.clone()]).unwrap();

        let geom = layer.resolve_geometry(polygon_addr).unwrap();
        assert_eq!(geom.geometry_type, GeometryType::Polygon);
        assert_eq!(geom.rings.len(), 1);

        let ring = &geom.rings[0];
        assert_eq!(ring.first(), ring.last(), "ring must be auto-closed");
        assert_eq!(ring.len(), cw_ring.len() + 1);

        assert!(
            crate::model::geometry::ring_signed_area(ring) > 0.0,
            "outer ring stored clockwise must read back CCW"
        );

        let stored_ring_addr = layer.pool.get_polygon(layer.pool.get_geometry(polygon_addr).unwrap().polygon.unwrap()).unwrap().rings[0];
        assert!(layer.pool.get_linear_ring(stored_ring_addr).unwrap().stored_clockwise);
    }

    #[test]
    fn polygon_already_ccw_ring_is_left_unreversed() {
        let mut layer = new_layer("node-a");
        let ccw_ring = vec![(0.0, 0.0, 0.0), (1.0, 0.0, 0.0), (1.0, 1.0, 0.0), (0.0, 1.0, 0.0)];
        let polygon_addr = layer.new_polygon(vec![ccw_ring.clone()]).unwrap();

        let geom = layer.resolve_geometry(polygon_addr).unwrap();
        let mut expected = ccw_ring;
        expected.push(expected[0]);
        assert_eq!(geom.rings[0], expected);
    }

    #[test]
    fn mesh_triangles_builds_one_view_per_triple_of_vertices() {
        let mut layer = new_layer("node-a");
        let mesh = layer.new_geometry(GeometryType::Mesh);
        for p in [
            (0.0, 0.0, 0.0),
            (1.0, 0.0, 0.0),
            (0.0, 1.0, 0.0),
            (1.0, 0.0, 0.0),
            (1.0, 1.0, 0.0),
            (0.0, 1.0, 0.0),
        ] {
            layer.append_point(mesh, p).unwrap();
        }
        let triangles = layer.mesh_triangles(mesh).unwrap();
        assert_eq!(triangles.len(), 2);
        let first = layer.resolve_geometry(triangles[0]).unwrap();
        assert_eq!(first.points.len(), 3);
    }

    #[test]
    fn mesh_with_vertex_count_not_multiple_of_three_is_rejected() {
        let mut layer = new_layer("node-a");
        let mesh = layer.new_geometry(GeometryType::Mesh);
        layer.append_point(mesh, (0.0, 0.0, 0.0)).unwrap();
        layer.append_point(mesh, (1.0, 0.0, 0.0)).unwrap();

        assert!(layer.mesh_triangles(mesh).is_err());
        assert!(layer.resolve_geometry(mesh).is_err());
    }
}
