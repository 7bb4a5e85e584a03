use crate::error::{Error, Result};
use crate::model::attribute::{Attribute, AttributeLayer, AttributeLayerList};
use crate::model::feature_id::{FeatureId, IdPartValue, NamedIdPart};
use crate::model::geometry::{
    GeometryCollectionRow, GeometryRow, GeometryType, GeometryView, LinearRingRow, PointBufferRow, PolygonRow,
};
use crate::model::object::{ArrayRow, NodeValue, ObjectEntry, ObjectRow};
use crate::model::relation::Relation;
use crate::model::source_data::{SourceDataAddress, SourceDataReferenceItem};
use crate::model::string_pool::{read_string, write_string, StringId};
use crate::model::validity::{Direction, GeometryRef, MultiValidity, OffsetType, OffsetValue, Validity, ValidityShape};
use std::io::{Read, Write};

/// A materialized feature node: the id plus addresses into the other
/// columns holding its geometry, attributes, attribute layers and
/// relations.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureRow {
    pub id: FeatureId,
    pub geometry: Option<NodeAddress>,
    pub attributes: Option<NodeAddress>,
    pub attribute_layers: Option<NodeAddress>,
    pub relations: Vec<NodeAddress>,
}

/// The column kinds making up a `ModelPool`. Consolidated from the
/// spec's 27-way column list: small-value/int64/double/string-id scalars
/// share one tagged `Value` column (see `object::NodeValue`), and feature
/// property views are materialized on demand as `NodeValue::TransientObject`
/// rather than persisted, matching the `TransientObject` tag already named
/// alongside the value-type tag in §4.2. Mesh triangle groupings reuse the
/// existing `Geometry` view mechanism instead of dedicated columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnId {
    Object = 0,
    Array = 1,
    Feature = 2,
    FeatureId = 3,
    Attribute = 4,
    AttributeLayer = 5,
    AttributeLayerList = 6,
    Relation = 7,
    PointBuffer = 8,
    Geometry = 9,
    GeometryCollection = 10,
    Polygon = 11,
    LinearRing = 12,
    SourceDataReference = 13,
    Validity = 14,
    ValidityCollection = 15,
}

const COLUMN_ROW_BITS: u32 = 24;
const COLUMN_ROW_MASK: u32 = (1 << COLUMN_ROW_BITS) - 1;

/// A stable `(columnId, row)` address packed into 32 bits. Addresses are
/// never invalidated by column growth (segmented storage) and are never
/// reused once issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeAddress(u32);

impl NodeAddress {
    #[must_use]
    pub fn new(column: ColumnId, row: u32) -> Self {
        debug_assert!(row <= COLUMN_ROW_MASK, "row index overflows 24-bit address space");
        Self(((column as u32) << COLUMN_ROW_BITS) | (row & COLUMN_ROW_MASK))
    }

    #[must_use]
    pub fn column(&self) -> u8 {
        (self.0 >> COLUMN_ROW_BITS) as u8
    }

    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & COLUMN_ROW_MASK
    }

    #[must_use]
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// A segmented vector (paged arena): pushing never reallocates previously
/// issued addresses, since pages are fixed-size once allocated.
#[derive(Clone, Debug)]
struct Column<T> {
    page_size: usize,
    pages: Vec<Vec<T>>,
}

impl<T> Column<T> {
    fn new() -> Self {
        Self {
            page_size: 4096,
            pages: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    fn push(&mut self, value: T) -> u32 {
        if self.pages.last().map(Vec::len).unwrap_or(0) >= self.page_size || self.pages.is_empty() {
            self.pages.push(Vec::with_capacity(self.page_size));
        }
        let page = self.pages.last_mut().unwrap();
        page.push(value);
        (self.len() - 1) as u32
    }

    fn get(&self, row: u32) -> Option<&T> {
        let mut remaining = row as usize;
        for page in &self.pages {
            if remaining < page.len() {
                return page.get(remaining);
            }
            remaining -= page.len();
        }
        None
    }

    fn get_mut(&mut self, row: u32) -> Option<&mut T> {
        let mut remaining = row as usize;
        for page in &mut self.pages {
            if remaining < page.len() {
                return page.get_mut(remaining);
            }
            remaining -= page.len();
        }
        None
    }
}

/// An owned snapshot of whatever a `NodeAddress` resolves to, dispatched on
/// its `ColumnId` tag.
#[derive(Clone, Debug)]
pub enum ResolvedNode {
    Object(ObjectRow),
    Array(ArrayRow),
    Feature(FeatureRow),
    FeatureId(FeatureId),
    Attribute(Attribute),
    AttributeLayer(AttributeLayer),
    AttributeLayerList(AttributeLayerList),
    Relation(Relation),
    PointBuffer(PointBufferRow),
    Geometry(GeometryRow),
    GeometryCollection(GeometryCollectionRow),
    Polygon(PolygonRow),
    LinearRing(LinearRingRow),
    SourceDataReference(Vec<SourceDataReferenceItem>),
    Validity(Validity),
    ValidityCollection(MultiValidity),
}

/// The tile's append-only columnar arena. Rows are never deleted or
/// reordered; every address issued remains valid for the tile's lifetime.
#[derive(Clone, Debug, Default)]
pub struct ModelPool {
    objects: Option<Column<ObjectRow>>,
    arrays: Option<Column<ArrayRow>>,
    features: Option<Column<FeatureRow>>,
    feature_ids: Option<Column<FeatureId>>,
    attributes: Option<Column<Attribute>>,
    attribute_layers: Option<Column<AttributeLayer>>,
    attribute_layer_lists: Option<Column<AttributeLayerList>>,
    relations: Option<Column<Relation>>,
    point_buffers: Option<Column<PointBufferRow>>,
    geometries: Option<Column<GeometryRow>>,
    geometry_collections: Option<Column<GeometryCollectionRow>>,
    polygons: Option<Column<PolygonRow>>,
    linear_rings: Option<Column<LinearRingRow>>,
    source_data_references: Option<Column<Vec<SourceDataReferenceItem>>>,
    validities: Option<Column<Validity>>,
    validity_collections: Option<Column<MultiValidity>>,
}

macro_rules! column_ops {
    ($field:ident, $column:expr, $new_fn:ident, $get_fn:ident, $get_mut_fn:ident, $ty:ty) => {
        pub fn $new_fn(&mut self, value: $ty) -> NodeAddress {
            let column = self.$field.get_or_insert_with(Column::new);
            let row = column.push(value);
            NodeAddress::new($column, row)
        }

        pub fn $get_fn(&self, addr: NodeAddress) -> Result<&$ty> {
            self.$field
                .as_ref()
                .and_then(|c| c.get(addr.row()))
                .ok_or_else(|| Error::Contract(format!("dangling address {:?}", addr)))
        }

        pub fn $get_mut_fn(&mut self, addr: NodeAddress) -> Result<&mut $ty> {
            self.$field
                .as_mut()
                .and_then(|c| c.get_mut(addr.row()))
                .ok_or_else(|| Error::Contract(format!("dangling address {:?}", addr)))
        }
    };
}

impl ModelPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    column_ops!(objects, ColumnId::Object, new_object, get_object, get_object_mut, ObjectRow);
    column_ops!(arrays, ColumnId::Array, new_array, get_array, get_array_mut, ArrayRow);
    column_ops!(features, ColumnId::Feature, new_feature_node, get_feature_node, get_feature_node_mut, FeatureRow);
    column_ops!(feature_ids, ColumnId::FeatureId, new_feature_id, get_feature_id, get_feature_id_mut, FeatureId);
    column_ops!(attributes, ColumnId::Attribute, new_attribute, get_attribute, get_attribute_mut, Attribute);
    column_ops!(
        attribute_layers,
        ColumnId::AttributeLayer,
        new_attribute_layer,
        get_attribute_layer,
        get_attribute_layer_mut,
        AttributeLayer
    );
    column_ops!(
        attribute_layer_lists,
        ColumnId::AttributeLayerList,
        new_attribute_layers,
        get_attribute_layers,
        get_attribute_layers_mut,
        AttributeLayerList
    );
    column_ops!(relations, ColumnId::Relation, new_relation, get_relation, get_relation_mut, Relation);
    column_ops!(
        point_buffers,
        ColumnId::PointBuffer,
        new_point_buffer,
        get_point_buffer,
        get_point_buffer_mut,
        PointBufferRow
    );
    column_ops!(geometries, ColumnId::Geometry, new_geometry_row, get_geometry, get_geometry_mut, GeometryRow);
    column_ops!(
        geometry_collections,
        ColumnId::GeometryCollection,
        new_geometry_collection,
        get_geometry_collection,
        get_geometry_collection_mut,
        GeometryCollectionRow
    );
    column_ops!(polygons, ColumnId::Polygon, new_polygon, get_polygon, get_polygon_mut, PolygonRow);
    column_ops!(
        linear_rings,
        ColumnId::LinearRing,
        new_linear_ring,
        get_linear_ring,
        get_linear_ring_mut,
        LinearRingRow
    );
    column_ops!(
        source_data_references,
        ColumnId::SourceDataReference,
        new_source_data_reference_collection,
        get_source_data_reference_collection,
        get_source_data_reference_collection_mut,
        Vec<SourceDataReferenceItem>
    );
    column_ops!(validities, ColumnId::Validity, new_validity, get_validity, get_validity_mut, Validity);
    column_ops!(
        validity_collections,
        ColumnId::ValidityCollection,
        new_validity_collection,
        get_validity_collection,
        get_validity_collection_mut,
        MultiValidity
    );

    pub fn new_geometry(&mut self, geometry_type: GeometryType) -> NodeAddress {
        self.new_geometry_row(GeometryRow::owned(geometry_type))
    }

    pub fn new_geometry_view(
        &mut self,
        geometry_type: GeometryType,
        base: NodeAddress,
        offset: usize,
        size: usize,
    ) -> NodeAddress {
        self.new_geometry_row(GeometryRow::view(base, offset, size, Some(geometry_type)))
    }

    /// Dispatches on `addr`'s `ColumnId` tag and returns an owned snapshot
    /// of the resolved node. Re-entrant and side-effect free, so query
    /// evaluation can walk the graph concurrently with other readers.
    pub fn resolve(&self, addr: NodeAddress) -> Result<ResolvedNode> {
        match addr.column() {
            c if c == ColumnId::Object as u8 => Ok(ResolvedNode::Object(self.get_object(addr)?.clone())),
            c if c == ColumnId::Array as u8 => Ok(ResolvedNode::Array(self.get_array(addr)?.clone())),
            c if c == ColumnId::Feature as u8 => Ok(ResolvedNode::Feature(self.get_feature_node(addr)?.clone())),
            c if c == ColumnId::FeatureId as u8 => Ok(ResolvedNode::FeatureId(self.get_feature_id(addr)?.clone())),
            c if c == ColumnId::Attribute as u8 => Ok(ResolvedNode::Attribute(self.get_attribute(addr)?.clone())),
            c if c == ColumnId::AttributeLayer as u8 => {
                Ok(ResolvedNode::AttributeLayer(self.get_attribute_layer(addr)?.clone()))
            }
            c if c == ColumnId::AttributeLayerList as u8 => {
                Ok(ResolvedNode::AttributeLayerList(self.get_attribute_layers(addr)?.clone()))
            }
            c if c == ColumnId::Relation as u8 => Ok(ResolvedNode::Relation(self.get_relation(addr)?.clone())),
            c if c == ColumnId::PointBuffer as u8 => Ok(ResolvedNode::PointBuffer(self.get_point_buffer(addr)?.clone())),
            c if c == ColumnId::Geometry as u8 => Ok(ResolvedNode::Geometry(self.get_geometry(addr)?.clone())),
            c if c == ColumnId::GeometryCollection as u8 => {
                Ok(ResolvedNode::GeometryCollection(self.get_geometry_collection(addr)?.clone()))
            }
            c if c == ColumnId::Polygon as u8 => Ok(ResolvedNode::Polygon(self.get_polygon(addr)?.clone())),
            c if c == ColumnId::LinearRing as u8 => Ok(ResolvedNode::LinearRing(self.get_linear_ring(addr)?.clone())),
            c if c == ColumnId::SourceDataReference as u8 => Ok(ResolvedNode::SourceDataReference(
                self.get_source_data_reference_collection(addr)?.clone(),
            )),
            c if c == ColumnId::Validity as u8 => Ok(ResolvedNode::Validity(self.get_validity(addr)?.clone())),
            c if c == ColumnId::ValidityCollection as u8 => {
                Ok(ResolvedNode::ValidityCollection(self.get_validity_collection(addr)?.clone()))
            }
            other => Err(Error::Contract(format!("unknown column id {other}"))),
        }
    }

    /// Resolves a possibly-chained geometry view down to its owned buffer,
    /// returning the effective `(buffer, offset, size, type)`.
    pub fn resolve_geometry_buffer<'a>(&'a self, mut addr: NodeAddress) -> Result<(&'a PointBufferRow, usize, usize, GeometryType)> {
        let mut type_override = None;
        loop {
            let row = self.get_geometry(addr)?;
            match &row.view {
                None => {
                    let buf = row.buffer.as_ref().ok_or_else(|| Error::Contract("geometry has neither buffer nor view".into()))?;
                    return Ok((buf, 0, buf.num_points(), type_override.unwrap_or(row.geometry_type)));
                }
                Some(view) => {
                    if type_override.is_none() {
                        type_override = view.type_override;
                    }
                    addr = view.base;
                }
            }
        }
    }

    /// Number of rows stored so far in the given column; used by the wire
    /// writer to enumerate every address in a column for serialization.
    #[must_use]
    pub fn column_len(&self, column: ColumnId) -> usize {
        match column {
            ColumnId::Object => self.objects.as_ref().map_or(0, Column::len),
            ColumnId::Array => self.arrays.as_ref().map_or(0, Column::len),
            ColumnId::Feature => self.features.as_ref().map_or(0, Column::len),
            ColumnId::FeatureId => self.feature_ids.as_ref().map_or(0, Column::len),
            ColumnId::Attribute => self.attributes.as_ref().map_or(0, Column::len),
            ColumnId::AttributeLayer => self.attribute_layers.as_ref().map_or(0, Column::len),
            ColumnId::AttributeLayerList => self.attribute_layer_lists.as_ref().map_or(0, Column::len),
            ColumnId::Relation => self.relations.as_ref().map_or(0, Column::len),
            ColumnId::PointBuffer => self.point_buffers.as_ref().map_or(0, Column::len),
            ColumnId::Geometry => self.geometries.as_ref().map_or(0, Column::len),
            ColumnId::GeometryCollection => self.geometry_collections.as_ref().map_or(0, Column::len),
            ColumnId::Polygon => self.polygons.as_ref().map_or(0, Column::len),
            ColumnId::LinearRing => self.linear_rings.as_ref().map_or(0, Column::len),
            ColumnId::SourceDataReference => self.source_data_references.as_ref().map_or(0, Column::len),
            ColumnId::Validity => self.validities.as_ref().map_or(0, Column::len),
            ColumnId::ValidityCollection => self.validity_collections.as_ref().map_or(0, Column::len),
        }
    }

    /// Serializes every column as a `u32` row count followed by each row in
    /// insertion order. Row addresses are never written explicitly; a
    /// reader reconstructs them by re-inserting rows in the same order,
    /// which reproduces the same `(column, row)` pairs.
    pub fn write(&self, out: &mut impl Write) -> Result<()> {
        write_count(out, self.column_len(ColumnId::Object))?;
        for i in 0..self.column_len(ColumnId::Object) {
            write_object(out, self.get_object(NodeAddress::new(ColumnId::Object, i as u32))?)?;
        }
        write_count(out, self.column_len(ColumnId::Array))?;
        for i in 0..self.column_len(ColumnId::Array) {
            write_array(out, self.get_array(NodeAddress::new(ColumnId::Array, i as u32))?)?;
        }
        write_count(out, self.column_len(ColumnId::Feature))?;
        for i in 0..self.column_len(ColumnId::Feature) {
            write_feature_row(out, self.get_feature_node(NodeAddress::new(ColumnId::Feature, i as u32))?)?;
        }
        write_count(out, self.column_len(ColumnId::FeatureId))?;
        for i in 0..self.column_len(ColumnId::FeatureId) {
            write_feature_id(out, self.get_feature_id(NodeAddress::new(ColumnId::FeatureId, i as u32))?)?;
        }
        write_count(out, self.column_len(ColumnId::Attribute))?;
        for i in 0..self.column_len(ColumnId::Attribute) {
            write_attribute(out, self.get_attribute(NodeAddress::new(ColumnId::Attribute, i as u32))?)?;
        }
        write_count(out, self.column_len(ColumnId::AttributeLayer))?;
        for i in 0..self.column_len(ColumnId::AttributeLayer) {
            write_attribute_layer(out, self.get_attribute_layer(NodeAddress::new(ColumnId::AttributeLayer, i as u32))?)?;
        }
        write_count(out, self.column_len(ColumnId::AttributeLayerList))?;
        for i in 0..self.column_len(ColumnId::AttributeLayerList) {
            write_node_addresses(out, &self.get_attribute_layers(NodeAddress::new(ColumnId::AttributeLayerList, i as u32))?.0)?;
        }
        write_count(out, self.column_len(ColumnId::Relation))?;
        for i in 0..self.column_len(ColumnId::Relation) {
            write_relation(out, self.get_relation(NodeAddress::new(ColumnId::Relation, i as u32))?)?;
        }
        write_count(out, self.column_len(ColumnId::PointBuffer))?;
        for i in 0..self.column_len(ColumnId::PointBuffer) {
            write_point_buffer(out, self.get_point_buffer(NodeAddress::new(ColumnId::PointBuffer, i as u32))?)?;
        }
        write_count(out, self.column_len(ColumnId::Geometry))?;
        for i in 0..self.column_len(ColumnId::Geometry) {
            write_geometry_row(out, self.get_geometry(NodeAddress::new(ColumnId::Geometry, i as u32))?)?;
        }
        write_count(out, self.column_len(ColumnId::GeometryCollection))?;
        for i in 0..self.column_len(ColumnId::GeometryCollection) {
            write_node_addresses(out, &self.get_geometry_collection(NodeAddress::new(ColumnId::GeometryCollection, i as u32))?.0)?;
        }
        write_count(out, self.column_len(ColumnId::Polygon))?;
        for i in 0..self.column_len(ColumnId::Polygon) {
            write_node_addresses(out, &self.get_polygon(NodeAddress::new(ColumnId::Polygon, i as u32))?.rings)?;
        }
        write_count(out, self.column_len(ColumnId::LinearRing))?;
        for i in 0..self.column_len(ColumnId::LinearRing) {
            write_linear_ring(out, self.get_linear_ring(NodeAddress::new(ColumnId::LinearRing, i as u32))?)?;
        }
        write_count(out, self.column_len(ColumnId::SourceDataReference))?;
        for i in 0..self.column_len(ColumnId::SourceDataReference) {
            write_source_data_references(out, self.get_source_data_reference_collection(NodeAddress::new(ColumnId::SourceDataReference, i as u32))?)?;
        }
        write_count(out, self.column_len(ColumnId::Validity))?;
        for i in 0..self.column_len(ColumnId::Validity) {
            write_validity(out, self.get_validity(NodeAddress::new(ColumnId::Validity, i as u32))?)?;
        }
        write_count(out, self.column_len(ColumnId::ValidityCollection))?;
        for i in 0..self.column_len(ColumnId::ValidityCollection) {
            write_node_addresses(out, &self.get_validity_collection(NodeAddress::new(ColumnId::ValidityCollection, i as u32))?.0)?;
        }
        Ok(())
    }

    /// Inverse of `write`: re-inserts every row of every column in the same
    /// order they were written, so every `NodeAddress` issued during
    /// writing is reproduced identically during reading.
    pub fn read(input: &mut impl Read) -> Result<Self> {
        let mut pool = ModelPool::new();
        for _ in 0..read_count(input)? {
            let row = read_object(input)?;
            pool.new_object(row);
        }
        for _ in 0..read_count(input)? {
            let row = read_array(input)?;
            pool.new_array(row);
        }
        for _ in 0..read_count(input)? {
            let row = read_feature_row(input)?;
            pool.new_feature_node(row);
        }
        for _ in 0..read_count(input)? {
            let row = read_feature_id(input)?;
            pool.new_feature_id(row);
        }
        for _ in 0..read_count(input)? {
            let row = read_attribute(input)?;
            pool.new_attribute(row);
        }
        for _ in 0..read_count(input)? {
            let row = read_attribute_layer(input)?;
            pool.new_attribute_layer(row);
        }
        for _ in 0..read_count(input)? {
            let addrs = read_node_addresses(input)?;
            pool.new_attribute_layers(AttributeLayerList(addrs));
        }
        for _ in 0..read_count(input)? {
            let row = read_relation(input)?;
            pool.new_relation(row);
        }
        for _ in 0..read_count(input)? {
            let row = read_point_buffer(input)?;
            pool.new_point_buffer(row);
        }
        for _ in 0..read_count(input)? {
            let row = read_geometry_row(input)?;
            pool.new_geometry_row(row);
        }
        for _ in 0..read_count(input)? {
            let addrs = read_node_addresses(input)?;
            pool.new_geometry_collection(GeometryCollectionRow(addrs));
        }
        for _ in 0..read_count(input)? {
            let addrs = read_node_addresses(input)?;
            pool.new_polygon(PolygonRow { rings: addrs });
        }
        for _ in 0..read_count(input)? {
            let row = read_linear_ring(input)?;
            pool.new_linear_ring(row);
        }
        for _ in 0..read_count(input)? {
            let items = read_source_data_references(input)?;
            pool.new_source_data_reference_collection(items);
        }
        for _ in 0..read_count(input)? {
            let row = read_validity(input)?;
            pool.new_validity(row);
        }
        for _ in 0..read_count(input)? {
            let addrs = read_node_addresses(input)?;
            pool.new_validity_collection(MultiValidity(addrs));
        }
        Ok(pool)
    }
}

fn write_count(out: &mut impl Write, n: usize) -> Result<()> {
    out.write_all(&(n as u32).to_le_bytes())?;
    Ok(())
}

fn read_count(input: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_address(out: &mut impl Write, addr: NodeAddress) -> Result<()> {
    out.write_all(&addr.raw().to_le_bytes())?;
    Ok(())
}

fn read_address(input: &mut impl Read) -> Result<NodeAddress> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(NodeAddress(u32::from_le_bytes(buf)))
}

fn write_opt_address(out: &mut impl Write, addr: Option<NodeAddress>) -> Result<()> {
    match addr {
        Some(a) => {
            out.write_all(&[1u8])?;
            write_address(out, a)
        }
        None => out.write_all(&[0u8]).map_err(Error::from),
    }
}

fn read_opt_address(input: &mut impl Read) -> Result<Option<NodeAddress>> {
    let mut flag = [0u8; 1];
    input.read_exact(&mut flag)?;
    if flag[0] == 0 {
        Ok(None)
    } else {
        Ok(Some(read_address(input)?))
    }
}

fn write_node_addresses(out: &mut impl Write, addrs: &[NodeAddress]) -> Result<()> {
    write_count(out, addrs.len())?;
    for a in addrs {
        write_address(out, *a)?;
    }
    Ok(())
}

fn read_node_addresses(input: &mut impl Read) -> Result<Vec<NodeAddress>> {
    let n = read_count(input)?;
    (0..n).map(|_| read_address(input)).collect()
}

fn write_string_id(out: &mut impl Write, id: StringId) -> Result<()> {
    out.write_all(&id.to_le_bytes())?;
    Ok(())
}

fn read_string_id(input: &mut impl Read) -> Result<StringId> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf)?;
    Ok(StringId::from_le_bytes(buf))
}

fn write_node_value(out: &mut impl Write, value: &NodeValue) -> Result<()> {
    match value {
        NodeValue::Null => out.write_all(&[0u8])?,
        NodeValue::Bool(b) => {
            out.write_all(&[1u8])?;
            out.write_all(&[*b as u8])?;
        }
        NodeValue::Int64(v) => {
            out.write_all(&[2u8])?;
            out.write_all(&v.to_le_bytes())?;
        }
        NodeValue::Float64(v) => {
            out.write_all(&[3u8])?;
            out.write_all(&v.to_bits().to_le_bytes())?;
        }
        NodeValue::String(id) => {
            out.write_all(&[4u8])?;
            write_string_id(out, *id)?;
        }
        NodeValue::Array(addr) => {
            out.write_all(&[5u8])?;
            write_address(out, *addr)?;
        }
        NodeValue::Object(addr) => {
            out.write_all(&[6u8])?;
            write_address(out, *addr)?;
        }
        NodeValue::TransientObject(_) => {
            return Err(Error::Contract(
                "transient objects are never persisted to a column".to_string(),
            ))
        }
    }
    Ok(())
}

fn read_node_value(input: &mut impl Read) -> Result<NodeValue> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;
    Ok(match tag[0] {
        0 => NodeValue::Null,
        1 => {
            let mut b = [0u8; 1];
            input.read_exact(&mut b)?;
            NodeValue::Bool(b[0] != 0)
        }
        2 => {
            let mut b = [0u8; 8];
            input.read_exact(&mut b)?;
            NodeValue::Int64(i64::from_le_bytes(b))
        }
        3 => {
            let mut b = [0u8; 8];
            input.read_exact(&mut b)?;
            NodeValue::Float64(f64::from_bits(u64::from_le_bytes(b)))
        }
        4 => NodeValue::String(read_string_id(input)?),
        5 => NodeValue::Array(read_address(input)?),
        6 => NodeValue::Object(read_address(input)?),
        other => return Err(Error::Protocol(format!("unknown node value tag {other}"))),
    })
}

fn write_object(out: &mut impl Write, obj: &ObjectRow) -> Result<()> {
    write_count(out, obj.0.len())?;
    for entry in &obj.0 {
        write_string_id(out, entry.key)?;
        write_node_value(out, &entry.value)?;
    }
    Ok(())
}

fn read_object(input: &mut impl Read) -> Result<ObjectRow> {
    let n = read_count(input)?;
    let mut entries = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let key = read_string_id(input)?;
        let value = read_node_value(input)?;
        entries.push(ObjectEntry { key, value });
    }
    Ok(ObjectRow(entries))
}

fn write_array(out: &mut impl Write, arr: &ArrayRow) -> Result<()> {
    write_count(out, arr.0.len())?;
    for v in &arr.0 {
        write_node_value(out, v)?;
    }
    Ok(())
}

fn read_array(input: &mut impl Read) -> Result<ArrayRow> {
    let n = read_count(input)?;
    let mut values = Vec::with_capacity(n as usize);
    for _ in 0..n {
        values.push(read_node_value(input)?);
    }
    Ok(ArrayRow(values))
}

fn write_id_part_value(out: &mut impl Write, value: &IdPartValue) -> Result<()> {
    match value {
        IdPartValue::I32(v) => {
            out.write_all(&[0u8])?;
            out.write_all(&v.to_le_bytes())?;
        }
        IdPartValue::U32(v) => {
            out.write_all(&[1u8])?;
            out.write_all(&v.to_le_bytes())?;
        }
        IdPartValue::I64(v) => {
            out.write_all(&[2u8])?;
            out.write_all(&v.to_le_bytes())?;
        }
        IdPartValue::U64(v) => {
            out.write_all(&[3u8])?;
            out.write_all(&v.to_le_bytes())?;
        }
        IdPartValue::Uuid128(bytes) => {
            out.write_all(&[4u8])?;
            out.write_all(bytes)?;
        }
        IdPartValue::Str(s) => {
            out.write_all(&[5u8])?;
            write_string(out, s)?;
        }
    }
    Ok(())
}

fn read_id_part_value(input: &mut impl Read) -> Result<IdPartValue> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;
    Ok(match tag[0] {
        0 => {
            let mut b = [0u8; 4];
            input.read_exact(&mut b)?;
            IdPartValue::I32(i32::from_le_bytes(b))
        }
        1 => {
            let mut b = [0u8; 4];
            input.read_exact(&mut b)?;
            IdPartValue::U32(u32::from_le_bytes(b))
        }
        2 => {
            let mut b = [0u8; 8];
            input.read_exact(&mut b)?;
            IdPartValue::I64(i64::from_le_bytes(b))
        }
        3 => {
            let mut b = [0u8; 8];
            input.read_exact(&mut b)?;
            IdPartValue::U64(u64::from_le_bytes(b))
        }
        4 => {
            let mut b = [0u8; 16];
            input.read_exact(&mut b)?;
            IdPartValue::Uuid128(b)
        }
        5 => IdPartValue::Str(read_string(input)?),
        other => return Err(Error::Protocol(format!("unknown id part tag {other}"))),
    })
}

fn write_named_id_part(out: &mut impl Write, part: &NamedIdPart) -> Result<()> {
    write_string(out, &part.name)?;
    write_id_part_value(out, &part.value)?;
    out.write_all(&[part.is_optional as u8])?;
    Ok(())
}

fn read_named_id_part(input: &mut impl Read) -> Result<NamedIdPart> {
    let name = read_string(input)?;
    let value = read_id_part_value(input)?;
    let mut flag = [0u8; 1];
    input.read_exact(&mut flag)?;
    Ok(NamedIdPart {
        name,
        value,
        is_optional: flag[0] != 0,
    })
}

fn write_named_id_parts(out: &mut impl Write, parts: &[NamedIdPart]) -> Result<()> {
    write_count(out, parts.len())?;
    for p in parts {
        write_named_id_part(out, p)?;
    }
    Ok(())
}

fn read_named_id_parts(input: &mut impl Read) -> Result<Vec<NamedIdPart>> {
    let n = read_count(input)?;
    (0..n).map(|_| read_named_id_part(input)).collect()
}

fn write_feature_id(out: &mut impl Write, id: &FeatureId) -> Result<()> {
    write_string_id(out, id.type_id_string)?;
    write_string(out, &id.type_id)?;
    write_named_id_parts(out, &id.prefix)?;
    write_named_id_parts(out, &id.parts)?;
    Ok(())
}

fn read_feature_id(input: &mut impl Read) -> Result<FeatureId> {
    let type_id_string = read_string_id(input)?;
    let type_id = read_string(input)?;
    let prefix = read_named_id_parts(input)?;
    let parts = read_named_id_parts(input)?;
    Ok(FeatureId {
        type_id_string,
        type_id,
        prefix,
        parts,
    })
}

fn write_feature_row(out: &mut impl Write, row: &FeatureRow) -> Result<()> {
    write_feature_id(out, &row.id)?;
    write_opt_address(out, row.geometry)?;
    write_opt_address(out, row.attributes)?;
    write_opt_address(out, row.attribute_layers)?;
    write_node_addresses(out, &row.relations)?;
    Ok(())
}

fn read_feature_row(input: &mut impl Read) -> Result<FeatureRow> {
    let id = read_feature_id(input)?;
    let geometry = read_opt_address(input)?;
    let attributes = read_opt_address(input)?;
    let attribute_layers = read_opt_address(input)?;
    let relations = read_node_addresses(input)?;
    Ok(FeatureRow {
        id,
        geometry,
        attributes,
        attribute_layers,
        relations,
    })
}

fn write_direction(out: &mut impl Write, d: Direction) -> Result<()> {
    let tag: u8 = match d {
        Direction::Empty => 0,
        Direction::Positive => 1,
        Direction::Negative => 2,
        Direction::Both => 3,
        Direction::None => 4,
    };
    out.write_all(&[tag])?;
    Ok(())
}

fn read_direction(input: &mut impl Read) -> Result<Direction> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;
    Ok(match tag[0] {
        0 => Direction::Empty,
        1 => Direction::Positive,
        2 => Direction::Negative,
        3 => Direction::Both,
        4 => Direction::None,
        other => return Err(Error::Protocol(format!("unknown direction tag {other}"))),
    })
}

fn write_attribute(out: &mut impl Write, attr: &Attribute) -> Result<()> {
    write_string_id(out, attr.name)?;
    write_direction(out, attr.direction)?;
    write_opt_address(out, attr.validity)?;
    write_object(out, &attr.fields)?;
    Ok(())
}

fn read_attribute(input: &mut impl Read) -> Result<Attribute> {
    let name = read_string_id(input)?;
    let direction = read_direction(input)?;
    let validity = read_opt_address(input)?;
    let fields = read_object(input)?;
    Ok(Attribute {
        name,
        direction,
        validity,
        fields,
    })
}

fn write_attribute_layer(out: &mut impl Write, layer: &AttributeLayer) -> Result<()> {
    write_string_id(out, layer.name)?;
    write_node_addresses(out, &layer.attributes)?;
    Ok(())
}

fn read_attribute_layer(input: &mut impl Read) -> Result<AttributeLayer> {
    let name = read_string_id(input)?;
    let attributes = read_node_addresses(input)?;
    Ok(AttributeLayer { name, attributes })
}

fn write_relation(out: &mut impl Write, rel: &Relation) -> Result<()> {
    write_string_id(out, rel.name)?;
    write_feature_id(out, &rel.target)?;
    write_opt_address(out, rel.source_validity)?;
    write_opt_address(out, rel.target_validity)?;
    write_opt_address(out, rel.source_data)?;
    Ok(())
}

fn read_relation(input: &mut impl Read) -> Result<Relation> {
    let name = read_string_id(input)?;
    let target = read_feature_id(input)?;
    let source_validity = read_opt_address(input)?;
    let target_validity = read_opt_address(input)?;
    let source_data = read_opt_address(input)?;
    Ok(Relation {
        name,
        target,
        source_validity,
        target_validity,
        source_data,
    })
}

fn write_point3(out: &mut impl Write, p: (f64, f64, f64)) -> Result<()> {
    out.write_all(&p.0.to_bits().to_le_bytes())?;
    out.write_all(&p.1.to_bits().to_le_bytes())?;
    out.write_all(&p.2.to_bits().to_le_bytes())?;
    Ok(())
}

fn read_point3(input: &mut impl Read) -> Result<(f64, f64, f64)> {
    let mut read_f64 = || -> Result<f64> {
        let mut b = [0u8; 8];
        input.read_exact(&mut b)?;
        Ok(f64::from_bits(u64::from_le_bytes(b)))
    };
    Ok((read_f64()?, read_f64()?, read_f64()?))
}

fn write_point_buffer(out: &mut impl Write, buf: &PointBufferRow) -> Result<()> {
    match buf.offset {
        Some(p) => {
            out.write_all(&[1u8])?;
            write_point3(out, p)?;
        }
        None => out.write_all(&[0u8])?,
    }
    write_count(out, buf.deltas.len())?;
    for d in &buf.deltas {
        out.write_all(&d.0.to_bits().to_le_bytes())?;
        out.write_all(&d.1.to_bits().to_le_bytes())?;
        out.write_all(&d.2.to_bits().to_le_bytes())?;
    }
    Ok(())
}

fn read_point_buffer(input: &mut impl Read) -> Result<PointBufferRow> {
    let mut flag = [0u8; 1];
    input.read_exact(&mut flag)?;
    let offset = if flag[0] != 0 { Some(read_point3(input)?) } else { None };
    let n = read_count(input)?;
    let mut read_f32 = |input: &mut dyn Read| -> Result<f32> {
        let mut b = [0u8; 4];
        input.read_exact(&mut b)?;
        Ok(f32::from_bits(u32::from_le_bytes(b)))
    };
    let mut deltas = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let x = read_f32(input)?;
        let y = read_f32(input)?;
        let z = read_f32(input)?;
        deltas.push((x, y, z));
    }
    Ok(PointBufferRow { offset, deltas })
}

fn write_geometry_type(out: &mut impl Write, t: GeometryType) -> Result<()> {
    let tag: u8 = match t {
        GeometryType::Points => 0,
        GeometryType::Line => 1,
        GeometryType::Polygon => 2,
        GeometryType::Mesh => 3,
    };
    out.write_all(&[tag])?;
    Ok(())
}

fn read_geometry_type(input: &mut impl Read) -> Result<GeometryType> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;
    Ok(match tag[0] {
        0 => GeometryType::Points,
        1 => GeometryType::Line,
        2 => GeometryType::Polygon,
        3 => GeometryType::Mesh,
        other => return Err(Error::Protocol(format!("unknown geometry type tag {other}"))),
    })
}

fn write_geometry_row(out: &mut impl Write, row: &GeometryRow) -> Result<()> {
    write_geometry_type(out, row.geometry_type)?;
    match &row.buffer {
        Some(buf) => {
            out.write_all(&[1u8])?;
            write_point_buffer(out, buf)?;
        }
        None => out.write_all(&[0u8])?,
    }
    match &row.view {
        Some(view) => {
            out.write_all(&[1u8])?;
            write_address(out, view.base)?;
            out.write_all(&(view.offset as u32).to_le_bytes())?;
            out.write_all(&(view.size as u32).to_le_bytes())?;
            match view.type_override {
                Some(t) => {
                    out.write_all(&[1u8])?;
                    write_geometry_type(out, t)?;
                }
                None => out.write_all(&[0u8])?,
            }
        }
        None => out.write_all(&[0u8])?,
    }
    write_opt_address(out, row.polygon)?;
    match row.name {
        Some(id) => {
            out.write_all(&[1u8])?;
            write_string_id(out, id)?;
        }
        None => out.write_all(&[0u8])?,
    }
    write_opt_address(out, row.source_data)?;
    Ok(())
}

fn read_geometry_row(input: &mut impl Read) -> Result<GeometryRow> {
    let geometry_type = read_geometry_type(input)?;
    let mut flag = [0u8; 1];
    input.read_exact(&mut flag)?;
    let buffer = if flag[0] != 0 { Some(read_point_buffer(input)?) } else { None };
    input.read_exact(&mut flag)?;
    let view = if flag[0] != 0 {
        let base = read_address(input)?;
        let mut u = [0u8; 4];
        input.read_exact(&mut u)?;
        let offset = u32::from_le_bytes(u) as usize;
        input.read_exact(&mut u)?;
        let size = u32::from_le_bytes(u) as usize;
        input.read_exact(&mut flag)?;
        let type_override = if flag[0] != 0 { Some(read_geometry_type(input)?) } else { None };
        Some(GeometryView {
            base,
            offset,
            size,
            type_override,
        })
    } else {
        None
    };
    let polygon = read_opt_address(input)?;
    input.read_exact(&mut flag)?;
    let name = if flag[0] != 0 { Some(read_string_id(input)?) } else { None };
    let source_data = read_opt_address(input)?;
    Ok(GeometryRow {
        geometry_type,
        buffer,
        view,
        polygon,
        name,
        source_data,
    })
}

fn write_linear_ring(out: &mut impl Write, ring: &LinearRingRow) -> Result<()> {
    write_address(out, ring.buffer)?;
    out.write_all(&[ring.stored_clockwise as u8])?;
    Ok(())
}

fn read_linear_ring(input: &mut impl Read) -> Result<LinearRingRow> {
    let buffer = read_address(input)?;
    let mut flag = [0u8; 1];
    input.read_exact(&mut flag)?;
    Ok(LinearRingRow {
        buffer,
        stored_clockwise: flag[0] != 0,
    })
}

fn write_source_data_address(out: &mut impl Write, addr: &SourceDataAddress) -> Result<()> {
    match addr {
        SourceDataAddress::Text(s) => {
            out.write_all(&[0u8])?;
            write_string(out, s)?;
        }
        SourceDataAddress::Binary(v) => {
            out.write_all(&[1u8])?;
            out.write_all(&v.to_le_bytes())?;
        }
    }
    Ok(())
}

fn read_source_data_address(input: &mut impl Read) -> Result<SourceDataAddress> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;
    Ok(match tag[0] {
        0 => SourceDataAddress::Text(read_string(input)?),
        1 => {
            let mut b = [0u8; 8];
            input.read_exact(&mut b)?;
            SourceDataAddress::Binary(u64::from_le_bytes(b))
        }
        other => return Err(Error::Protocol(format!("unknown source data address tag {other}"))),
    })
}

fn write_source_data_references(out: &mut impl Write, items: &[SourceDataReferenceItem]) -> Result<()> {
    write_count(out, items.len())?;
    for item in items {
        write_source_data_address(out, &item.address)?;
        write_string_id(out, item.qualifier)?;
    }
    Ok(())
}

fn read_source_data_references(input: &mut impl Read) -> Result<Vec<SourceDataReferenceItem>> {
    let n = read_count(input)?;
    let mut items = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let address = read_source_data_address(input)?;
        let qualifier = read_string_id(input)?;
        items.push(SourceDataReferenceItem { address, qualifier });
    }
    Ok(items)
}

fn write_offset_type(out: &mut impl Write, t: OffsetType) -> Result<()> {
    let tag: u8 = match t {
        OffsetType::GeoPosition => 0,
        OffsetType::BufferIndex => 1,
        OffsetType::RelativeLength => 2,
        OffsetType::MetricLength => 3,
    };
    out.write_all(&[tag])?;
    Ok(())
}

fn read_offset_type(input: &mut impl Read) -> Result<OffsetType> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;
    Ok(match tag[0] {
        0 => OffsetType::GeoPosition,
        1 => OffsetType::BufferIndex,
        2 => OffsetType::RelativeLength,
        3 => OffsetType::MetricLength,
        other => return Err(Error::Protocol(format!("unknown offset type tag {other}"))),
    })
}

fn write_offset_value(out: &mut impl Write, v: &OffsetValue) -> Result<()> {
    match v {
        OffsetValue::GeoPosition(a, b, c) => {
            out.write_all(&[0u8])?;
            write_point3(out, (*a, *b, *c))?;
        }
        OffsetValue::BufferIndex(i) => {
            out.write_all(&[1u8])?;
            out.write_all(&i.to_le_bytes())?;
        }
        OffsetValue::RelativeLength(f) => {
            out.write_all(&[2u8])?;
            out.write_all(&f.to_bits().to_le_bytes())?;
        }
        OffsetValue::MetricLength(f) => {
            out.write_all(&[3u8])?;
            out.write_all(&f.to_bits().to_le_bytes())?;
        }
    }
    Ok(())
}

fn read_offset_value(input: &mut impl Read) -> Result<OffsetValue> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;
    Ok(match tag[0] {
        0 => {
            let (a, b, c) = read_point3(input)?;
            OffsetValue::GeoPosition(a, b, c)
        }
        1 => {
            let mut b = [0u8; 4];
            input.read_exact(&mut b)?;
            OffsetValue::BufferIndex(u32::from_le_bytes(b))
        }
        2 => {
            let mut b = [0u8; 8];
            input.read_exact(&mut b)?;
            OffsetValue::RelativeLength(f64::from_bits(u64::from_le_bytes(b)))
        }
        3 => {
            let mut b = [0u8; 8];
            input.read_exact(&mut b)?;
            OffsetValue::MetricLength(f64::from_bits(u64::from_le_bytes(b)))
        }
        other => return Err(Error::Protocol(format!("unknown offset value tag {other}"))),
    })
}

fn write_geometry_ref(out: &mut impl Write, r: &GeometryRef) -> Result<()> {
    match r {
        GeometryRef::Address(a) => {
            out.write_all(&[0u8])?;
            write_address(out, *a)?;
        }
        GeometryRef::Name(id) => {
            out.write_all(&[1u8])?;
            write_string_id(out, *id)?;
        }
    }
    Ok(())
}

fn read_geometry_ref(input: &mut impl Read) -> Result<GeometryRef> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;
    Ok(match tag[0] {
        0 => GeometryRef::Address(read_address(input)?),
        1 => GeometryRef::Name(read_string_id(input)?),
        other => return Err(Error::Protocol(format!("unknown geometry ref tag {other}"))),
    })
}

fn write_validity(out: &mut impl Write, v: &Validity) -> Result<()> {
    match &v.shape {
        ValidityShape::None => out.write_all(&[0u8])?,
        ValidityShape::SimpleGeometry(addr) => {
            out.write_all(&[1u8])?;
            write_address(out, *addr)?;
        }
        ValidityShape::OffsetPoint {
            geometry,
            offset_type,
            offset,
        } => {
            out.write_all(&[2u8])?;
            write_geometry_ref(out, geometry)?;
            write_offset_type(out, *offset_type)?;
            write_offset_value(out, offset)?;
        }
        ValidityShape::OffsetRange {
            geometry,
            offset_type,
            start,
            end,
        } => {
            out.write_all(&[3u8])?;
            write_geometry_ref(out, geometry)?;
            write_offset_type(out, *offset_type)?;
            write_offset_value(out, start)?;
            write_offset_value(out, end)?;
        }
    }
    write_direction(out, v.direction)?;
    Ok(())
}

fn read_validity(input: &mut impl Read) -> Result<Validity> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;
    let shape = match tag[0] {
        0 => ValidityShape::None,
        1 => ValidityShape::SimpleGeometry(read_address(input)?),
        2 => ValidityShape::OffsetPoint {
            geometry: read_geometry_ref(input)?,
            offset_type: read_offset_type(input)?,
            offset: read_offset_value(input)?,
        },
        3 => ValidityShape::OffsetRange {
            geometry: read_geometry_ref(input)?,
            offset_type: read_offset_type(input)?,
            start: read_offset_value(input)?,
            end: read_offset_value(input)?,
        },
        other => return Err(Error::Protocol(format!("unknown validity shape tag {other}"))),
    };
    let direction = read_direction(input)?;
    Ok(Validity { shape, direction })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn int_object(v: i64) -> ObjectRow {
        ObjectRow(vec![ObjectEntry {
            key: 0,
            value: NodeValue::Int64(v),
        }])
    }

    /// §8: "for every `tile` and every node address `a` resolved inside it:
    /// `resolve(a)` returns the same node on every call" — across column
    /// growth spanning multiple pages (page size is 4096), earlier
    /// addresses must keep resolving to their original row.
    #[test]
    fn addresses_remain_valid_across_segment_growth() {
        let mut pool = ModelPool::new();
        let mut addrs = Vec::new();
        for i in 0..9000i64 {
            addrs.push(pool.new_object(int_object(i)));
        }
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(pool.get_object(*addr).unwrap(), &int_object(i as i64));
        }
    }

    #[test]
    fn resolve_is_stable_and_side_effect_free() {
        let mut pool = ModelPool::new();
        let addr = pool.new_object(int_object(42));
        let first = pool.resolve(addr).unwrap();
        let second = pool.resolve(addr).unwrap();
        match (first, second) {
            (ResolvedNode::Object(a), ResolvedNode::Object(b)) => assert_eq!(a, b),
            _ => panic!("expected object nodes"),
        }
    }

    #[test]
    fn dangling_address_is_a_contract_error() {
        let pool = ModelPool::new();
        let bogus = NodeAddress::new(ColumnId::Object, 0);
        assert!(matches!(pool.get_object(bogus), Err(Error::Contract(_))));
    }

    #[test]
    fn write_read_round_trips_mixed_columns() {
        let mut pool = ModelPool::new();
        let geom = pool.new_geometry(GeometryType::Line);
        pool.get_geometry_mut(geom).unwrap();
        let obj_addr = pool.new_object(int_object(7));
        let arr_addr = pool.new_array(ArrayRow(vec![NodeValue::Int64(1), NodeValue::Bool(true), NodeValue::Null]));

        let mut buf = Vec::new();
        pool.write(&mut buf).unwrap();

        let mut cursor = Cursor::new(buf);
        let read_back = ModelPool::read(&mut cursor).unwrap();

        assert_eq!(read_back.get_object(obj_addr).unwrap(), &int_object(7));
        assert_eq!(
            read_back.get_array(arr_addr).unwrap(),
            &ArrayRow(vec![NodeValue::Int64(1), NodeValue::Bool(true), NodeValue::Null])
        );
        assert_eq!(read_back.column_len(ColumnId::Geometry), pool.column_len(ColumnId::Geometry));
    }
}
