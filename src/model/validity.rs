use crate::model::pool::NodeAddress;
use crate::model::string_pool::StringId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Empty,
    Positive,
    Negative,
    Both,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OffsetType {
    GeoPosition,
    BufferIndex,
    RelativeLength,
    MetricLength,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OffsetValue {
    GeoPosition(f64, f64, f64),
    BufferIndex(u32),
    RelativeLength(f64),
    MetricLength(f64),
}

/// Describes where on a geometry a relation or attribute applies: one of
/// four shapes from §3 (none, simple geometry, offset point, offset range).
#[derive(Clone, Debug, PartialEq)]
pub enum ValidityShape {
    None,
    SimpleGeometry(NodeAddress),
    OffsetPoint {
        geometry: GeometryRef,
        offset_type: OffsetType,
        offset: OffsetValue,
    },
    OffsetRange {
        geometry: GeometryRef,
        offset_type: OffsetType,
        start: OffsetValue,
        end: OffsetValue,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum GeometryRef {
    Address(NodeAddress),
    Name(StringId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Validity {
    pub shape: ValidityShape,
    pub direction: Direction,
}

impl Validity {
    #[must_use]
    pub fn none() -> Self {
        Self {
            shape: ValidityShape::None,
            direction: Direction::None,
        }
    }
}

/// A list of `Validity` nodes, addressable as one unit (the `MultiValidity`
/// used by relations and attribute layers).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MultiValidity(pub Vec<NodeAddress>);
