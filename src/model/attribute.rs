use crate::model::object::ObjectRow;
use crate::model::pool::NodeAddress;
use crate::model::string_pool::StringId;
use crate::model::validity::Direction;

/// A named, directional group of key-value fields, optionally valid only
/// over part of a geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: StringId,
    pub direction: Direction,
    pub validity: Option<NodeAddress>,
    pub fields: ObjectRow,
}

/// A named group of `Attribute`s (e.g. "properties", "speedLimits").
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeLayer {
    pub name: StringId,
    pub attributes: Vec<NodeAddress>,
}

/// A list of attribute layers belonging to one feature.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeLayerList(pub Vec<NodeAddress>);
