use crate::model::pool::NodeAddress;
use crate::model::string_pool::StringId;

/// The polymorphic value-type tag from §4.2: every node in the pool can be
/// read through this uniform shape. `TransientObject` is never stored in a
/// column; it tags values materialized on demand (feature property views,
/// query intermediates) rather than persisted rows.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(StringId),
    Array(NodeAddress),
    Object(NodeAddress),
    TransientObject(Vec<ObjectEntry>),
}

impl NodeValue {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeValue::Null => "null",
            NodeValue::Bool(_) => "bool",
            NodeValue::Int64(_) => "int64",
            NodeValue::Float64(_) => "float64",
            NodeValue::String(_) => "string",
            NodeValue::Array(_) => "array",
            NodeValue::Object(_) => "object",
            NodeValue::TransientObject(_) => "transient-object",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObjectEntry {
    pub key: StringId,
    pub value: NodeValue,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectRow(pub Vec<ObjectEntry>);

impl ObjectRow {
    pub fn get(&self, key: StringId) -> Option<&NodeValue> {
        self.0.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    pub fn set(&mut self, key: StringId, value: NodeValue) {
        if let Some(entry) = self.0.iter_mut().find(|e| e.key == key) {
            entry.value = value;
        } else {
            self.0.push(ObjectEntry { key, value });
        }
    }

    pub fn key_at(&self, i: usize) -> Option<StringId> {
        self.0.get(i).map(|e| e.key)
    }

    pub fn size(&self) -> usize {
        self.0.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayRow(pub Vec<NodeValue>);

impl ArrayRow {
    pub fn at(&self, i: usize) -> Option<&NodeValue> {
        self.0.get(i)
    }

    pub fn push(&mut self, value: NodeValue) {
        self.0.push(value);
    }

    pub fn size(&self) -> usize {
        self.0.len()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ScalarValue {
    Null,
    Bool(bool),
}
