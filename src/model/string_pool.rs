use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io::{Read, Write};

/// A small integer id (<=16 bits) referring to an interned string.
pub type StringId = u16;

/// Reserved field-name ids, grounded on `original_source/libs/model/include/
/// mapget/model/stringpool.h`'s `StaticFieldIds` enum. These are returned by
/// `intern` for their names without ever being written into a pool's entry
/// list.
const STATIC_FIELD_NAMES: &[&str] = &[
    "id",
    "typeId",
    "geometry",
    "coordinates",
    "lon",
    "lat",
    "elevation",
    "properties",
    "layer",
    "relations",
    "direction",
    "validity",
    "name",
    "target",
    "sourceValidity",
    "targetValidity",
    "_sourceData",
    "mapId",
    "layerId",
    "geometries",
    "type",
    "offsetType",
    "geometryName",
    "address",
    "qualifier",
    "start",
    "end",
    "point",
    "featureId",
];

/// An ordered, append-only dictionary mapping `StringId` to interned
/// strings, scoped to exactly one source node. Lookup is case-insensitive;
/// storage is case-preserving.
#[derive(Clone, Debug)]
pub struct StringPool {
    node_id: String,
    entries: Vec<String>,
    by_lower: HashMap<String, StringId>,
}

impl StringPool {
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        let mut by_lower = HashMap::new();
        for (i, name) in STATIC_FIELD_NAMES.iter().enumerate() {
            by_lower.insert(name.to_lowercase(), i as StringId);
        }
        Self {
            node_id: node_id.into(),
            entries: Vec::new(),
            by_lower,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Idempotent: returns the existing id for a case-insensitive match, or
    /// appends a new entry preserving the given case.
    pub fn intern(&mut self, value: &str) -> StringId {
        let lower = value.to_lowercase();
        if let Some(&id) = self.by_lower.get(&lower) {
            return id;
        }
        let id = (STATIC_FIELD_NAMES.len() + self.entries.len()) as StringId;
        self.entries.push(value.to_string());
        self.by_lower.insert(lower, id);
        id
    }

    /// Case-insensitive lookup that never inserts, used by query evaluation
    /// to resolve a field name to a `StringId` without mutating the pool.
    #[must_use]
    pub fn find(&self, value: &str) -> Option<StringId> {
        self.by_lower.get(&value.to_lowercase()).copied()
    }

    #[must_use]
    pub fn resolve(&self, id: StringId) -> Option<&str> {
        let statics = STATIC_FIELD_NAMES.len() as StringId;
        if id < statics {
            return Some(STATIC_FIELD_NAMES[id as usize]);
        }
        self.entries.get((id - statics) as usize).map(String::as_str)
    }

    #[must_use]
    pub fn highest(&self) -> StringId {
        (STATIC_FIELD_NAMES.len() + self.entries.len()) as StringId
    }

    /// Writes the node id length-prefixed, then all entries with
    /// `id >= from_offset` in ascending order.
    pub fn write(&self, out: &mut impl Write, from_offset: StringId) -> Result<()> {
        write_string(out, &self.node_id)?;
        let statics = STATIC_FIELD_NAMES.len() as StringId;
        let start = from_offset.max(statics);
        let count = self.highest().saturating_sub(start);
        out.write_all(&(count as u32).to_le_bytes())?;
        for id in start..self.highest() {
            let s = self.entries[(id - statics) as usize].clone();
            out.write_all(&id.to_le_bytes())?;
            write_string(out, &s)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn read_node_id(input: &mut impl Read) -> Result<String> {
        read_string(input)
    }

    /// Parses a pool delta and merges it. An id already present must keep
    /// its existing string: re-asserting the same string is a no-op,
    /// asserting a different one is an integrity error.
    pub fn read(&mut self, input: &mut impl Read) -> Result<()> {
        let mut count_buf = [0u8; 4];
        input.read_exact(&mut count_buf)?;
        let count = u32::from_le_bytes(count_buf);
        for _ in 0..count {
            let mut id_buf = [0u8; 2];
            input.read_exact(&mut id_buf)?;
            let id = u16::from_le_bytes(id_buf);
            let s = read_string(input)?;
            self.merge_entry(id, s)?;
        }
        Ok(())
    }

    fn merge_entry(&mut self, id: StringId, value: String) -> Result<()> {
        let statics = STATIC_FIELD_NAMES.len() as StringId;
        if id < statics {
            return Ok(());
        }
        let idx = (id - statics) as usize;
        if idx < self.entries.len() {
            if self.entries[idx] != value {
                return Err(Error::StringPoolConflict { id });
            }
            return Ok(());
        }
        if idx != self.entries.len() {
            return Err(Error::Protocol(format!(
                "string pool delta out of order: expected id {}, got {}",
                self.highest(),
                id
            )));
        }
        self.by_lower.insert(value.to_lowercase(), id);
        self.entries.push(value);
        Ok(())
    }
}

pub(crate) fn write_string(out: &mut impl Write, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    out.write_all(&(bytes.len() as u32).to_le_bytes())?;
    out.write_all(bytes)?;
    Ok(())
}

pub(crate) fn read_string(input: &mut impl Read) -> Result<String> {
    let mut len_buf = [0u8; 4];
    input.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| Error::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_fields_resolve_without_insertion() {
        let mut pool = StringPool::new("node-a");
        let id = pool.intern("typeId");
        assert_eq!(id, 1);
        assert_eq!(pool.resolve(1), Some("typeId"));
        assert_eq!(pool.highest(), STATIC_FIELD_NAMES.len() as StringId);
    }

    #[test]
    fn intern_is_case_insensitive_and_case_preserving() {
        let mut pool = StringPool::new("node-a");
        let id1 = pool.intern("WayLayer");
        let id2 = pool.intern("waylayer");
        assert_eq!(id1, id2);
        assert_eq!(pool.resolve(id1), Some("WayLayer"));
    }

    #[test]
    fn write_then_read_round_trips_delta() {
        let mut writer_pool = StringPool::new("node-a");
        let before = writer_pool.highest();
        writer_pool.intern("new_shiny_attr_name");

        let mut buf = Vec::new();
        writer_pool.write(&mut buf, before).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let node_id = StringPool::read_node_id(&mut cursor).unwrap();
        assert_eq!(node_id, "node-a");

        let mut reader_pool = StringPool::new("node-a");
        reader_pool.read(&mut cursor).unwrap();
        assert_eq!(reader_pool.resolve(before), Some("new_shiny_attr_name"));
    }

    #[test]
    fn delta_idempotence() {
        let mut pool = StringPool::new("node-a");
        let before = pool.highest();
        pool.intern("again");
        let mut buf = Vec::new();
        pool.write(&mut buf, before).unwrap();

        let mut target = StringPool::new("node-a");
        let mut cursor = std::io::Cursor::new(buf.clone());
        StringPool::read_node_id(&mut cursor).unwrap();
        target.read(&mut cursor).unwrap();
        let snapshot = target.entries.clone();

        let mut cursor2 = std::io::Cursor::new(buf);
        StringPool::read_node_id(&mut cursor2).unwrap();
        target.read(&mut cursor2).unwrap();
        assert_eq!(target.entries, snapshot);
    }

    #[test]
    fn conflicting_string_for_same_id_is_an_error() {
        let mut a = StringPool::new("node-a");
        a.intern("foo");
        let mut buf = Vec::new();
        a.write(&mut buf, STATIC_FIELD_NAMES.len() as StringId).unwrap();

        let mut b = StringPool::new("node-a");
        b.intern("bar");

        let mut cursor = std::io::Cursor::new(buf);
        StringPool::read_node_id(&mut cursor).unwrap();
        let err = b.read(&mut cursor).unwrap_err();
        assert!(matches!(err, Error::StringPoolConflict { .. }));
    }
}
