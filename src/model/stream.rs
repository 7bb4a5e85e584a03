//! Version-tagged framing that interleaves string-pool deltas and tile
//! blobs (§4.5). Grounded on `original_source/libs/model/include/mapget/
//! model/stream.h` (`TileLayerStream::{Reader,Writer}`, `MessageType`,
//! `CurrentProtocolVersion`).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::model::info::{LayerInfo, Version};
use crate::model::layer::TileFeatureLayer;
use crate::model::source_data::TileSourceDataLayer;
use crate::model::string_pool::{StringId, StringPool};

/// The protocol version this implementation writes and requires
/// compatibility with on read (`(major, minor)` must match; `patch` may
/// differ), mirroring `TileLayerStream::CurrentProtocolVersion`.
pub const PROTOCOL_VERSION: Version = Version {
    major: 0,
    minor: 1,
    patch: 1,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    StringPool = 1,
    TileFeatureLayer = 2,
    TileSourceDataLayer = 3,
    EndOfStream = 128,
}

impl MessageType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::StringPool),
            2 => Ok(Self::TileFeatureLayer),
            3 => Ok(Self::TileSourceDataLayer),
            128 => Ok(Self::EndOfStream),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

fn write_version(out: &mut impl Write, v: &Version) -> Result<()> {
    out.write_all(&v.major.to_le_bytes())?;
    out.write_all(&v.minor.to_le_bytes())?;
    out.write_all(&v.patch.to_le_bytes())?;
    Ok(())
}

fn read_version(input: &mut impl Read) -> Result<Version> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf)?;
    let major = u16::from_le_bytes(buf);
    input.read_exact(&mut buf)?;
    let minor = u16::from_le_bytes(buf);
    input.read_exact(&mut buf)?;
    let patch = u16::from_le_bytes(buf);
    Ok(Version::new(major, minor, patch))
}

fn write_frame(out: &mut impl Write, msg_type: MessageType, payload: &[u8]) -> Result<()> {
    write_version(out, &PROTOCOL_VERSION)?;
    out.write_all(&[msg_type as u8])?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(payload)?;
    Ok(())
}

/// Writes a single `StringPool` frame carrying entries `>= from_offset`.
pub fn write_string_pool_delta(out: &mut impl Write, pool: &StringPool, from_offset: StringId) -> Result<()> {
    let mut payload = Vec::new();
    pool.write(&mut payload, from_offset)?;
    write_frame(out, MessageType::StringPool, &payload)
}

/// Writes a single `TileFeatureLayer` frame (header + model pool), with no
/// accompanying string-pool message.
pub fn write_tile_layer(out: &mut impl Write, layer: &TileFeatureLayer) -> Result<()> {
    let mut payload = Vec::new();
    layer.write(&mut payload)?;
    write_frame(out, MessageType::TileFeatureLayer, &payload)
}

/// Writes a single `TileSourceDataLayer` frame.
pub fn write_source_data_layer(out: &mut impl Write, layer: &TileSourceDataLayer) -> Result<()> {
    let mut payload = Vec::new();
    layer.write(&mut payload)?;
    write_frame(out, MessageType::TileSourceDataLayer, &payload)
}

pub fn write_end_of_stream(out: &mut impl Write) -> Result<()> {
    write_frame(out, MessageType::EndOfStream, &[])
}

/// Implements the writer policy from §4.5: before any layer write, emits a
/// `StringPool` message carrying only the new entries since the last send
/// for that node id (or the full pool, when `differential` is false — used
/// when writing to a cache backing store, per §4.6).
pub struct StreamWriter {
    offsets: HashMap<String, StringId>,
    differential: bool,
}

impl StreamWriter {
    #[must_use]
    pub fn new(differential: bool) -> Self {
        Self {
            offsets: HashMap::new(),
            differential,
        }
    }

    #[must_use]
    pub fn with_offsets(offsets: HashMap<String, StringId>, differential: bool) -> Self {
        Self { offsets, differential }
    }

    #[must_use]
    pub fn offsets(&self) -> &HashMap<String, StringId> {
        &self.offsets
    }

    pub fn write_layer(&mut self, out: &mut impl Write, layer: &TileFeatureLayer) -> Result<()> {
        self.write_pool_delta_if_grown(out, &layer.string_pool)?;
        write_tile_layer(out, layer)
    }

    pub fn write_source_data_layer(&mut self, out: &mut impl Write, layer: &TileSourceDataLayer) -> Result<()> {
        self.write_pool_delta_if_grown(out, &layer.string_pool)?;
        write_source_data_layer(out, layer)
    }

    fn write_pool_delta_if_grown(&mut self, out: &mut impl Write, string_pool: &Arc<RwLock<StringPool>>) -> Result<()> {
        let pool = string_pool.read().expect("string pool lock poisoned");
        let node_id = pool.node_id().to_string();
        let highest = pool.highest();
        let sent = self.offsets.get(&node_id).copied().unwrap_or(0);
        if highest > sent {
            let from = if self.differential { sent } else { 0 };
            write_string_pool_delta(out, &pool, from)?;
            self.offsets.insert(node_id, highest);
        }
        Ok(())
    }

    pub fn send_end_of_stream(&self, out: &mut impl Write) -> Result<()> {
        write_end_of_stream(out)
    }
}

/// Callbacks a `read_stream` caller implements to resolve layer info and
/// per-node string pools, and to receive parsed layers.
pub trait StreamReaderCallbacks {
    fn resolve_layer_info(&self, map_id: &str, layer_id: &str) -> Result<Arc<LayerInfo>>;
    fn string_pool(&mut self, node_id: &str) -> Arc<RwLock<StringPool>>;
    fn on_tile_layer(&mut self, layer: TileFeatureLayer);
    fn on_source_data_layer(&mut self, layer: TileSourceDataLayer) {
        let _ = layer;
    }
}

/// Reads frames until an `EndOfStream` message or the input is exhausted.
/// Reads exactly `length` bytes per frame before parsing, per §4.5's reader
/// policy; rejects an incompatible `(major, minor)` protocol version.
pub fn read_stream(input: &mut impl Read, callbacks: &mut impl StreamReaderCallbacks) -> Result<()> {
    loop {
        let mut version_buf = [0u8; 2];
        match input.read(&mut version_buf) {
            Ok(0) => return Ok(()),
            Ok(n) if n < 2 => {
                input.read_exact(&mut version_buf[n..])?;
            }
            Ok(_) => {}
            Err(e) => return Err(Error::Io(e)),
        }
        let major = u16::from_le_bytes(version_buf);
        let mut buf = [0u8; 2];
        input.read_exact(&mut buf)?;
        let minor = u16::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        let patch = u16::from_le_bytes(buf);
        let version = Version::new(major, minor, patch);
        if !version.is_compatible(&PROTOCOL_VERSION) {
            return Err(Error::IncompatibleVersion {
                peer_major: version.major,
                peer_minor: version.minor,
                local_major: PROTOCOL_VERSION.major,
                local_minor: PROTOCOL_VERSION.minor,
            });
        }

        let mut type_buf = [0u8; 1];
        input.read_exact(&mut type_buf)?;
        let msg_type = MessageType::from_u8(type_buf[0])?;

        let mut len_buf = [0u8; 4];
        input.read_exact(&mut len_buf)?;
        let length = u32::from_le_bytes(len_buf) as usize;

        if msg_type == MessageType::EndOfStream {
            debug_assert_eq!(length, 0);
            return Ok(());
        }

        let mut payload = vec![0u8; length];
        input.read_exact(&mut payload)?;
        let mut cursor = std::io::Cursor::new(payload);

        match msg_type {
            MessageType::StringPool => {
                let node_id = StringPool::read_node_id(&mut cursor)?;
                let pool_arc = callbacks.string_pool(&node_id);
                pool_arc.write().expect("string pool lock poisoned").read(&mut cursor)?;
            }
            MessageType::TileFeatureLayer => {
                let peek = cursor.get_ref().clone();
                let mut peek_cursor = std::io::Cursor::new(peek);
                let header = crate::model::layer::TileHeader::read(&mut peek_cursor)?;
                let layer_info = callbacks.resolve_layer_info(&header.map_id, &header.layer_id)?;
                let pool = callbacks.string_pool(&header.node_id);
                let layer = TileFeatureLayer::read(&mut cursor, layer_info, pool)?;
                callbacks.on_tile_layer(layer);
            }
            MessageType::TileSourceDataLayer => {
                let peek = cursor.get_ref().clone();
                let mut peek_cursor = std::io::Cursor::new(peek);
                let header = crate::model::layer::TileHeader::read(&mut peek_cursor)?;
                let layer_info = callbacks.resolve_layer_info(&header.map_id, &header.layer_id)?;
                let pool = callbacks.string_pool(&header.node_id);
                let layer = TileSourceDataLayer::read(&mut cursor, layer_info, pool)?;
                callbacks.on_source_data_layer(layer);
            }
            MessageType::EndOfStream => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::feature_id::{IdPartValue, NamedIdPart};
    use crate::model::info::{FeatureTypeInfo, IdComposition, IdPart, IdPartDataType, LayerType};
    use crate::model::TileId;
    use std::collections::HashMap as StdHashMap;

    fn way_layer_info() -> Arc<LayerInfo> {
        Arc::new(LayerInfo {
            layer_id: "WayLayer".to_string(),
            layer_type: LayerType::Features,
            feature_types: vec![FeatureTypeInfo {
                name: "Way".to_string(),
                unique_id_compositions: vec![IdComposition {
                    parts: vec![IdPart {
                        name: "wayId".to_string(),
                        datatype: IdPartDataType::I64,
                        is_optional: false,
                    }],
                }],
            }],
            zoom_levels: vec![],
            coverage: None,
            can_read: true,
            can_write: true,
            version: Version::new(1, 0, 0),
        })
    }

    struct TestCallbacks {
        layer_info: Arc<LayerInfo>,
        pools: StdHashMap<String, Arc<RwLock<StringPool>>>,
        layers: Vec<TileFeatureLayer>,
    }

    impl StreamReaderCallbacks for TestCallbacks {
        fn resolve_layer_info(&self, _map_id: &str, _layer_id: &str) -> Result<Arc<LayerInfo>> {
            Ok(self.layer_info.clone())
        }

        fn string_pool(&mut self, node_id: &str) -> Arc<RwLock<StringPool>> {
            self.pools
                .entry(node_id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(StringPool::new(node_id))))
                .clone()
        }

        fn on_tile_layer(&mut self, layer: TileFeatureLayer) {
            self.layers.push(layer);
        }
    }

    #[test]
    fn scenario_2_stream_delta_three_writes() {
        let layer_info = way_layer_info();
        let pool = Arc::new(RwLock::new(StringPool::new("node-a")));
        let mut layer = TileFeatureLayer::new(TileId::new(0, 0, 0), "node-a", "Tropico", layer_info.clone(), pool.clone());
        layer
            .new_feature(
                "Way",
                vec![NamedIdPart {
                    name: "wayId".to_string(),
                    value: IdPartValue::I64(1),
                    is_optional: false,
                }],
            )
            .unwrap();

        let mut writer = StreamWriter::new(true);
        let mut wire = Vec::new();

        // First write: the feature's "Way" type id was already interned into
        // the pool before this call, so highest() > sent(0) and a delta
        // frame precedes the layer frame.
        writer.write_layer(&mut wire, &layer).unwrap();
        let first_write_frames = count_frames(&wire);

        // Add a new attribute name, bumping the pool's highest id: expect a
        // delta frame ahead of the layer frame on this write, and none on
        // the write after, since the pool hasn't grown further.
        layer.new_attribute("new_shiny_attr_name");

        wire.clear();
        writer.write_layer(&mut wire, &layer).unwrap();
        let second_write_frames = count_frames(&wire);
        assert_eq!(second_write_frames, 2, "string pool grew, so a delta frame precedes the layer frame");

        wire.clear();
        writer.write_layer(&mut wire, &layer).unwrap();
        let third_write_frames = count_frames(&wire);
        assert_eq!(third_write_frames, 1, "pool unchanged since last send, only the layer frame is written");

        assert_eq!(first_write_frames, 2, "pool + layer frames for the first write");

        let mut callbacks = TestCallbacks {
            layer_info,
            pools: StdHashMap::new(),
            layers: Vec::new(),
        };
        let mut full_wire = Vec::new();
        let mut reader_writer = StreamWriter::new(true);
        reader_writer.write_layer(&mut full_wire, &layer).unwrap();
        read_stream(&mut std::io::Cursor::new(full_wire), &mut callbacks).unwrap();
        assert_eq!(callbacks.layers.len(), 1);
        assert_eq!(callbacks.layers[0].size(), layer.size());
    }

    fn count_frames(wire: &[u8]) -> usize {
        let mut cursor = std::io::Cursor::new(wire.to_vec());
        let mut count = 0;
        loop {
            let mut version_buf = [0u8; 6];
            if cursor.read_exact(&mut version_buf).is_err() {
                break;
            }
            let mut type_buf = [0u8; 1];
            cursor.read_exact(&mut type_buf).unwrap();
            let mut len_buf = [0u8; 4];
            cursor.read_exact(&mut len_buf).unwrap();
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            cursor.read_exact(&mut payload).unwrap();
            count += 1;
        }
        count
    }
}
