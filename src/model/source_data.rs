use crate::error::Result;
use crate::model::info::LayerInfo;
use crate::model::layer::TileHeader;
use crate::model::string_pool::{read_string, write_string, StringId, StringPool};
use crate::model::TileId;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::{Arc, RwLock};

/// An address into whatever provenance format a data source uses (e.g. a
/// byte offset into the upstream record it was decoded from), paired with a
/// qualifier naming what it points at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceDataReferenceItem {
    pub address: SourceDataAddress,
    pub qualifier: StringId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceDataAddress {
    Text(String),
    Binary(u64),
}

/// An analogous columnar tile variant for source-data-attributed tiles
/// (wire message type 3): it shares the same header and pool machinery as
/// `TileFeatureLayer`, but its root entries are source-data reference trees
/// rather than features. Grounded on `original_source/libs/model/include/
/// mapget/model/sourcedatalayer.h`.
#[derive(Clone, Debug)]
pub struct TileSourceDataLayer {
    pub header: TileHeader,
    pub layer_info: Arc<LayerInfo>,
    pub string_pool: Arc<RwLock<StringPool>>,
    pub items: Vec<SourceDataReferenceItem>,
}

impl TileSourceDataLayer {
    #[must_use]
    pub fn new(
        tile_id: TileId,
        node_id: impl Into<String>,
        map_id: impl Into<String>,
        layer_info: Arc<LayerInfo>,
        string_pool: Arc<RwLock<StringPool>>,
    ) -> Self {
        Self {
            header: TileHeader {
                map_id: map_id.into(),
                layer_id: layer_info.layer_id.clone(),
                map_version: layer_info.version,
                tile_id,
                node_id: node_id.into(),
                timestamp_us: 0,
                ttl_ms: None,
                info_json: serde_json::Value::Null,
            },
            layer_info,
            string_pool,
            items: Vec::new(),
        }
    }

    pub fn add_item(&mut self, address: SourceDataAddress, qualifier: &str) {
        let qualifier_id = self.string_pool.write().expect("string pool lock poisoned").intern(qualifier);
        self.items.push(SourceDataReferenceItem {
            address,
            qualifier: qualifier_id,
        });
    }

    /// Binary round-trip: the shared tile header followed by a flat list of
    /// source-data reference items.
    pub fn write(&self, out: &mut impl Write) -> Result<()> {
        self.header.write(out)?;
        out.write_all(&(self.items.len() as u32).to_le_bytes())?;
        for item in &self.items {
            write_source_data_item(out, item)?;
        }
        Ok(())
    }

    pub fn read(input: &mut impl Read, layer_info: Arc<LayerInfo>, string_pool: Arc<RwLock<StringPool>>) -> Result<Self> {
        let header = TileHeader::read(input)?;
        let mut count_buf = [0u8; 4];
        input.read_exact(&mut count_buf)?;
        let count = u32::from_le_bytes(count_buf);
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(read_source_data_item(input)?);
        }
        Ok(Self {
            header,
            layer_info,
            string_pool,
            items,
        })
    }
}

fn write_source_data_item(out: &mut impl Write, item: &SourceDataReferenceItem) -> Result<()> {
    out.write_all(&item.qualifier.to_le_bytes())?;
    match &item.address {
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

fn read_source_data_item(input: &mut impl Read) -> Result<SourceDataReferenceItem> {
    let mut id_buf = [0u8; 2];
    input.read_exact(&mut id_buf)?;
    let qualifier = StringId::from_le_bytes(id_buf);
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;
    let address = if tag[0] == 0 {
        SourceDataAddress::Text(read_string(input)?)
    } else {
        let mut buf = [0u8; 8];
        input.read_exact(&mut buf)?;
        SourceDataAddress::Binary(u64::from_le_bytes(buf))
    };
    Ok(SourceDataReferenceItem { address, qualifier })
}
