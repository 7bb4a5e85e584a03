//! `DataSource` wrapping an HTTP client (§4.7, §6's HTTP surface). Grounded
//! on spec's `/info`, `/tile`, `/locate` contract; multiple clients are
//! pooled up to `maxParallelJobs` and dispatched round-robin, mirroring
//! the worker-per-source binding in `service::scheduler`.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::blocking::Client;

use crate::error::{Error, Result};
use crate::model::{read_stream, DataSourceInfo, LayerInfo, StreamReaderCallbacks, StringPool, TileFeatureLayer};
use crate::service::datasource::DataSource;
use crate::service::locate::{LocateRequest, LocateResponse};

pub struct RemoteDataSource {
    base_url: String,
    clients: Vec<Client>,
    next_client: AtomicUsize,
    info: DataSourceInfo,
}

impl RemoteDataSource {
    /// Fetches `{base_url}/info` to discover the source's layers and
    /// `maxParallelJobs`, then builds a client pool of that size.
    pub fn connect(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        let client = build_client()?;
        let resp = client
            .get(format!("{base_url}/info"))
            .send()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let info: DataSourceInfo = resp.json().map_err(|e| Error::Transport(e.to_string()))?;

        let pool_size = info.max_parallel_jobs.max(1) as usize;
        let mut clients = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            clients.push(build_client()?);
        }

        Ok(Self {
            base_url,
            clients,
            next_client: AtomicUsize::new(0),
            info,
        })
    }

    fn next_client(&self) -> &Client {
        let i = self.next_client.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[i]
    }
}

fn build_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Transport(e.to_string()))
}

struct FillCallbacks {
    layer_info: Arc<LayerInfo>,
    pool: Arc<RwLock<StringPool>>,
    parsed: Vec<TileFeatureLayer>,
}

impl StreamReaderCallbacks for FillCallbacks {
    fn resolve_layer_info(&self, _map_id: &str, _layer_id: &str) -> Result<Arc<LayerInfo>> {
        Ok(self.layer_info.clone())
    }

    fn string_pool(&mut self, _node_id: &str) -> Arc<RwLock<StringPool>> {
        self.pool.clone()
    }

    fn on_tile_layer(&mut self, layer: TileFeatureLayer) {
        self.parsed.push(layer);
    }
}

impl DataSource for RemoteDataSource {
    fn info(&self) -> DataSourceInfo {
        self.info.clone()
    }

    fn fill(&self, tile: &mut TileFeatureLayer) -> Result<()> {
        let fields_offset = tile.string_pool.read().expect("string pool lock poisoned").highest();
        let url = format!(
            "{}/tile?layer={}&tileId={}&fieldsOffset={}&responseType=binary",
            self.base_url,
            tile.header.layer_id,
            tile.header.tile_id.value(),
            fields_offset
        );
        let resp = self.next_client().get(&url).send().map_err(|e| Error::Transport(e.to_string()))?;
        let bytes = resp.bytes().map_err(|e| Error::Transport(e.to_string()))?;

        let mut callbacks = FillCallbacks {
            layer_info: tile.layer_info.clone(),
            pool: tile.string_pool.clone(),
            parsed: Vec::new(),
        };
        read_stream(&mut Cursor::new(bytes.to_vec()), &mut callbacks)?;

        let mut memo = HashMap::new();
        for parsed in &callbacks.parsed {
            for i in 0..parsed.size() {
                let addr = parsed.feature_address(i)?;
                let feature = parsed.at(i)?;
                tile.clone_feature(parsed, addr, &feature.id.type_id, feature.id.parts.clone(), &mut memo)?;
            }
        }
        Ok(())
    }

    fn locate(&self, request: &LocateRequest) -> Result<Vec<LocateResponse>> {
        let resp = self
            .next_client()
            .post(format!("{}/locate", self.base_url))
            .json(request)
            .send()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let responses: Vec<LocateResponse> = resp.json().map_err(|e| Error::Transport(e.to_string()))?;
        Ok(responses)
    }

    fn is_authorized(&self, _headers: &HashMap<String, String>) -> bool {
        true
    }
}
