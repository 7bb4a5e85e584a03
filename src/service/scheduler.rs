//! Request queue, in-progress dedup and per-source worker threads (§4.8,
//! §5). Grounded on `original_source/libs/service/include/mapget/service/
//! service.h` + `src/service.cpp` (`Request`, `Service::Controller::nextJob`,
//! `Service::Worker::work`).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::Result;
use crate::model::{DataSourceInfo, MapTileKey, TileFeatureLayer, TileId};
use crate::service::cache::Cache;
use crate::service::datasource::DataSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Open,
    Done,
    Aborted,
    /// No registered data source can serve this request's map/layer.
    NoDataSource,
    /// The responsible data source's [`AuthGate`](crate::service::datasource::AuthGate)
    /// rejected the request's headers; no tiles were dispatched.
    Unauthorized,
}

struct RequestInner {
    status: RequestStatus,
    results_delivered: usize,
}

/// A client's request for some tiles of one map layer, with a callback
/// invoked once per delivered result, in the order the tiles were listed.
/// `tiles` must not be empty.
pub struct Request {
    pub map_id: String,
    pub layer_id: String,
    pub tiles: Vec<TileId>,
    pub headers: HashMap<String, String>,
    next_tile_index: AtomicUsize,
    on_result: Mutex<Box<dyn FnMut(TileFeatureLayer) + Send>>,
    on_done: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    inner: Mutex<RequestInner>,
    condvar: Condvar,
}

impl Request {
    #[must_use]
    pub fn new(
        map_id: impl Into<String>,
        layer_id: impl Into<String>,
        tiles: Vec<TileId>,
        on_result: impl FnMut(TileFeatureLayer) + Send + 'static,
    ) -> Arc<Self> {
        Self::with_headers(map_id, layer_id, tiles, HashMap::new(), on_result)
    }

    /// Like [`Request::new`], but carries HTTP-style headers so a
    /// [`DataSource::is_authorized`](crate::service::datasource::DataSource::is_authorized)
    /// gate can be consulted before any tile is dispatched (§7).
    #[must_use]
    pub fn with_headers(
        map_id: impl Into<String>,
        layer_id: impl Into<String>,
        tiles: Vec<TileId>,
        headers: HashMap<String, String>,
        on_result: impl FnMut(TileFeatureLayer) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            map_id: map_id.into(),
            layer_id: layer_id.into(),
            tiles,
            headers,
            next_tile_index: AtomicUsize::new(0),
            on_result: Mutex::new(Box::new(on_result)),
            on_done: Mutex::new(None),
            inner: Mutex::new(RequestInner {
                status: RequestStatus::Open,
                results_delivered: 0,
            }),
            condvar: Condvar::new(),
        })
    }

    /// Registers a callback fired once, when the request leaves `Open`.
    pub fn on_done(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_done.lock().expect("request lock poisoned") = Some(Box::new(callback));
    }

    #[must_use]
    pub fn status(&self) -> RequestStatus {
        self.inner.lock().expect("request lock poisoned").status
    }

    /// Blocks the calling thread until the request is no longer `Open`.
    pub fn wait(&self) {
        let mut inner = self.inner.lock().expect("request lock poisoned");
        while inner.status == RequestStatus::Open {
            inner = self.condvar.wait(inner).expect("request lock poisoned");
        }
    }

    fn notify_result(&self, layer: TileFeatureLayer) {
        (self.on_result.lock().expect("request lock poisoned"))(layer);
        let done = {
            let mut inner = self.inner.lock().expect("request lock poisoned");
            inner.results_delivered += 1;
            if inner.results_delivered == self.tiles.len() {
                inner.status = RequestStatus::Done;
                true
            } else {
                false
            }
        };
        if done {
            self.notify_status();
        }
    }

    fn set_status(&self, status: RequestStatus) {
        self.inner.lock().expect("request lock poisoned").status = status;
        self.notify_status();
    }

    fn notify_status(&self) {
        if let Some(callback) = self.on_done.lock().expect("request lock poisoned").take() {
            callback();
        }
        self.condvar.notify_all();
    }
}

struct ControllerState {
    requests: VecDeque<Arc<Request>>,
    jobs_in_progress: HashSet<MapTileKey>,
}

/// Owns the request queue and the in-progress set behind one mutex, as
/// both must be observed together to decide the next job for a worker.
struct Controller {
    cache: Arc<dyn Cache>,
    state: Mutex<ControllerState>,
    jobs_available: Condvar,
}

impl Controller {
    fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            state: Mutex::new(ControllerState {
                requests: VecDeque::new(),
                jobs_in_progress: HashSet::new(),
            }),
            jobs_available: Condvar::new(),
        }
    }

    fn add_request(&self, request: Arc<Request>) {
        if request.tiles.is_empty() {
            request.set_status(RequestStatus::Done);
            return;
        }
        self.state.lock().expect("controller lock poisoned").requests.push_back(request);
        self.jobs_available.notify_all();
    }

    fn abort_request(&self, request: &Arc<Request>) {
        let mut state = self.state.lock().expect("controller lock poisoned");
        state.requests.retain(|r| !Arc::ptr_eq(r, request));
        drop(state);
        request.set_status(RequestStatus::Aborted);
    }

    /// Serves every cached tile it can along the way, and returns the next
    /// tile a worker for `info` should actually fetch, or `None` if there is
    /// nothing left to do for this source right now. Caller must already
    /// hold `state`'s lock.
    fn next_job(&self, state: &mut ControllerState, info: &DataSourceInfo) -> Option<(MapTileKey, Arc<Request>)> {
        loop {
            let mut cached_tiles_served = false;
            let mut job = None;
            let len = state.requests.len();

            for idx in 0..len {
                let request = state.requests[idx].clone();
                let Some(layer_info) = info.get_layer(&request.layer_id) else {
                    continue;
                };
                if request.map_id != info.map_id {
                    continue;
                }

                let next_index = request.next_tile_index.load(Ordering::SeqCst);
                if next_index >= request.tiles.len() {
                    continue;
                }

                let tile_id = request.tiles[next_index];
                request.next_tile_index.fetch_add(1, Ordering::SeqCst);
                let key = MapTileKey::new(layer_info.layer_type, request.map_id.clone(), request.layer_id.clone(), tile_id);

                match self.cache.get_tile_layer(&key, info) {
                    Ok(Some(layer)) => {
                        log::debug!("serving cached tile {key}");
                        request.notify_result(layer);
                        cached_tiles_served = true;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("cache lookup for {key} failed: {e}");
                    }
                }

                if state.jobs_in_progress.contains(&key) {
                    // Someone else is already fetching this tile; wait for
                    // it to land in the cache and retry the same index.
                    log::debug!("delaying tile with job in progress: {key}");
                    request.next_tile_index.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }

                state.jobs_in_progress.insert(key.clone());
                log::debug!("working on tile {key}");
                job = Some((key, request.clone()));
                // Move this request to the end of the queue so others gain priority.
                state.requests.remove(idx);
                state.requests.push_back(request);
                break;
            }

            state
                .requests
                .retain(|r| r.next_tile_index.load(Ordering::SeqCst) < r.tiles.len());

            if job.is_some() || !cached_tiles_served {
                return job;
            }
        }
    }
}

struct Worker {
    should_terminate: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

fn spawn_worker(data_source: Arc<dyn DataSource>, info: DataSourceInfo, controller: Arc<Controller>) -> Worker {
    let should_terminate = Arc::new(AtomicBool::new(false));
    let thread = {
        let should_terminate = should_terminate.clone();
        std::thread::spawn(move || {
            while work(&data_source, &info, &controller, &should_terminate) {}
        })
    };
    Worker { should_terminate, thread }
}

/// Runs one iteration of the worker loop. Returns `false` once the worker
/// should stop.
fn work(data_source: &Arc<dyn DataSource>, info: &DataSourceInfo, controller: &Arc<Controller>, should_terminate: &AtomicBool) -> bool {
    let (key, request) = {
        let mut state = controller.state.lock().expect("controller lock poisoned");
        loop {
            if should_terminate.load(Ordering::Acquire) {
                return false;
            }
            if let Some(job) = controller.next_job(&mut state, info) {
                break job;
            }
            state = controller.jobs_available.wait(state).expect("controller lock poisoned");
        }
    };

    match data_source.get(&key, controller.cache.as_ref(), info) {
        Ok(layer) => {
            {
                let mut state = controller.state.lock().expect("controller lock poisoned");
                state.jobs_in_progress.remove(&key);
            }
            controller.jobs_available.notify_all();
            // The tile may already be cached for others; it is just not
            // delivered to a request that was aborted while in flight (§5).
            if request.status() != RequestStatus::Aborted {
                request.notify_result(layer);
            }
        }
        Err(e) => {
            log::error!("could not load tile {key}: {e}");
            let mut state = controller.state.lock().expect("controller lock poisoned");
            state.jobs_in_progress.remove(&key);
            drop(state);
            controller.jobs_available.notify_all();
        }
    }

    true
}

struct SourceEntry {
    info: DataSourceInfo,
    data_source: Arc<dyn DataSource>,
    workers: Vec<Worker>,
}

/// Unifies multiple data sources for multiple maps behind one request
/// queue and worker pool, backed by a shared [`Cache`].
pub struct Service {
    controller: Arc<Controller>,
    sources: Mutex<HashMap<String, SourceEntry>>,
}

impl Service {
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            controller: Arc::new(Controller::new(cache)),
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a data source and launches `maxParallelJobs` worker
    /// threads for it; present and incoming requests for it start being
    /// processed immediately.
    pub fn add(&self, data_source: Arc<dyn DataSource>) {
        let info = data_source.info();
        let key = source_key(&info);
        let worker_count = info.max_parallel_jobs.max(1);
        let workers = (0..worker_count)
            .map(|_| spawn_worker(data_source.clone(), info.clone(), self.controller.clone()))
            .collect();
        self.sources.lock().expect("sources lock poisoned").insert(
            key,
            SourceEntry {
                info,
                data_source,
                workers,
            },
        );
    }

    /// Removes a data source and joins its worker threads. Requests that
    /// can only be satisfied by it simply stop making progress.
    pub fn remove(&self, data_source: &Arc<dyn DataSource>) {
        let key = source_key(&data_source.info());
        let entry = self.sources.lock().expect("sources lock poisoned").remove(&key);
        let Some(entry) = entry else { return };
        for worker in &entry.workers {
            worker.should_terminate.store(true, Ordering::Release);
        }
        self.controller.jobs_available.notify_all();
        for worker in entry.workers {
            let _ = worker.thread.join();
        }
    }

    /// Enqueues a request. Worker threads are woken to start serving it.
    ///
    /// Before dispatch, every source that could serve `request.map_id`/
    /// `request.layer_id` is consulted; if none exist the request completes
    /// with `NoDataSource`, and if none authorize `request.headers` it
    /// completes with `Unauthorized` (§7) — in neither case is any tile
    /// dispatched.
    pub fn request(&self, request: Arc<Request>) -> Result<()> {
        if !self.can_process(&request.map_id, &request.layer_id) {
            request.set_status(RequestStatus::NoDataSource);
            return Ok(());
        }

        let authorized = {
            let sources = self.sources.lock().expect("sources lock poisoned");
            sources
                .values()
                .filter(|entry| entry.info.map_id == request.map_id && entry.info.layers.contains_key(&request.layer_id))
                .any(|entry| entry.data_source.is_authorized(&request.headers))
        };
        if !authorized {
            request.set_status(RequestStatus::Unauthorized);
            return Ok(());
        }

        self.controller.add_request(request);
        Ok(())
    }

    /// Removes a request from the queue and marks it `Aborted`.
    pub fn abort(&self, request: &Arc<Request>) {
        self.controller.abort_request(request);
    }

    #[must_use]
    pub fn can_process(&self, map_id: &str, layer_id: &str) -> bool {
        self.sources
            .lock()
            .expect("sources lock poisoned")
            .values()
            .any(|entry| entry.info.map_id == map_id && entry.info.layers.contains_key(layer_id))
    }

    #[must_use]
    pub fn info(&self) -> Vec<DataSourceInfo> {
        self.sources.lock().expect("sources lock poisoned").values().map(|e| e.info.clone()).collect()
    }

    #[must_use]
    pub fn cache(&self) -> Arc<dyn Cache> {
        self.controller.cache.clone()
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        let mut sources = self.sources.lock().expect("sources lock poisoned");
        for entry in sources.values() {
            for worker in &entry.workers {
                worker.should_terminate.store(true, Ordering::Release);
            }
        }
        self.controller.jobs_available.notify_all();
        for (_, entry) in sources.drain() {
            for worker in entry.workers {
                let _ = worker.thread.join();
            }
        }
    }
}

fn source_key(info: &DataSourceInfo) -> String {
    format!("{}::{}", info.map_id, info.node_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataSourceInfo, LayerInfo, LayerType, TileFeatureLayer, Version};
    use crate::service::datasource::AuthGate;
    use crate::service::memcache::MemCache;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, Mutex as StdMutex};

    fn layer_info() -> LayerInfo {
        LayerInfo {
            layer_id: "WayLayer".to_string(),
            layer_type: LayerType::Features,
            feature_types: Vec::new(),
            zoom_levels: Vec::new(),
            coverage: None,
            can_read: true,
            can_write: false,
            version: Version::new(1, 0, 0),
        }
    }

    fn source_info() -> DataSourceInfo {
        DataSourceInfo {
            node_id: "node-a".to_string(),
            map_id: "Tropico".to_string(),
            layers: StdHashMap::from([("WayLayer".to_string(), layer_info())]),
            max_parallel_jobs: 2,
            is_add_on: false,
            protocol_version: None,
            extra_json_attachment: None,
        }
    }

    struct CountingSource {
        info: DataSourceInfo,
        fills: AtomicU32,
    }

    impl DataSource for CountingSource {
        fn info(&self) -> DataSourceInfo {
            self.info.clone()
        }

        fn fill(&self, tile: &mut TileFeatureLayer) -> Result<()> {
            self.fills.fetch_add(1, Ordering::SeqCst);
            tile.new_feature("Way", vec![]).map(|_| ()).or(Ok(()))
        }
    }

    #[test]
    fn scenario_4_duplicate_requests_dedup_to_one_fill() {
        let cache = Arc::new(MemCache::new(100));
        let service = Service::new(cache);
        let source = Arc::new(CountingSource {
            info: source_info(),
            fills: AtomicU32::new(0),
        });
        service.add(source.clone());

        let results = Arc::new(StdMutex::new(0usize));
        let tiles = vec![TileId::from_value(1)];

        let make_request = || {
            let results = results.clone();
            Request::new("Tropico", "WayLayer", tiles.clone(), move |_layer| {
                *results.lock().unwrap() += 1;
            })
        };
        let r1 = make_request();
        let r2 = make_request();

        service.request(r1.clone()).unwrap();
        service.request(r2.clone()).unwrap();

        r1.wait();
        r2.wait();

        assert_eq!(r1.status(), RequestStatus::Done);
        assert_eq!(r2.status(), RequestStatus::Done);
        assert_eq!(*results.lock().unwrap(), 2);
        // Either the second request's tile was served from cache after the
        // first worker finished, or both landed on in-progress dedup; in
        // both cases the source must only have been asked to fill once.
        assert_eq!(source.fills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn aborted_request_does_not_receive_in_flight_result() {
        let cache = Arc::new(MemCache::new(10));
        let service = Service::new(cache);

        struct BlockingSource {
            info: DataSourceInfo,
            release: StdMutex<bool>,
            release_cv: std::sync::Condvar,
        }
        impl DataSource for BlockingSource {
            fn info(&self) -> DataSourceInfo {
                self.info.clone()
            }
            fn fill(&self, tile: &mut TileFeatureLayer) -> Result<()> {
                let mut guard = self.release.lock().unwrap();
                while !*guard {
                    guard = self.release_cv.wait(guard).unwrap();
                }
                tile.new_feature("Way", vec![]).map(|_| ()).or(Ok(()))
            }
        }

        let source = Arc::new(BlockingSource {
            info: source_info(),
            release: StdMutex::new(false),
            release_cv: std::sync::Condvar::new(),
        });
        service.add(source.clone());

        let delivered = Arc::new(StdMutex::new(false));
        let delivered_clone = delivered.clone();
        let request = Request::new("Tropico", "WayLayer", vec![TileId::from_value(1)], move |_layer| {
            *delivered_clone.lock().unwrap() = true;
        });
        service.request(request.clone()).unwrap();

        // Give the worker time to pick up the job and block inside fill().
        std::thread::sleep(std::time::Duration::from_millis(50));
        service.abort(&request);
        assert_eq!(request.status(), RequestStatus::Aborted);

        *source.release.lock().unwrap() = true;
        source.release_cv.notify_all();

        // Give the worker time to finish fetching and attempt delivery.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!*delivered.lock().unwrap());
        assert_eq!(request.status(), RequestStatus::Aborted);
    }

    #[test]
    fn unserviceable_request_completes_with_no_data_source() {
        let cache = Arc::new(MemCache::new(10));
        let service = Service::new(cache);
        let request = Request::new("Nowhere", "NoLayer", vec![TileId::from_value(1)], |_| {});
        service.request(request.clone()).unwrap();
        assert_eq!(request.status(), RequestStatus::NoDataSource);
    }

    #[test]
    fn scenario_6_request_without_required_header_is_unauthorized() {
        let cache = Arc::new(MemCache::new(10));
        let service = Service::new(cache);

        struct GatedSource {
            info: DataSourceInfo,
            gate: AuthGate,
        }
        impl DataSource for GatedSource {
            fn info(&self) -> DataSourceInfo {
                self.info.clone()
            }
            fn fill(&self, tile: &mut TileFeatureLayer) -> Result<()> {
                tile.new_feature("Way", vec![]).map(|_| ()).or(Ok(()))
            }
            fn is_authorized(&self, headers: &StdHashMap<String, String>) -> bool {
                self.gate.is_authorized(headers)
            }
        }

        let mut gate = AuthGate::new();
        gate.add_alternative("X-USER-ROLE", r"\bTropico-Viewer\b").unwrap();
        let source = Arc::new(GatedSource { info: source_info(), gate });
        service.add(source);

        let bad = Request::new("Tropico", "WayLayer", vec![TileId::from_value(1)], |_| {});
        service.request(bad.clone()).unwrap();
        assert_eq!(bad.status(), RequestStatus::Unauthorized);

        let mut headers = StdHashMap::new();
        headers.insert("X-USER-ROLE".to_string(), "Tropico-Viewer".to_string());
        let good = Request::with_headers("Tropico", "WayLayer", vec![TileId::from_value(1)], headers, |_| {});
        service.request(good.clone()).unwrap();
        good.wait();
        assert_eq!(good.status(), RequestStatus::Done);
    }

    #[test]
    fn empty_tiles_request_completes_immediately() {
        let cache = Arc::new(MemCache::new(10));
        let service = Service::new(cache);
        let source = Arc::new(CountingSource {
            info: source_info(),
            fills: AtomicU32::new(0),
        });
        service.add(source);
        let request = Request::new("Tropico", "WayLayer", vec![], |_| {});
        service.request(request.clone()).unwrap();
        assert_eq!(request.status(), RequestStatus::Done);
    }
}
