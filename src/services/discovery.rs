//! Key-value discovery endpoint speaking the etcd v2 keys API subset guests
//! use to find their peers.
//!
//! Routes:
//! - `GET    /v2/keys/{key}[?recursive=true][&wait=true[&waitIndex=N]]`
//! - `PUT    /v2/keys/{key}[?prevExist=bool]` with form field `value`
//! - `DELETE /v2/keys/{key}`
//! - `GET    /version`
//!
//! State is kept in memory and snapshotted to a JSON file inside a private
//! temp dir that is removed on [`DiscoveryService::stop`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Form, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::{oneshot, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorList, Result, ResultExt};
use crate::network::Sandbox;

const SNAPSHOT_FILE: &str = "store.json";
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Events kept for `waitIndex` lookups, as etcd does
const HISTORY_LEN: usize = 1000;

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: String,
    created_index: u64,
    modified_index: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    index: u64,
    entries: BTreeMap<String, Entry>,
    #[serde(skip)]
    history: VecDeque<Event>,
}

impl Snapshot {
    fn record(&mut self, event: Event) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }
}

/// A change, as returned to watchers
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub action: &'static str,
    pub index: u64,
    pub node: NodeView,
}

impl Event {
    fn matches(&self, key: &str, recursive: bool) -> bool {
        self.node.key == key || (recursive && self.node.key.starts_with(&dir_prefix(key)))
    }
}

/// A node as rendered on the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_index: Option<u64>,
}

impl NodeView {
    fn leaf(key: &str, entry: &Entry) -> Self {
        NodeView {
            key: key.to_string(),
            value: Some(entry.value.clone()),
            dir: false,
            nodes: None,
            created_index: Some(entry.created_index),
            modified_index: Some(entry.modified_index),
        }
    }

    fn dir(key: &str, nodes: Option<Vec<NodeView>>) -> Self {
        NodeView {
            key: key.to_string(),
            value: None,
            dir: true,
            nodes,
            created_index: None,
            modified_index: None,
        }
    }
}

/// Errors with etcd's numeric codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    NotFound(String),
    NotAFile(String),
    NotADirectory(String),
    NodeExist(String),
    /// The requested `waitIndex` is older than the kept history
    EventIndexCleared(String),
}

impl KeyError {
    fn code(&self) -> u32 {
        match self {
            KeyError::NotFound(_) => 100,
            KeyError::NotAFile(_) => 102,
            KeyError::NotADirectory(_) => 104,
            KeyError::NodeExist(_) => 105,
            KeyError::EventIndexCleared(_) => 401,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            KeyError::NotFound(_) => "Key not found",
            KeyError::NotAFile(_) => "Not a file",
            KeyError::NotADirectory(_) => "Not a directory",
            KeyError::NodeExist(_) => "Key already exists",
            KeyError::EventIndexCleared(_) => "The event in requested index is outdated and cleared",
        }
    }

    fn cause(&self) -> &str {
        match self {
            KeyError::NotFound(k)
            | KeyError::NotAFile(k)
            | KeyError::NotADirectory(k)
            | KeyError::NodeExist(k)
            | KeyError::EventIndexCleared(k) => k,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            KeyError::NotFound(_) => StatusCode::NOT_FOUND,
            KeyError::NodeExist(_) => StatusCode::PRECONDITION_FAILED,
            KeyError::EventIndexCleared(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::FORBIDDEN,
        }
    }
}

/// Canonical form of a key: leading slash, no trailing or doubled slashes.
pub fn normalize_key(key: &str) -> String {
    let parts: Vec<&str> = key.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

fn dir_prefix(key: &str) -> String {
    if key == "/" {
        "/".to_string()
    } else {
        format!("{}/", key)
    }
}

pub struct KeyStore {
    state: RwLock<Snapshot>,
    snapshot_path: PathBuf,
    changed: Notify,
    closed: AtomicBool,
}

impl KeyStore {
    pub fn new(snapshot_path: PathBuf) -> Self {
        Self {
            state: RwLock::new(Snapshot::default()),
            snapshot_path,
            changed: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn index(&self) -> u64 {
        self.state.read().await.index
    }

    pub async fn get(&self, key: &str, recursive: bool) -> std::result::Result<NodeView, KeyError> {
        let key = normalize_key(key);
        let state = self.state.read().await;
        if let Some(entry) = state.entries.get(&key) {
            return Ok(NodeView::leaf(&key, entry));
        }
        if key == "/" {
            return Ok(view_dir(&state.entries, &key, recursive));
        }
        let prefix = dir_prefix(&key);
        if state.entries.keys().any(|k| k.starts_with(&prefix)) {
            return Ok(view_dir(&state.entries, &key, recursive));
        }
        Err(KeyError::NotFound(key))
    }

    /// Set a leaf. `prev_exist` of `Some(false)` only creates and
    /// `Some(true)` only updates. Returns the change event and whether the
    /// key was newly created.
    pub async fn put(
        &self,
        key: &str,
        value: &str,
        prev_exist: Option<bool>,
    ) -> Result<std::result::Result<(Event, bool), KeyError>> {
        let key = normalize_key(key);
        let mut state = self.state.write().await;

        if key == "/" || state.entries.keys().any(|k| k.starts_with(&dir_prefix(&key))) {
            return Ok(Err(KeyError::NotAFile(key)));
        }
        if let Some(parent) = ancestors(&key).find(|a| state.entries.contains_key(a)) {
            return Ok(Err(KeyError::NotADirectory(parent)));
        }
        let exists = state.entries.contains_key(&key);
        let action = match (prev_exist, exists) {
            (Some(false), true) => return Ok(Err(KeyError::NodeExist(key))),
            (Some(true), false) => return Ok(Err(KeyError::NotFound(key))),
            (Some(false), false) => "create",
            (Some(true), true) => "update",
            (None, _) => "set",
        };

        state.index += 1;
        let index = state.index;
        let entry = state.entries.entry(key.clone()).or_insert(Entry {
            value: String::new(),
            created_index: index,
            modified_index: index,
        });
        entry.value = value.to_string();
        entry.modified_index = index;
        let event = Event {
            action,
            index,
            node: NodeView::leaf(&key, entry),
        };
        state.record(event.clone());

        persist(&self.snapshot_path, &state).await?;
        drop(state);
        self.changed.notify_waiters();
        debug!(key = %key, index = index, action = action, "discovery key set");
        Ok(Ok((event, !exists)))
    }

    pub async fn delete(&self, key: &str) -> Result<std::result::Result<Event, KeyError>> {
        let key = normalize_key(key);
        let mut state = self.state.write().await;

        let Some(mut entry) = state.entries.remove(&key) else {
            if key == "/" || state.entries.keys().any(|k| k.starts_with(&dir_prefix(&key))) {
                return Ok(Err(KeyError::NotAFile(key)));
            }
            return Ok(Err(KeyError::NotFound(key)));
        };
        state.index += 1;
        entry.modified_index = state.index;
        let mut view = NodeView::leaf(&key, &entry);
        view.value = None;
        let event = Event {
            action: "delete",
            index: state.index,
            node: view,
        };
        state.record(event.clone());

        persist(&self.snapshot_path, &state).await?;
        drop(state);
        self.changed.notify_waiters();
        Ok(Ok(event))
    }

    /// Wait for the first change to `key` (or below it, when `recursive`)
    /// at or after `since`, or after the current index when unset.
    ///
    /// Returns `None` once the store is closed.
    pub async fn wait(
        &self,
        key: &str,
        recursive: bool,
        since: Option<u64>,
    ) -> Option<std::result::Result<Event, KeyError>> {
        let key = normalize_key(key);
        let since = match since {
            Some(index) => index,
            None => self.index().await + 1,
        };
        loop {
            // Register before looking so a change in between is not missed
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            {
                let state = self.state.read().await;
                if let Some(oldest) = state.history.front() {
                    if since < oldest.index && state.history.len() == HISTORY_LEN {
                        return Some(Err(KeyError::EventIndexCleared(key)));
                    }
                }
                let found = state
                    .history
                    .iter()
                    .find(|e| e.index >= since && e.matches(&key, recursive));
                if let Some(event) = found {
                    return Some(Ok(event.clone()));
                }
            }
            changed.await;
        }
    }

    /// Release every pending watcher. Later waits return immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

/// Parent directories of `key`, nearest first, excluding the root.
fn ancestors(key: &str) -> impl Iterator<Item = String> + '_ {
    key.match_indices('/')
        .map(|(i, _)| i)
        .filter(|&i| i > 0)
        .rev()
        .map(move |i| key[..i].to_string())
}

fn view_dir(entries: &BTreeMap<String, Entry>, key: &str, recursive: bool) -> NodeView {
    let prefix = dir_prefix(key);
    let mut nodes = Vec::new();
    let mut seen_dirs: Vec<String> = Vec::new();

    for (k, entry) in entries.range(prefix.clone()..) {
        let Some(rest) = k.strip_prefix(&prefix) else {
            break;
        };
        match rest.split_once('/') {
            None => nodes.push(NodeView::leaf(k, entry)),
            Some((child, _)) => {
                let child_key = format!("{}{}", prefix, child);
                if seen_dirs.last() == Some(&child_key) {
                    continue;
                }
                seen_dirs.push(child_key.clone());
                if recursive {
                    nodes.push(view_dir(entries, &child_key, true));
                } else {
                    nodes.push(NodeView::dir(&child_key, None));
                }
            }
        }
    }
    NodeView::dir(key, Some(nodes))
}

async fn persist(path: &FsPath, state: &Snapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(state).resource("serializing discovery snapshot")?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .resource(format_args!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .resource(format_args!("renaming {}", tmp.display()))?;
    Ok(())
}

// ============================================================================
// HTTP handlers
// ============================================================================

type SharedStore = Arc<KeyStore>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetParams {
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    wait: bool,
    wait_index: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutParams {
    prev_exist: Option<bool>,
}

fn key_error(err: KeyError, index: u64) -> Response {
    let body = serde_json::json!({
        "errorCode": err.code(),
        "message": err.message(),
        "cause": err.cause(),
        "index": index,
    });
    (err.status(), Json(body)).into_response()
}

fn internal_error(err: Error) -> Response {
    warn!(error = %err, "discovery store failure");
    let body = serde_json::json!({ "errorCode": 300, "message": err.to_string() });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

fn node_response(status: StatusCode, action: &str, node: NodeView, index: u64) -> Response {
    let body = serde_json::json!({ "action": action, "node": node });
    (status, [("x-etcd-index", index.to_string())], Json(body)).into_response()
}

async fn get_root(State(store): State<SharedStore>, Query(params): Query<GetParams>) -> Response {
    get_node(store, "/", params).await
}

async fn get_key(
    State(store): State<SharedStore>,
    Path(key): Path<String>,
    Query(params): Query<GetParams>,
) -> Response {
    get_node(store, &key, params).await
}

async fn get_node(store: SharedStore, key: &str, params: GetParams) -> Response {
    if params.wait {
        return match store.wait(key, params.recursive, params.wait_index).await {
            Some(Ok(event)) => node_response(StatusCode::OK, event.action, event.node, event.index),
            Some(Err(e)) => key_error(e, store.index().await),
            None => {
                let body = serde_json::json!({ "errorCode": 300, "message": "shutting down" });
                (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
            }
        };
    }
    let index = store.index().await;
    match store.get(key, params.recursive).await {
        Ok(node) => node_response(StatusCode::OK, "get", node, index),
        Err(e) => key_error(e, index),
    }
}

async fn put_key(
    State(store): State<SharedStore>,
    Path(key): Path<String>,
    Query(params): Query<PutParams>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let value = form.get("value").map(String::as_str).unwrap_or("");
    // etcd takes prevExist from either the query or the form
    let prev_exist = params
        .prev_exist
        .or_else(|| form.get("prevExist").and_then(|v| v.parse().ok()));
    match store.put(&key, value, prev_exist).await {
        Ok(Ok((event, created))) => {
            let status = if created { StatusCode::CREATED } else { StatusCode::OK };
            node_response(status, event.action, event.node, event.index)
        }
        Ok(Err(e)) => key_error(e, store.index().await),
        Err(e) => internal_error(e),
    }
}

async fn delete_key(State(store): State<SharedStore>, Path(key): Path<String>) -> Response {
    match store.delete(&key).await {
        Ok(Ok(event)) => node_response(StatusCode::OK, event.action, event.node, event.index),
        Ok(Err(e)) => key_error(e, store.index().await),
        Err(e) => internal_error(e),
    }
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "etcdserver": "2.3.8", "etcdcluster": "2.3.0" }))
}

pub fn router(store: SharedStore) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/v2/keys", get(get_root))
        .route("/v2/keys/{*key}", get(get_key).put(put_key).delete(delete_key))
        .with_state(store)
}

// ============================================================================
// Service
// ============================================================================

pub struct DiscoveryService {
    addr: SocketAddr,
    store: SharedStore,
    state_dir: Mutex<Option<TempDir>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<std::io::Result<()>>>>,
}

impl DiscoveryService {
    /// Listen on an ephemeral port of `ip` inside the sandbox.
    pub async fn start(sandbox: &Sandbox, ip: IpAddr, temp_root: &FsPath) -> Result<Self> {
        let listener = sandbox.bind_tcp(SocketAddr::new(ip, 0)).await?;
        Self::serve(listener, temp_root).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(listener: std::net::TcpListener, temp_root: &FsPath) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let addr = listener.local_addr()?;

        let state_dir = tempfile::Builder::new()
            .prefix("vmfabric-discovery-")
            .tempdir_in(temp_root)
            .resource(format_args!("creating state dir in {}", temp_root.display()))?;
        let store = Arc::new(KeyStore::new(state_dir.path().join(SNAPSHOT_FILE)));

        let (tx, rx) = oneshot::channel::<()>();
        let app = router(store.clone());
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .await
        });

        info!(addr = %addr, "discovery service listening");
        Ok(Self {
            addr,
            store,
            state_dir: Mutex::new(Some(state_dir)),
            shutdown: Mutex::new(Some(tx)),
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    /// Reserve a fresh registry token expecting `size` members and return
    /// its URL.
    pub async fn allocate_discovery_url(&self, size: usize) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        let key = format!("/_etcd/registry/{}/_config/size", token);
        if let Err(e) = self.store.put(&key, &size.to_string(), None).await? {
            return Err(Error::Resource(format!("registering discovery token: {:?}", e)));
        }
        debug!(token = %token, size = size, "discovery token allocated");
        Ok(format!("{}/v2/keys/_etcd/registry/{}", self.endpoint(), token))
    }

    /// Stop serving and remove the on-disk state. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut errors = ErrorList::new();

        // Pending watches would hold graceful shutdown open
        self.store.close();
        if let Some(tx) = self.shutdown.lock().ok().and_then(|mut g| g.take()) {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.lock().await.take() {
            match tokio::time::timeout(STOP_TIMEOUT, task).await {
                Ok(Ok(res)) => errors.check("discovery server", res),
                Ok(Err(e)) => errors.push("discovery server task", e),
                Err(_) => errors.push("discovery server", "did not stop in time"),
            }
        }

        let dir = self.state_dir.lock().ok().and_then(|mut g| g.take());
        if let Some(dir) = dir {
            let path = dir.path().display().to_string();
            errors.check(format!("removing {}", path), dir.close());
        }

        if errors.is_empty() {
            info!(addr = %self.addr, "discovery service stopped");
        }
        errors.into_result()
    }

    /// Path of the state dir, while running
    pub fn state_dir(&self) -> Option<PathBuf> {
        self.state_dir
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|d| d.path().to_path_buf()))
    }
}
