//! Shared test fixtures: metainfo builders, a scriptable engine and a
//! static interface probe.

use async_trait::async_trait;
use serde_bencode::value::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::db::Database;
use crate::descriptor;
use crate::engine::{EngineError, EngineHandle, EngineResult, ProtocolEngine};
use crate::engine_adapter::TorrentManager;
use crate::error::{Error, Result};
use crate::network_policy::{classify_vpn, InterfaceProbe, NetworkPolicyGate};
use crate::service::ServiceContext;
use crate::types::{
    ContentId, FilePriority, InterfaceObservation, NetworkPolicy, RegistryStrategy, Settings,
    Transfer, TransferDescriptor, TransferRecord,
};

const PIECE_LENGTH: i64 = 16384;

fn bytes(value: impl AsRef<[u8]>) -> Value {
    Value::Bytes(value.as_ref().to_vec())
}

fn int(value: u64) -> Value {
    Value::Int(i64::try_from(value).unwrap())
}

fn dict(entries: Vec<(&str, Value)>) -> Value {
    Value::Dict(
        entries
            .into_iter()
            .map(|(key, value)| (key.as_bytes().to_vec(), value))
            .collect(),
    )
}

/// `info` entries shared by both layouts; a single piece hash is enough for
/// the parser.
fn info_dict(name: &str, mut entries: Vec<(&'static str, Value)>) -> Value {
    entries.push(("name", bytes(name)));
    entries.push(("piece length", Value::Int(PIECE_LENGTH)));
    entries.push(("pieces", bytes([0xabu8; 20])));
    dict(entries)
}

fn encode(root: &Value) -> Vec<u8> {
    serde_bencode::to_bytes(root).unwrap()
}

/// Bencoded single-file metainfo with one tracker
pub fn single_file_torrent(name: &str, length: u64) -> Vec<u8> {
    encode(&dict(vec![
        ("announce", bytes("http://tracker.example/announce")),
        ("info", info_dict(name, vec![("length", int(length))])),
    ]))
}

/// Bencoded multi-file metainfo without trackers
pub fn multi_file_torrent(name: &str, files: &[(&[&str], u64)]) -> Vec<u8> {
    let files = files
        .iter()
        .map(|(path, length)| {
            dict(vec![
                ("length", int(*length)),
                ("path", Value::List(path.iter().map(bytes).collect())),
            ])
        })
        .collect();
    encode(&dict(vec![(
        "info",
        info_dict(name, vec![("files", Value::List(files))]),
    )]))
}

pub fn magnet_uri(id: &ContentId, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("magnet:?xt=urn:btih:{}&dn={}", id.to_hex(), name),
        None => format!("magnet:?xt=urn:btih:{}", id.to_hex()),
    }
}

pub fn descriptor(name: &str, length: u64) -> TransferDescriptor {
    descriptor::parse(&single_file_torrent(name, length)).unwrap()
}

/// A stopped record whose blob is a valid single-file torrent
pub fn record(name: &str, length: u64) -> TransferRecord {
    let bytes = single_file_torrent(name, length);
    let transfer = Transfer::new(descriptor::parse(&bytes).unwrap());
    TransferRecord::from_transfer(&transfer, "/tmp/seedkeep-test", bytes)
}

/// Interface probe with a scripted answer
pub struct StaticProbe {
    observation: Mutex<Option<InterfaceObservation>>,
    failing: bool,
}

impl StaticProbe {
    pub fn absent() -> Self {
        Self {
            observation: Mutex::new(None),
            failing: false,
        }
    }

    pub fn new(name: &str, up: bool) -> Self {
        Self {
            observation: Mutex::new(Some(InterfaceObservation {
                name: name.to_string(),
                is_vpn: classify_vpn(name),
                is_up: up,
                addresses: vec!["10.8.0.2".parse().unwrap()],
            })),
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            observation: Mutex::new(None),
            failing: true,
        }
    }

    pub fn set_up(&self, up: bool) {
        if let Some(o) = self.observation.lock().unwrap().as_mut() {
            o.is_up = up;
        }
    }
}

impl InterfaceProbe for StaticProbe {
    fn lookup(&self, name: &str) -> Result<Option<InterfaceObservation>> {
        if self.failing {
            return Err(Error::Io(std::io::Error::other("probe failure")));
        }
        Ok(self
            .observation
            .lock()
            .unwrap()
            .clone()
            .filter(|o| o.name == name))
    }
}

#[derive(Default)]
struct MockState {
    handles: HashMap<ContentId, EngineHandle>,
    metadata: HashMap<ContentId, Vec<u8>>,
    priorities: HashMap<(ContentId, usize), FilePriority>,
    failing_handles: HashSet<ContentId>,
    calls: Vec<&'static str>,
    reject_adds: bool,
    fail_batch: bool,
}

/// In-memory protocol engine driven by the test
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_call(&self, name: &'static str) -> std::sync::MutexGuard<'_, MockState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(name);
        state
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| **c == name)
            .count()
    }

    pub fn has_handle(&self, id: &ContentId) -> bool {
        self.state.lock().unwrap().handles.contains_key(id)
    }

    /// Drop a handle as if the engine lost it
    pub fn forget(&self, id: &ContentId) {
        self.state.lock().unwrap().handles.remove(id);
    }

    pub fn set_progress(&self, id: &ContentId, bytes_completed: u64, active_peers: u32) {
        let mut state = self.state.lock().unwrap();
        let handle = state.handles.get_mut(id).unwrap();
        handle.bytes_completed = bytes_completed;
        handle.active_peers = active_peers;
        handle.download_rate = if active_peers > 0 { 1024 } else { 0 };
    }

    /// Metainfo to hand out when `metadata` is awaited for this id
    pub fn provide_metadata(&self, id: &ContentId, metainfo: Vec<u8>) {
        self.state.lock().unwrap().metadata.insert(*id, metainfo);
    }

    pub fn reject_adds(&self, reject: bool) {
        self.state.lock().unwrap().reject_adds = reject;
    }

    pub fn fail_batch(&self, fail: bool) {
        self.state.lock().unwrap().fail_batch = fail;
    }

    pub fn fail_handle(&self, id: &ContentId) {
        self.state.lock().unwrap().failing_handles.insert(*id);
    }

    pub fn priority(&self, id: &ContentId, file_index: usize) -> Option<FilePriority> {
        self.state
            .lock()
            .unwrap()
            .priorities
            .get(&(*id, file_index))
            .copied()
    }
}

fn new_handle(id: ContentId, name: String, total_length: u64) -> EngineHandle {
    EngineHandle {
        content_id: id,
        name,
        total_length,
        bytes_completed: 0,
        bytes_uploaded: 0,
        active_peers: 0,
        download_rate: 0,
        upload_rate: 0,
    }
}

#[async_trait]
impl ProtocolEngine for MockEngine {
    async fn add_torrent(&self, metainfo: &[u8], _save_dir: &Path) -> EngineResult<ContentId> {
        let mut state = self.record_call("add_torrent");
        if state.reject_adds {
            return Err(EngineError::Rejected("adds disabled".to_string()));
        }
        let d = descriptor::parse(metainfo).map_err(|e| EngineError::Rejected(e.to_string()))?;
        state
            .handles
            .entry(d.content_id)
            .or_insert_with(|| new_handle(d.content_id, d.name.clone(), d.total_length));
        Ok(d.content_id)
    }

    async fn add_magnet(&self, uri: &str, _save_dir: &Path) -> EngineResult<ContentId> {
        let mut state = self.record_call("add_magnet");
        if state.reject_adds {
            return Err(EngineError::Rejected("adds disabled".to_string()));
        }
        let m = descriptor::parse_magnet(uri).map_err(|e| EngineError::Rejected(e.to_string()))?;
        state
            .handles
            .entry(m.content_id)
            .or_insert_with(|| new_handle(m.content_id, m.name.clone(), 0));
        Ok(m.content_id)
    }

    async fn metadata(&self, id: &ContentId) -> EngineResult<Vec<u8>> {
        let metainfo = {
            let state = self.record_call("metadata");
            state.metadata.get(id).cloned()
        };
        match metainfo {
            Some(metainfo) => Ok(metainfo),
            None => std::future::pending().await,
        }
    }

    fn handles(&self) -> EngineResult<Vec<EngineHandle>> {
        let state = self.record_call("handles");
        if state.fail_batch {
            return Err(EngineError::Unavailable("batch lookup disabled".to_string()));
        }
        Ok(state.handles.values().cloned().collect())
    }

    fn handle(&self, id: &ContentId) -> EngineResult<Option<EngineHandle>> {
        let state = self.record_call("handle");
        if state.failing_handles.contains(id) {
            return Err(EngineError::Unavailable(format!("lookup of {} disabled", id)));
        }
        Ok(state.handles.get(id).cloned())
    }

    async fn download_all(&self, id: &ContentId) -> EngineResult<()> {
        let state = self.record_call("download_all");
        if state.handles.contains_key(id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(id.to_string()))
        }
    }

    async fn stop(&self, id: &ContentId) -> EngineResult<()> {
        let mut state = self.record_call("stop");
        let handle = state
            .handles
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        handle.active_peers = 0;
        handle.download_rate = 0;
        handle.upload_rate = 0;
        Ok(())
    }

    async fn remove(&self, id: &ContentId, _delete_files: bool) -> EngineResult<()> {
        let mut state = self.record_call("remove");
        state
            .handles
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn set_file_priority(
        &self,
        id: &ContentId,
        file_index: usize,
        priority: FilePriority,
    ) -> EngineResult<()> {
        let mut state = self.record_call("set_file_priority");
        if !state.handles.contains_key(id) {
            return Err(EngineError::NotFound(id.to_string()));
        }
        state.priorities.insert((*id, file_index), priority);
        Ok(())
    }
}

pub fn test_settings() -> Settings {
    Settings {
        download_path: std::env::temp_dir()
            .join("seedkeep-test")
            .to_string_lossy()
            .to_string(),
        ..Settings::default()
    }
}

/// Context with an in-memory database and a disabled network policy
pub fn context() -> Arc<ServiceContext> {
    context_with_gate(false, false, None).0
}

/// Context whose gate watches `wg0`. `interface` is `None` when the
/// interface does not exist, otherwise whether it is up.
pub fn context_with_gate(
    enabled: bool,
    kill_switch: bool,
    interface: Option<bool>,
) -> (Arc<ServiceContext>, Arc<StaticProbe>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let probe = Arc::new(match interface {
        Some(up) => StaticProbe::new("wg0", up),
        None => StaticProbe::absent(),
    });
    let policy = NetworkPolicy {
        enabled,
        interface_name: "wg0".to_string(),
        kill_switch_enabled: kill_switch,
    };
    let mut settings = test_settings();
    settings.network_policy = policy.clone();

    let gate = Arc::new(NetworkPolicyGate::new(policy, probe.clone()));
    let db = Database::open_in_memory().unwrap();
    (ServiceContext::new(db, settings, gate), probe)
}

pub fn manager(
    engine: Arc<MockEngine>,
    ctx: Arc<ServiceContext>,
    strategy: RegistryStrategy,
) -> TorrentManager {
    let engine: Arc<dyn ProtocolEngine> = engine;
    TorrentManager::new(engine, strategy.build(), ctx)
}
