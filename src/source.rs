//! Authoritative external event log (e.g. a smart-contract event stream).
//!
//! The indexer only sees the [`ChainEventSource`] trait: ordered, replayable
//! events per topic plus positional contract calls. Two implementations are
//! provided, both driven by a [`SourceSnapshot`]:
//!
//! - [`MemoryEventSource`]: mutable in-process snapshot, used by tests and
//!   embedders.
//! - [`FileEventSource`]: re-reads a JSON snapshot on every call so another
//!   process can keep appending to it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::SourceError;

pub const FN_GET_PRODUCT: &str = "getProduct";
pub const FN_STAGE_COUNT: &str = "stageCount";
pub const FN_GET_STAGE: &str = "getStage";

/// Event streams the indexer consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    ProducerAdded,
    ProductRegistered,
    StageAdded,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ProducerAdded => "ProducerAdded",
            Self::ProductRegistered => "ProductRegistered",
            Self::StageAdded => "StageAdded",
        })
    }
}

/// An undecoded event as emitted by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub position: u64,
    /// Event arguments; normally a JSON object.
    pub fields: Value,
}

impl RawEvent {
    /// Decode the event fields into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SourceError> {
        serde_json::from_value(self.fields.clone()).map_err(|e| {
            SourceError::Decode(format!("event at position {}: {e}", self.position))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAdded {
    pub id: String,
    pub name: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRegistered {
    pub id: String,
    pub name: String,
    pub producer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAdded {
    pub product_id: String,
}

/// Read the tuple element at `idx` as `T`.
pub fn tuple_field<T: DeserializeOwned>(
    tuple: &[Value],
    idx: usize,
    function: &str,
) -> Result<T, SourceError> {
    let value = tuple.get(idx).ok_or_else(|| {
        SourceError::Decode(format!(
            "{function} returned {} values, expected at least {}",
            tuple.len(),
            idx + 1
        ))
    })?;
    serde_json::from_value(value.clone())
        .map_err(|e| SourceError::Decode(format!("{function}[{idx}]: {e}")))
}

/// Capability interface over the authoritative event log.
///
/// Events are ordered, replayable from position 0 and immutable once emitted.
#[async_trait]
pub trait ChainEventSource: Send + Sync {
    async fn events(&self, topic: Topic, from_position: u64) -> Result<Vec<RawEvent>, SourceError>;

    async fn call(&self, function: &str, args: &[Value]) -> Result<Vec<Value>, SourceError>;
}

/// Product state held by the contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDetail {
    pub id: String,
    pub name: String,
    pub producer_id: String,
    pub region: String,
    pub harvest_timestamp: i64,
    pub organic: bool,
}

/// Stage state held by the contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDetail {
    pub date: i64,
    pub operation: String,
    pub operator: String,
    pub place: String,
}

/// Full state of a source: event log per topic and contract storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceSnapshot {
    pub producer_added: Vec<RawEvent>,
    pub product_registered: Vec<RawEvent>,
    pub stage_added: Vec<RawEvent>,
    pub products: BTreeMap<String, ProductDetail>,
    pub stages: BTreeMap<String, Vec<StageDetail>>,
}

impl SourceSnapshot {
    fn log(&self, topic: Topic) -> &Vec<RawEvent> {
        match topic {
            Topic::ProducerAdded => &self.producer_added,
            Topic::ProductRegistered => &self.product_registered,
            Topic::StageAdded => &self.stage_added,
        }
    }

    fn log_mut(&mut self, topic: Topic) -> &mut Vec<RawEvent> {
        match topic {
            Topic::ProducerAdded => &mut self.producer_added,
            Topic::ProductRegistered => &mut self.product_registered,
            Topic::StageAdded => &mut self.stage_added,
        }
    }

    /// Append an event to `topic` and return its position.
    pub fn emit(&mut self, topic: Topic, fields: Value) -> u64 {
        let log = self.log_mut(topic);
        let position = log.len() as u64;
        log.push(RawEvent { position, fields });
        position
    }

    pub fn events_from(&self, topic: Topic, from_position: u64) -> Vec<RawEvent> {
        self.log(topic)
            .iter()
            .filter(|e| e.position >= from_position)
            .cloned()
            .collect()
    }

    /// Execute a read-only contract function.
    pub fn call(&self, function: &str, args: &[Value]) -> Result<Vec<Value>, SourceError> {
        match function {
            FN_GET_PRODUCT => {
                let id: String = tuple_field(args, 0, function)?;
                let p = self
                    .products
                    .get(&id)
                    .ok_or_else(|| SourceError::Decode(format!("unknown product {id}")))?;
                Ok(vec![
                    json!(p.id),
                    json!(p.name),
                    json!(p.producer_id),
                    json!(p.region),
                    json!(p.harvest_timestamp),
                    json!(p.organic),
                ])
            }
            FN_STAGE_COUNT => {
                let id: String = tuple_field(args, 0, function)?;
                let n = self.stages.get(&id).map_or(0, Vec::len);
                Ok(vec![json!(n)])
            }
            FN_GET_STAGE => {
                let id: String = tuple_field(args, 0, function)?;
                let idx: usize = tuple_field(args, 1, function)?;
                let s = self
                    .stages
                    .get(&id)
                    .and_then(|stages| stages.get(idx))
                    .ok_or_else(|| SourceError::Decode(format!("no stage {idx} for {id}")))?;
                Ok(vec![
                    json!(s.date),
                    json!(s.operation),
                    json!(s.operator),
                    json!(s.place),
                ])
            }
            other => Err(SourceError::Decode(format!("unknown function {other}"))),
        }
    }
}

/// In-process event source.
#[derive(Debug, Default)]
pub struct MemoryEventSource {
    state: RwLock<SourceSnapshot>,
    unreachable: AtomicBool,
}

impl MemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: SourceSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Mutate the snapshot in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut SourceSnapshot) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard)
    }

    /// Emit a `ProducerAdded` event.
    pub fn add_producer(&self, id: &str, name: &str, region: &str) {
        self.update(|s| {
            s.emit(
                Topic::ProducerAdded,
                json!({"id": id, "name": name, "region": region}),
            )
        });
    }

    /// Store the product in contract state and emit `ProductRegistered`.
    pub fn register_product(&self, detail: ProductDetail) {
        self.update(|s| {
            s.emit(
                Topic::ProductRegistered,
                json!({"id": detail.id, "name": detail.name, "producerId": detail.producer_id}),
            );
            s.products.insert(detail.id.clone(), detail);
        });
    }

    /// Store the stage in contract state and emit `StageAdded`.
    pub fn add_stage(&self, product_id: &str, stage: StageDetail) {
        self.update(|s| {
            s.stages.entry(product_id.to_string()).or_default().push(stage);
            s.emit(Topic::StageAdded, json!({"productId": product_id}));
        });
    }

    /// Make every subsequent call fail with a connectivity error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), SourceError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SourceError::Connectivity("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainEventSource for MemoryEventSource {
    async fn events(&self, topic: Topic, from_position: u64) -> Result<Vec<RawEvent>, SourceError> {
        self.check_reachable()?;
        Ok(self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .events_from(topic, from_position))
    }

    async fn call(&self, function: &str, args: &[Value]) -> Result<Vec<Value>, SourceError> {
        self.check_reachable()?;
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .call(function, args)
    }
}

/// Event source backed by a JSON [`SourceSnapshot`] file.
///
/// A missing or unreadable file counts as an unreachable source; a file that
/// is not a valid snapshot is a decode error.
#[derive(Debug, Clone)]
pub struct FileEventSource {
    path: PathBuf,
}

impl FileEventSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn snapshot(&self) -> Result<SourceSnapshot, SourceError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SourceError::Connectivity(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| SourceError::Decode(format!("{}: {e}", self.path.display())))
    }
}

#[async_trait]
impl ChainEventSource for FileEventSource {
    async fn events(&self, topic: Topic, from_position: u64) -> Result<Vec<RawEvent>, SourceError> {
        Ok(self.snapshot().await?.events_from(topic, from_position))
    }

    async fn call(&self, function: &str, args: &[Value]) -> Result<Vec<Value>, SourceError> {
        self.snapshot().await?.call(function, args)
    }
}
