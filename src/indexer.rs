//! Replays the authoritative event source into the relational store.
//!
//! # Cycle
//!
//! Every call to [`EventIndexer::synchronize`] runs one cycle, in dependency
//! order:
//!
//! 1. `ProducerAdded` events → producers
//! 2. `ProductRegistered` events → products (detail fetched with `getProduct`)
//! 3. `StageAdded` events → stages of each referenced product (`stageCount`,
//!    then `getStage` per position)
//!
//! Each cycle replays every topic from position 0 and relies on natural-key
//! existence checks, so delivery is at-least-once and the effect is
//! at-most-once. Inserts commit one entity at a time: an aborted cycle keeps
//! whatever it inserted before the failure.
//!
//! # Failures
//!
//! Per-event problems (malformed data, a rejected insert) are recorded and the
//! cycle moves on. Losing the source or the store aborts the remaining steps.
//! Nothing is returned as `Err`: the [`SyncOutcome`] carries everything.
//!
//! A product whose producer is missing, or stages whose product is missing,
//! are deferred and retried next cycle. After `max_deferred_cycles`
//! consecutive deferrals they are also reported as `DependencyStalled`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{JobError, SourceError, StoreError, SyncError};
use crate::scheduler::ScheduledJob;
use crate::source::{
    tuple_field, ChainEventSource, ProducerAdded, ProductRegistered, RawEvent, StageAdded, Topic,
    FN_GET_PRODUCT, FN_GET_STAGE, FN_STAGE_COUNT,
};
use crate::store::{
    Entity, EntityCounts, EntityKey, EntityKind, Producer, Product, RelationalStore, StageKey,
};

/// Default number of consecutive deferrals before a dependency is reported as stalled.
pub const DEFAULT_MAX_DEFERRED_CYCLES: u32 = 3;

/// An entity held back because its parent is not materialized yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deferral {
    pub kind: EntityKind,
    pub key: String,
    pub waiting_for: String,
    /// Consecutive cycles this entity has been deferred, this one included.
    pub cycles: u32,
}

/// Result of one synchronization cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncOutcome {
    /// 1-based cycle number since the indexer was created.
    pub cycle: u64,
    pub inserted: EntityCounts,
    /// Entities already present (duplicates).
    pub skipped: EntityCounts,
    pub deferred: Vec<Deferral>,
    pub errors: Vec<SyncError>,
    /// The cycle stopped early on a connectivity failure.
    pub aborted: bool,
}

/// What happened to one entity.
enum Step {
    Inserted(String),
    Duplicate(String),
    Deferred { key: String, waiting_for: String },
}

/// Why one entity could not be processed.
enum Failure {
    /// Record and continue with the next entity.
    Skip(SyncError),
    /// Stop the cycle.
    Abort(SyncError),
}

impl Failure {
    fn source(stage: EntityKind, position: Option<u64>, err: SourceError) -> Self {
        match err {
            SourceError::Connectivity(message) => Self::Abort(SyncError::Connectivity { stage, message }),
            SourceError::Decode(message) => Self::Skip(SyncError::Decode {
                stage,
                position,
                message,
            }),
        }
    }

    fn store(kind: EntityKind, key: &EntityKey, err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => Self::Abort(SyncError::StoreUnavailable { message }),
            other => Self::Skip(SyncError::Rejected {
                kind,
                key: key.to_string(),
                message: other.to_string(),
            }),
        }
    }

    /// Any failure while fetching a whole topic stops the cycle.
    fn into_abort(self) -> SyncError {
        match self {
            Self::Skip(e) | Self::Abort(e) => e,
        }
    }
}

/// Deferral counters that survive between cycles, keyed by kind and key.
#[derive(Debug, Default)]
struct IndexerState {
    cycles: u64,
    deferrals: HashMap<(EntityKind, String), u32>,
}

/// Bookkeeping for the cycle in progress.
struct Cycle<'a> {
    outcome: SyncOutcome,
    deferrals: &'a mut HashMap<(EntityKind, String), u32>,
    max_deferred_cycles: u32,
}

impl Cycle<'_> {
    fn record(&mut self, kind: EntityKind, step: Step) {
        match step {
            Step::Inserted(key) => {
                debug!(%kind, %key, "materialized");
                self.outcome.inserted.bump(kind);
                self.deferrals.remove(&(kind, key));
            }
            Step::Duplicate(key) => {
                self.outcome.skipped.bump(kind);
                self.deferrals.remove(&(kind, key));
            }
            Step::Deferred { key, waiting_for } => {
                let cycles = self.deferrals.entry((kind, key.clone())).or_insert(0);
                *cycles += 1;
                let cycles = *cycles;
                warn!(%kind, %key, %waiting_for, cycles, "deferred until parent is materialized");
                if cycles >= self.max_deferred_cycles {
                    self.outcome.errors.push(SyncError::DependencyStalled {
                        kind,
                        key: key.clone(),
                        parent: waiting_for.clone(),
                        cycles,
                    });
                }
                self.outcome.deferred.push(Deferral {
                    kind,
                    key,
                    waiting_for,
                    cycles,
                });
            }
        }
    }

    /// Forget the deferral counter of an entity whose parent is now present.
    fn resolve(&mut self, kind: EntityKind, key: &str) {
        self.deferrals.remove(&(kind, key.to_string()));
    }

    /// Apply a per-entity result; only an abort is passed back up.
    fn apply(&mut self, kind: EntityKind, result: Result<Step, Failure>) -> Result<(), SyncError> {
        match result {
            Ok(step) => {
                self.record(kind, step);
                Ok(())
            }
            Err(Failure::Skip(err)) => {
                warn!(error = %err, "skipping entity");
                self.outcome.errors.push(err);
                Ok(())
            }
            Err(Failure::Abort(err)) => Err(err),
        }
    }
}

/// Keeps the relational store consistent with the chain event source.
pub struct EventIndexer {
    source: Arc<dyn ChainEventSource>,
    store: Arc<dyn RelationalStore>,
    max_deferred_cycles: u32,
    /// Run-lock: one cycle at a time.
    state: Mutex<IndexerState>,
}

impl EventIndexer {
    pub fn new(source: Arc<dyn ChainEventSource>, store: Arc<dyn RelationalStore>) -> Self {
        Self {
            source,
            store,
            max_deferred_cycles: DEFAULT_MAX_DEFERRED_CYCLES,
            state: Mutex::new(IndexerState::default()),
        }
    }

    #[must_use]
    pub fn with_max_deferred_cycles(mut self, max: u32) -> Self {
        self.max_deferred_cycles = max.max(1);
        self
    }

    /// Run one synchronization cycle. Concurrent callers are serialized.
    pub async fn synchronize(&self) -> SyncOutcome {
        let mut state = self.state.lock().await;
        state.cycles += 1;
        let cycle_no = state.cycles;

        let mut cycle = Cycle {
            outcome: SyncOutcome {
                cycle: cycle_no,
                ..SyncOutcome::default()
            },
            deferrals: &mut state.deferrals,
            max_deferred_cycles: self.max_deferred_cycles,
        };

        let result = self.run_cycle(&mut cycle).await;

        let mut outcome = cycle.outcome;
        if let Err(err) = result {
            error!(cycle = cycle_no, error = %err, "sync cycle aborted");
            outcome.errors.push(err);
            outcome.aborted = true;
        }

        info!(
            cycle = cycle_no,
            inserted = outcome.inserted.total(),
            skipped = outcome.skipped.total(),
            deferred = outcome.deferred.len(),
            errors = outcome.errors.len(),
            aborted = outcome.aborted,
            "sync cycle finished"
        );
        outcome
    }

    /// Producers, then products, then stages.
    async fn run_cycle(&self, cycle: &mut Cycle<'_>) -> Result<(), SyncError> {
        self.sync_producers(cycle).await?;
        self.sync_products(cycle).await?;
        self.sync_stages(cycle).await
    }

    async fn fetch(&self, topic: Topic, stage: EntityKind) -> Result<Vec<RawEvent>, SyncError> {
        self.source
            .events(topic, 0)
            .await
            .map_err(|e| Failure::source(stage, None, e).into_abort())
    }

    fn exists(&self, kind: EntityKind, key: &EntityKey) -> Result<bool, Failure> {
        self.store
            .exists(key)
            .map_err(|e| Failure::store(kind, key, e))
    }

    fn insert(&self, entity: &Entity) -> Result<(), Failure> {
        self.store
            .insert(entity)
            .map_err(|e| Failure::store(entity.kind(), &entity.key(), e))
    }

    async fn sync_producers(&self, cycle: &mut Cycle<'_>) -> Result<(), SyncError> {
        let events = self.fetch(Topic::ProducerAdded, EntityKind::Producer).await?;
        for raw in &events {
            let result = self.producer_step(raw);
            cycle.apply(EntityKind::Producer, result)?;
        }
        Ok(())
    }

    fn producer_step(&self, raw: &RawEvent) -> Result<Step, Failure> {
        let event: ProducerAdded = raw
            .decode()
            .map_err(|e| Failure::source(EntityKind::Producer, Some(raw.position), e))?;
        let key = EntityKey::Producer(event.id.clone());
        if self.exists(EntityKind::Producer, &key)? {
            return Ok(Step::Duplicate(event.id));
        }
        self.insert(&Entity::Producer(Producer {
            id: event.id.clone(),
            name: event.name,
            region: event.region,
        }))?;
        Ok(Step::Inserted(event.id))
    }

    async fn sync_products(&self, cycle: &mut Cycle<'_>) -> Result<(), SyncError> {
        let events = self
            .fetch(Topic::ProductRegistered, EntityKind::Product)
            .await?;
        for raw in &events {
            let result = self.product_step(raw).await;
            cycle.apply(EntityKind::Product, result)?;
        }
        Ok(())
    }

    async fn product_step(&self, raw: &RawEvent) -> Result<Step, Failure> {
        let kind = EntityKind::Product;
        let decode_err = |e: SourceError| Failure::source(kind, Some(raw.position), e);

        let event: ProductRegistered = raw.decode().map_err(decode_err)?;
        let key = EntityKey::Product(event.id.clone());
        if self.exists(kind, &key)? {
            return Ok(Step::Duplicate(event.id));
        }
        if !self.exists(kind, &EntityKey::Producer(event.producer_id.clone()))? {
            return Ok(Step::Deferred {
                key: event.id,
                waiting_for: format!("producer {}", event.producer_id),
            });
        }

        let detail = self
            .source
            .call(FN_GET_PRODUCT, &[json!(event.id)])
            .await
            .map_err(decode_err)?;
        let region: String = tuple_field(&detail, 3, FN_GET_PRODUCT).map_err(decode_err)?;
        let harvested_at: i64 = tuple_field(&detail, 4, FN_GET_PRODUCT).map_err(decode_err)?;
        let organic: bool = tuple_field(&detail, 5, FN_GET_PRODUCT).map_err(decode_err)?;

        self.insert(&Entity::Product(Product {
            id: event.id.clone(),
            name: event.name,
            producer_id: event.producer_id,
            region,
            harvested_at,
            organic,
            market_price: None,
        }))?;
        Ok(Step::Inserted(event.id))
    }

    async fn sync_stages(&self, cycle: &mut Cycle<'_>) -> Result<(), SyncError> {
        let kind = EntityKind::Stage;
        let events = self.fetch(Topic::StageAdded, kind).await?;
        let mut seen = HashSet::new();
        for raw in &events {
            let event: StageAdded = match raw.decode() {
                Ok(event) => event,
                Err(e) => {
                    cycle.apply(kind, Err(Failure::source(kind, Some(raw.position), e)))?;
                    continue;
                }
            };
            // every StageAdded for a product triggers the same full re-read
            if seen.insert(event.product_id.clone()) {
                self.sync_product_stages(&event.product_id, raw.position, cycle)
                    .await?;
            }
        }
        Ok(())
    }

    async fn sync_product_stages(
        &self,
        product_id: &str,
        position: u64,
        cycle: &mut Cycle<'_>,
    ) -> Result<(), SyncError> {
        let kind = EntityKind::Stage;
        let parent = EntityKey::Product(product_id.to_string());
        let deferral_key = format!("stages of {product_id}");
        match self.exists(kind, &parent) {
            Ok(true) => cycle.resolve(kind, &deferral_key),
            Ok(false) => {
                let step = Step::Deferred {
                    key: deferral_key,
                    waiting_for: format!("product {product_id}"),
                };
                return cycle.apply(kind, Ok(step));
            }
            Err(failure) => return cycle.apply(kind, Err(failure)),
        }

        let count = match self.stage_count(product_id, position).await {
            Ok(count) => count,
            Err(failure) => return cycle.apply(kind, Err(failure)),
        };
        for idx in 0..count {
            let result = self.stage_step(product_id, idx, position).await;
            cycle.apply(kind, result)?;
        }
        Ok(())
    }

    async fn stage_count(&self, product_id: &str, position: u64) -> Result<u64, Failure> {
        let decode_err = |e: SourceError| Failure::source(EntityKind::Stage, Some(position), e);
        let reply = self
            .source
            .call(FN_STAGE_COUNT, &[json!(product_id)])
            .await
            .map_err(decode_err)?;
        tuple_field(&reply, 0, FN_STAGE_COUNT).map_err(decode_err)
    }

    /// Fetch stage `idx` of a product and materialize it if unseen.
    ///
    /// The natural key is derived only from `(product_id, idx)`'s detail, so
    /// replays compute the same key every time.
    async fn stage_step(&self, product_id: &str, idx: u64, position: u64) -> Result<Step, Failure> {
        let decode_err = |e: SourceError| Failure::source(EntityKind::Stage, Some(position), e);
        let detail = self
            .source
            .call(FN_GET_STAGE, &[json!(product_id), json!(idx)])
            .await
            .map_err(decode_err)?;
        let stage = StageKey {
            product_id: product_id.to_string(),
            date: tuple_field(&detail, 0, FN_GET_STAGE).map_err(decode_err)?,
            operation: tuple_field(&detail, 1, FN_GET_STAGE).map_err(decode_err)?,
            operator: tuple_field(&detail, 2, FN_GET_STAGE).map_err(decode_err)?,
            place: tuple_field(&detail, 3, FN_GET_STAGE).map_err(decode_err)?,
        };
        let label = stage.to_string();
        if self.exists(EntityKind::Stage, &EntityKey::Stage(stage.clone()))? {
            return Ok(Step::Duplicate(label));
        }
        self.insert(&Entity::Stage(stage))?;
        Ok(Step::Inserted(label))
    }
}

/// Scheduled wrapper around [`EventIndexer::synchronize`].
pub struct SyncJob {
    indexer: Arc<EventIndexer>,
}

impl SyncJob {
    pub fn new(indexer: Arc<EventIndexer>) -> Self {
        Self { indexer }
    }
}

#[async_trait]
impl ScheduledJob for SyncJob {
    fn name(&self) -> &str {
        "synchronize"
    }

    async fn run(&self) -> Result<(), JobError> {
        let outcome = self.indexer.synchronize().await;
        if outcome.aborted {
            let reason = outcome
                .errors
                .last()
                .map_or_else(|| "unknown failure".to_string(), ToString::to_string);
            return Err(JobError::SyncAborted(reason));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemoryEventSource, ProductDetail, StageDetail};
    use crate::store::SqliteStore;

    #[tokio::test]
    async fn stage_deferral_counter_is_cleared_once_product_exists() {
        let source = Arc::new(MemoryEventSource::new());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let indexer = EventIndexer::new(source.clone(), store);

        source.register_product(ProductDetail {
            id: "X1".into(),
            name: "Olives".into(),
            producer_id: "P1".into(),
            region: "Marrakech-Safi".into(),
            harvest_timestamp: 1_700_000_000,
            organic: true,
        });
        source.add_stage(
            "X1",
            StageDetail {
                date: 1_700_000_100,
                operation: "recolte".into(),
                operator: "Cooperative Atlas".into(),
                place: "Marrakech".into(),
            },
        );

        let first = indexer.synchronize().await;
        assert_eq!(first.deferred.len(), 2);
        assert!(indexer
            .state
            .lock()
            .await
            .deferrals
            .contains_key(&(EntityKind::Stage, "stages of X1".to_string())));

        source.add_producer("P1", "Ferme Atlas", "Marrakech-Safi");
        let second = indexer.synchronize().await;
        assert_eq!(second.inserted.stages, 1);
        assert!(second.deferred.is_empty());
        assert!(indexer.state.lock().await.deferrals.is_empty());
    }
}
