//! Tamper-evident provenance ledger and chain event indexer.
//!
//! Two parts share one job, keeping an ordered, verifiable, non-duplicating
//! record of real-world provenance events:
//!
//! - [`integrity::IntegrityFacade`] seals locally authored records into a
//!   SHA-256 hash chain ([`model::Ledger`]) and checks it later.
//! - [`indexer::EventIndexer`] replays an authoritative external event log
//!   ([`source::ChainEventSource`]) into a relational store
//!   ([`store::RelationalStore`]) exactly once per natural key.
//!
//! [`scheduler::Scheduler`] drives the indexer and the price refresh.

pub mod config;
pub mod crypto;
pub mod error;
pub mod indexer;
pub mod integrity;
pub mod model;
pub mod pricing;
pub mod routes;
pub mod rpc;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod store;

use std::sync::Arc;

use integrity::IntegrityFacade;
use indexer::EventIndexer;

/// Shared application context handed to HTTP handlers and jobs.
#[derive(Clone)]
pub struct AppState {
    pub integrity: Arc<IntegrityFacade>,
    pub indexer: Arc<EventIndexer>,
}
