//! Data model for the tamper-evident ledger: blocks and the chain that owns them.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::crypto;
use crate::error::LedgerError;
use crate::storage;

/// An ordered key/value record carried by a block.
pub type Record = Map<String, Value>;

/// `previous_hash` of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Position in the chain; genesis is 0.
    pub index: u64,
    /// Seconds since the Unix epoch. Never lower than the predecessor's.
    pub timestamp: f64,
    pub payload: Record,
    /// Hex digest of the predecessor (`"0"` for genesis).
    pub previous_hash: String,
    /// Hex digest of `{index, timestamp, payload, previous_hash}`.
    pub hash: String,
}

/// Fields covered by a block hash.
#[derive(Serialize)]
struct BlockHeader<'a> {
    index: u64,
    timestamp: f64,
    payload: &'a Record,
    previous_hash: &'a str,
}

impl Block {
    fn seal(
        index: u64,
        timestamp: f64,
        payload: Record,
        previous_hash: String,
    ) -> Result<Self, LedgerError> {
        let mut block = Self {
            index,
            timestamp,
            payload,
            previous_hash,
            hash: String::new(),
        };
        block.hash = block.compute_hash()?;
        Ok(block)
    }

    fn genesis(timestamp: f64) -> Result<Self, LedgerError> {
        let mut payload = Record::new();
        payload.insert("message".into(), Value::from("Genesis Block"));
        Self::seal(0, timestamp, payload, GENESIS_PREVIOUS_HASH.to_string())
    }

    fn hash_matches(&self) -> bool {
        self.compute_hash().is_ok_and(|h| h == self.hash)
    }

    /// Recompute the digest from the stored fields.
    pub fn compute_hash(&self) -> Result<String, LedgerError> {
        crypto::digest(&BlockHeader {
            index: self.index,
            timestamp: self.timestamp,
            payload: &self.payload,
            previous_hash: &self.previous_hash,
        })
    }
}

/// A problem found while auditing the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum ChainFault {
    /// Stored hash does not match the block's content.
    HashMismatch { index: u64 },
    /// `previous_hash` does not match the predecessor's hash.
    BrokenLink { index: u64 },
    /// The first block is not a genesis block (index 0, `previous_hash` `"0"`).
    MissingGenesis,
    /// Indexes between two consecutive stored blocks are absent.
    MissingBlocks { after: u64, before: u64 },
}

impl fmt::Display for ChainFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HashMismatch { index } => write!(f, "block {index} hash mismatch"),
            Self::BrokenLink { index } => write!(f, "block {index} previous_hash mismatch"),
            Self::MissingGenesis => f.write_str("genesis block missing"),
            Self::MissingBlocks { after, before } => {
                write!(f, "blocks missing between {after} and {before}")
            }
        }
    }
}

/// Append-only chain of hashed blocks, starting with a sentinel genesis block.
#[derive(Debug)]
pub struct Ledger {
    pub(crate) blocks: Vec<Block>,
    data_dir: Option<PathBuf>,
}

fn now() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

impl Ledger {
    /// In-memory ledger holding only the genesis block.
    pub fn new() -> Result<Self, LedgerError> {
        Ok(Self {
            blocks: vec![Block::genesis(now())?],
            data_dir: None,
        })
    }

    /// Ledger backed by one JSON file per block under `dir`.
    ///
    /// Existing blocks are loaded as stored and checked by [`Ledger::audit`],
    /// not here. A block file that cannot be read back fails the open, so its
    /// index is never reused. An empty directory gets a freshly persisted
    /// genesis block.
    pub fn open(dir: &Path) -> Result<Self, LedgerError> {
        let mut blocks = storage::load_blocks(dir)?;
        if blocks.is_empty() {
            let genesis = Block::genesis(now())?;
            storage::save_block(dir, &genesis)?;
            info!(dir = %dir.display(), "created genesis block");
            blocks.push(genesis);
        } else {
            info!(dir = %dir.display(), blocks = blocks.len(), "loaded ledger from disk");
        }
        Ok(Self {
            blocks,
            data_dir: Some(dir.to_path_buf()),
        })
    }

    /// Seal `payload` into a new block linked to the current tip.
    ///
    /// The block is persisted (when disk-backed) before it becomes visible.
    pub fn append(&mut self, payload: Record) -> Result<Block, LedgerError> {
        let prev = self.latest()?;
        let index = prev.index + 1;
        let timestamp = now().max(prev.timestamp);
        let block = Block::seal(index, timestamp, payload, prev.hash.clone())?;

        if let Some(dir) = &self.data_dir {
            storage::save_block(dir, &block)?;
        }
        debug!(index, hash = %block.hash, "appended block");
        self.blocks.push(block.clone());
        Ok(block)
    }

    pub fn latest(&self) -> Result<&Block, LedgerError> {
        self.blocks.last().ok_or(LedgerError::EmptyChain)
    }

    /// True when the chain starts at genesis, has no index gaps, and every
    /// block hashes to its stored hash and links to its predecessor.
    pub fn verify(&self) -> bool {
        self.audit().is_empty()
    }

    /// Every fault in the chain, in block order.
    pub fn audit(&self) -> Vec<ChainFault> {
        let Some(first) = self.blocks.first() else {
            return vec![ChainFault::MissingGenesis];
        };
        let mut faults = Vec::new();
        if first.index != 0 || first.previous_hash != GENESIS_PREVIOUS_HASH {
            faults.push(ChainFault::MissingGenesis);
        }
        if !first.hash_matches() {
            faults.push(ChainFault::HashMismatch { index: first.index });
        }
        for pair in self.blocks.windows(2) {
            faults.extend(Self::check_pair(&pair[0], &pair[1]));
        }
        faults
    }

    fn check_pair(prev: &Block, current: &Block) -> Vec<ChainFault> {
        let mut faults = Vec::new();
        if prev.index.checked_add(1) != Some(current.index) {
            faults.push(ChainFault::MissingBlocks {
                after: prev.index,
                before: current.index,
            });
        }
        if !current.hash_matches() {
            faults.push(ChainFault::HashMismatch {
                index: current.index,
            });
        }
        if current.previous_hash != prev.hash {
            faults.push(ChainFault::BrokenLink {
                index: current.index,
            });
        }
        faults
    }

    fn records(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.index != 0)
    }

    /// Payloads in append order, genesis excluded.
    pub fn history(&self) -> Vec<Record> {
        self.records().map(|b| b.payload.clone()).collect()
    }

    /// Payload of the block with `index`. The genesis block is not a record.
    pub fn get(&self, index: u64) -> Result<&Record, LedgerError> {
        if index == 0 {
            return Err(LedgerError::NotFound(index));
        }
        self.blocks
            .binary_search_by_key(&index, |b| b.index)
            .map(|i| &self.blocks[i].payload)
            .map_err(|_| LedgerError::NotFound(index))
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Number of records, genesis excluded.
    pub fn len(&self) -> usize {
        self.records().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
