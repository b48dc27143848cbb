//! Disk persistence for ledger blocks (one JSON file per block).

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::LedgerError;
use crate::model::Block;

/// Ensure that the given directory exists (create recursively if needed).
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Compute the JSON filename for a block index.
pub fn block_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("block_{index}.json"))
}

/// Write a block to disk as `block_<index>.json` (pretty-printed).
///
/// The file is written under a temporary name and renamed into place, so a
/// crash never leaves a half-written block behind.
pub fn save_block(dir: &Path, block: &Block) -> io::Result<()> {
    ensure_dir(dir)?;
    let json = serde_json::to_string_pretty(block)?;
    let tmp = dir.join(format!(".block_{}.json.tmp", block.index));
    {
        let mut f = File::create(&tmp)?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(tmp, block_path(dir, block.index))
}

/// Index encoded in a `block_<index>.json` file name.
fn file_index(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("block_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Load all `block_<index>.json` files from the directory and sort by index.
///
/// Other files are ignored. A block file that does not parse, or whose
/// content carries a different index than its name, is a
/// [`LedgerError::CorruptBlock`].
pub fn load_blocks(dir: &Path) -> Result<Vec<Block>, LedgerError> {
    ensure_dir(dir)?;
    let mut out = vec![];
    for entry in fs::read_dir(dir)? {
        let p = entry?.path();
        let Some(index) = file_index(&p) else {
            debug!(path = %p.display(), "ignoring non-block file");
            continue;
        };
        let mut buf = String::new();
        File::open(&p)?.read_to_string(&mut buf)?;
        let block: Block = serde_json::from_str(&buf).map_err(|e| LedgerError::CorruptBlock {
            path: p.clone(),
            reason: e.to_string(),
        })?;
        if block.index != index {
            return Err(LedgerError::CorruptBlock {
                path: p,
                reason: format!("file holds block {}", block.index),
            });
        }
        out.push(block);
    }
    out.sort_by_key(|b| b.index);
    Ok(out)
}
