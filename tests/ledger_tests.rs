//! End-to-end tests for the integrity facade over a disk-backed ledger.

use std::fs;

use provenance_ledger::{
    error::LedgerError,
    integrity::IntegrityFacade,
    model::{Block, ChainFault},
    storage,
};
use serde_json::json;

#[test]
fn secured_record_is_verifiable() {
    let dir = tempfile::tempdir().unwrap();
    let facade = IntegrityFacade::open(dir.path()).unwrap();

    let digest = facade
        .secure(&json!({"type": "producteur", "nom": "Ferme Atlas", "region": "Marrakech-Safi"}))
        .unwrap();

    assert_eq!(digest.len(), 64);
    assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
    assert!(facade.verify_exists(&digest));
    assert!(facade.is_valid());
}

#[test]
fn fresh_ledger_has_empty_history() {
    let dir = tempfile::tempdir().unwrap();
    let facade = IntegrityFacade::open(dir.path()).unwrap();
    assert!(facade.history().is_empty());
    assert!(facade.is_valid());
    // genesis is persisted
    assert!(storage::block_path(dir.path(), 0).exists());
}

#[test]
fn corrupting_a_stored_payload_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let (first, second) = {
        let facade = IntegrityFacade::open(dir.path()).unwrap();
        let first = facade
            .secure(&json!({"type": "produit", "nom": "Olives", "qualite_score": 8.5}))
            .unwrap();
        let second = facade
            .secure(&json!({"type": "produit", "nom": "Dattes", "qualite_score": 9.2}))
            .unwrap();
        (first, second)
    };

    // edit block 1 on disk without touching its hash
    let path = storage::block_path(dir.path(), 1);
    let mut block: Block = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    block.payload.insert("qualite_score".into(), json!(10.0));
    fs::write(&path, serde_json::to_string_pretty(&block).unwrap()).unwrap();

    let facade = IntegrityFacade::open(dir.path()).unwrap();
    assert!(!facade.is_valid());
    assert_eq!(facade.audit(), vec![ChainFault::HashMismatch { index: 1 }]);

    // lookups compare stored hashes only
    assert!(facade.verify_exists(&second));
    assert!(facade.verify_exists(&first));
}

#[test]
fn reopened_ledger_continues_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    {
        let facade = IntegrityFacade::open(dir.path()).unwrap();
        facade.secure(&json!({"n": 1})).unwrap();
    }
    let facade = IntegrityFacade::open(dir.path()).unwrap();
    let digest = facade.secure(&json!({"n": 2})).unwrap();

    assert!(facade.is_valid());
    assert!(facade.verify_exists(&digest));
    let history = facade.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["n"], 1);
    assert_eq!(history[1]["n"], 2);
}

#[test]
fn deleting_a_block_file_breaks_linkage() {
    let dir = tempfile::tempdir().unwrap();
    {
        let facade = IntegrityFacade::open(dir.path()).unwrap();
        for n in 0..3 {
            facade.secure(&json!({ "n": n })).unwrap();
        }
    }
    fs::remove_file(storage::block_path(dir.path(), 2)).unwrap();

    let facade = IntegrityFacade::open(dir.path()).unwrap();
    assert!(!facade.is_valid());
    let faults = facade.audit();
    assert!(faults.contains(&ChainFault::MissingBlocks { after: 1, before: 3 }));
    assert!(faults.contains(&ChainFault::BrokenLink { index: 3 }));
}

#[test]
fn deleted_genesis_exposes_the_unchecked_head() {
    let dir = tempfile::tempdir().unwrap();
    {
        let facade = IntegrityFacade::open(dir.path()).unwrap();
        facade.secure(&json!({"n": 1})).unwrap();
        facade.secure(&json!({"n": 2})).unwrap();
    }
    let path = storage::block_path(dir.path(), 1);
    let mut block: Block = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    block.payload.insert("n".into(), json!(999));
    fs::write(&path, serde_json::to_string_pretty(&block).unwrap()).unwrap();
    fs::remove_file(storage::block_path(dir.path(), 0)).unwrap();

    let facade = IntegrityFacade::open(dir.path()).unwrap();
    assert!(!facade.is_valid());
    let faults = facade.audit();
    assert!(faults.contains(&ChainFault::MissingGenesis));
    assert!(faults.contains(&ChainFault::HashMismatch { index: 1 }));
    assert_eq!(facade.history().len(), 2);
    assert_eq!(facade.get(2).unwrap()["n"], 2);
    // no fresh genesis is written over the evidence
    assert!(!storage::block_path(dir.path(), 0).exists());
}

#[test]
fn corrupted_tip_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let facade = IntegrityFacade::open(dir.path()).unwrap();
        facade.secure(&json!({"n": 1})).unwrap();
        facade.secure(&json!({"n": 2})).unwrap();
    }
    let tip = storage::block_path(dir.path(), 2);
    fs::write(&tip, "{garbage").unwrap();

    assert!(matches!(
        IntegrityFacade::open(dir.path()),
        Err(LedgerError::CorruptBlock { .. })
    ));
    // the damaged file stays in place for inspection
    assert_eq!(fs::read_to_string(&tip).unwrap(), "{garbage");
    assert!(!storage::block_path(dir.path(), 3).exists());
}
