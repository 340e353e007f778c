//! Tests for the pluggable AuditSink / forward sink functionality.

use std::sync::{Arc, Mutex};

use datavault::audit::{AuditAction, AuditRecord, AuditSink, FileAuditSink};
use datavault::{Vault, VaultConfig};

/// A test sink that collects records into a shared Vec.
struct SharedVecSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl AuditSink for SharedVecSink {
    fn append(&mut self, record: AuditRecord) {
        self.records.lock().unwrap().push(record);
    }
}

#[test]
fn test_forward_sink_receives_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut vault = Vault::open(VaultConfig::for_testing(dir.path()), "passphrase").unwrap();

    let records = Arc::new(Mutex::new(Vec::new()));
    vault.add_audit_sink(Box::new(SharedVecSink {
        records: Arc::clone(&records),
    }));

    vault.store_document("medical", "vax-1", b"record").unwrap();
    vault.retrieve_document("medical", "vax-1").unwrap();

    // Primary log has both records.
    assert_eq!(vault.audit_log().len(), 2);

    // Forward sink received the same records.
    let collected = records.lock().unwrap();
    assert_eq!(collected.len(), 2);
    assert_eq!(collected[0].action, AuditAction::DocumentStored);
    assert_eq!(collected[1].action, AuditAction::DocumentRetrieved);
    assert_eq!(collected[1].subject, "medical/vax-1");
}

#[test]
fn test_failed_operations_are_not_logged() {
    let dir = tempfile::tempdir().unwrap();
    let mut vault = Vault::open(VaultConfig::for_testing(dir.path()), "passphrase").unwrap();

    assert!(vault.retrieve_document("medical", "missing").is_err());
    assert!(vault.delete_document("medical", "missing").is_err());
    assert!(vault.audit_log().is_empty());
}

#[test]
fn test_file_sink_survives_vault_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = VaultConfig::for_testing(dir.path().join("vault"));
    let log_path = dir.path().join("audit.jsonl");

    for id in ["a", "b"] {
        let mut vault = Vault::open(config.clone(), "passphrase").unwrap();
        vault.add_audit_sink(Box::new(FileAuditSink::new(&log_path).unwrap()));
        vault.store_document("identity", id, b"x").unwrap();
    }

    let contents = std::fs::read_to_string(&log_path).unwrap();
    let subjects: Vec<String> = contents
        .lines()
        .map(|l| serde_json::from_str::<AuditRecord>(l).unwrap().subject)
        .collect();
    assert_eq!(subjects, vec!["identity/a", "identity/b"]);
}
