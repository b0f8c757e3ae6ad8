//! Deep verifier: reads every chunk of every (or one) known file back off
//! disk and checks it against its stored hash. Never mutates state — the
//! separate, explicit orphan reconciliation sweep (`KeyStore::reconcile_orphans`)
//! is the only operation that edits metadata in response to a bad chunk.

use std::collections::HashMap;

use crate::chunk_store::ChunkStore;
use crate::hash::FileHash;
use crate::metadata::FileRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyErrorKind {
    MissingChunk,
    SizeMismatch,
    HashMismatch,
    UnknownFile,
}

#[derive(Debug, Clone)]
pub struct VerifyError {
    pub file_hash: FileHash,
    pub file_name: String,
    pub chunk_index: u32,
    pub chunk_key: Option<crate::hash::ChunkKey>,
    pub kind: VerifyErrorKind,
}

pub fn verify_all(files: &HashMap<FileHash, FileRecord>, chunk_store: &ChunkStore) -> Vec<VerifyError> {
    let mut errors = Vec::new();
    for record in files.values() {
        verify_record(record, chunk_store, &mut errors);
    }
    errors
}

pub fn verify_file(
    files: &HashMap<FileHash, FileRecord>,
    chunk_store: &ChunkStore,
    hash: &FileHash,
) -> Vec<VerifyError> {
    match files.get(hash) {
        Some(record) => {
            let mut errors = Vec::new();
            verify_record(record, chunk_store, &mut errors);
            errors
        }
        None => vec![VerifyError {
            file_hash: *hash,
            file_name: String::new(),
            chunk_index: 0,
            chunk_key: None,
            kind: VerifyErrorKind::UnknownFile,
        }],
    }
}

fn verify_record(record: &FileRecord, chunk_store: &ChunkStore, errors: &mut Vec<VerifyError>) {
    for (index, slot) in record.references.iter().enumerate() {
        let reference = match slot {
            Some(r) => r,
            None => {
                errors.push(VerifyError {
                    file_hash: record.metadata.file_hash,
                    file_name: record.metadata.file_name.clone(),
                    chunk_index: index as u32,
                    chunk_key: None,
                    kind: VerifyErrorKind::MissingChunk,
                });
                continue;
            }
        };

        let size = match chunk_store.stat_chunk(reference) {
            Ok(s) => s,
            Err(_) => {
                errors.push(VerifyError {
                    file_hash: record.metadata.file_hash,
                    file_name: record.metadata.file_name.clone(),
                    chunk_index: index as u32,
                    chunk_key: Some(reference.chunk_key),
                    kind: VerifyErrorKind::MissingChunk,
                });
                continue;
            }
        };
        if size != reference.size {
            errors.push(VerifyError {
                file_hash: record.metadata.file_hash,
                file_name: record.metadata.file_name.clone(),
                chunk_index: index as u32,
                chunk_key: Some(reference.chunk_key),
                kind: VerifyErrorKind::SizeMismatch,
            });
            continue;
        }

        if chunk_store.load_chunk(reference).is_err() {
            errors.push(VerifyError {
                file_hash: record.metadata.file_hash,
                file_name: record.metadata.file_name.clone(),
                chunk_index: index as u32,
                chunk_key: Some(reference.chunk_key),
                kind: VerifyErrorKind::HashMismatch,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{KeyStore, KeyStoreConfig};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn verify_all_reports_corrupted_chunk() {
        let tmp = TempDir::new().unwrap();
        let store = KeyStore::open(KeyStoreConfig::new(tmp.path())).unwrap();
        let record = store.store_from_memory("v.bin", b"verify me").unwrap();
        let key = record.references[0].as_ref().unwrap().chunk_key;
        fs::write(store.layout().chunk_path(&key), b"tampered!!").unwrap();

        let errors = store.verify_all();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].chunk_index, 0);
    }

    #[test]
    fn verify_file_reports_unknown_hash() {
        let tmp = TempDir::new().unwrap();
        let store = KeyStore::open(KeyStoreConfig::new(tmp.path())).unwrap();
        let errors = store.verify_file(&crate::hash::hash_bytes(b"never stored"));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, VerifyErrorKind::UnknownFile);
    }

    #[test]
    fn verify_all_is_silent_when_clean() {
        let tmp = TempDir::new().unwrap();
        let store = KeyStore::open(KeyStoreConfig::new(tmp.path())).unwrap();
        store.store_from_memory("clean.bin", b"fine").unwrap();
        assert!(store.verify_all().is_empty());
    }
}
