//! Intent log: records an in-flight Store before any chunk is written, so a
//! crash between "chunks written" and "metadata committed" can be cleaned up
//! on the next startup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;

use crate::error::Result;
use crate::hash::{chunk_key, FileHash};
use crate::layout::Layout;
use crate::metadata::MetadataStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRecord {
    pub file_hash_hex: String,
    pub file_name: String,
    pub total_blocks: u32,
    pub block_size: u32,
    /// Nanoseconds since the Unix epoch.
    pub started_at: i64,
}

impl IntentRecord {
    pub fn new(file_hash: &FileHash, file_name: &str, total_blocks: u32, block_size: u32) -> Self {
        IntentRecord {
            file_hash_hex: file_hash.to_hex(),
            file_name: file_name.to_string(),
            total_blocks,
            block_size,
            started_at: crate::metadata::now_nanos(),
        }
    }
}

pub struct IntentLog {
    layout: Layout,
}

impl IntentLog {
    pub fn new(layout: Layout) -> Self {
        IntentLog { layout }
    }

    /// Writes the intent atomically: temp file, then rename within the same
    /// directory. The intent must be visible before any chunk file is
    /// written — callers must call this before `store_chunk`.
    pub fn publish(&self, intent: &IntentRecord) -> Result<()> {
        let final_path = self.layout.intent_path(&FileHash::from_hex(&intent.file_hash_hex)?);
        let dir = final_path.parent().expect("intent path has a parent");
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let json = serde_json::to_vec_pretty(intent)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&final_path)
            .map_err(|e| crate::error::Error::io_failure("persisting intent", e.error))?;
        Ok(())
    }

    pub fn clear(&self, file_hash: &FileHash) -> Result<()> {
        let path = self.layout.intent_path(file_hash);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<std::path::PathBuf>> {
        let dir = self.layout.intents_dir();
        let mut paths = Vec::new();
        if !dir.is_dir() {
            return Ok(paths);
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

/// One intent's outcome during recovery, collected rather than propagated so
/// a single bad intent never aborts recovery of the rest.
#[derive(Debug)]
pub struct RecoveryError {
    pub intent_path: std::path::PathBuf,
    pub reason: String,
}

/// Sweeps `.intents/*.json` on startup. For each intent: malformed files are
/// discarded; intents whose metadata already committed are cleared without
/// touching chunks; otherwise every chunk the intent could have produced is
/// deleted (missing chunks are not an error) before the intent is cleared.
pub fn recover_intents(
    layout: &Layout,
    metadata_store: &MetadataStore,
    chunk_store: &crate::chunk_store::ChunkStore,
) -> Vec<RecoveryError> {
    let log = IntentLog::new(layout.clone());
    let paths = match log.list() {
        Ok(p) => p,
        Err(e) => {
            return vec![RecoveryError {
                intent_path: layout.intents_dir(),
                reason: e.to_string(),
            }]
        }
    };

    let mut errors = Vec::new();
    for path in paths {
        if let Err(e) = recover_one(&path, layout, metadata_store, chunk_store) {
            errors.push(RecoveryError {
                intent_path: path.clone(),
                reason: e.to_string(),
            });
            let _ = fs::remove_file(&path);
        }
    }
    errors
}

fn recover_one(
    path: &std::path::Path,
    layout: &Layout,
    metadata_store: &MetadataStore,
    chunk_store: &crate::chunk_store::ChunkStore,
) -> Result<()> {
    let text = fs::read_to_string(path)?;
    let intent: IntentRecord = match serde_json::from_str(&text) {
        Ok(i) => i,
        Err(_) => {
            fs::remove_file(path)?;
            return Ok(());
        }
    };
    let file_hash = match FileHash::from_hex(&intent.file_hash_hex) {
        Ok(h) => h,
        Err(_) => {
            fs::remove_file(path)?;
            return Ok(());
        }
    };

    if metadata_store.load(&file_hash).is_ok() {
        // The previous run committed after the intent was written but
        // before it was cleared. Chunks are authoritative; leave them be.
        fs::remove_file(path)?;
        return Ok(());
    }

    for i in 0..intent.total_blocks as u64 {
        let key = chunk_key(&file_hash, i);
        chunk_store.delete_chunk(&key)?;
    }
    let _ = layout; // chunk paths are resolved inside chunk_store
    fs::remove_file(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use tempfile::TempDir;

    #[test]
    fn publish_then_clear_round_trips() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path()).unwrap();
        let log = IntentLog::new(layout.clone());
        let hash = hash_bytes(b"intent target");
        let intent = IntentRecord::new(&hash, "name.bin", 3, 65536);

        log.publish(&intent).unwrap();
        assert!(layout.intent_path(&hash).exists());

        log.clear(&hash).unwrap();
        assert!(!layout.intent_path(&hash).exists());
    }

    #[test]
    fn recovery_deletes_orphan_chunks_with_no_metadata() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path()).unwrap();
        let metadata_store = MetadataStore::new(layout.clone());
        let chunk_store = crate::chunk_store::ChunkStore::new(layout.clone(), false);
        let file_hash = hash_bytes(b"crash target");
        let intent = IntentRecord::new(&file_hash, "crash.bin", 3, 4);

        let log = IntentLog::new(layout.clone());
        log.publish(&intent).unwrap();

        for i in 0..3u64 {
            let key = chunk_key(&file_hash, i);
            let data = vec![i as u8; 4];
            let reference = crate::metadata::FileReference::new_file_protocol(
                key,
                file_hash,
                i as u32,
                4,
                "x".to_string(),
                hash_bytes(&data),
            );
            chunk_store.store_chunk(&reference, &data).unwrap();
        }

        let errors = recover_intents(&layout, &metadata_store, &chunk_store);
        assert!(errors.is_empty());

        for i in 0..3u64 {
            let key = chunk_key(&file_hash, i);
            assert!(!layout.chunk_path(&key).exists());
        }
        assert!(!layout.intent_path(&file_hash).exists());
    }

    #[test]
    fn recovery_preserves_chunks_when_metadata_already_committed() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path()).unwrap();
        let metadata_store = MetadataStore::new(layout.clone());
        let chunk_store = crate::chunk_store::ChunkStore::new(layout.clone(), false);
        let file_hash = hash_bytes(b"already committed");
        let intent = IntentRecord::new(&file_hash, "done.bin", 1, 4);
        let log = IntentLog::new(layout.clone());
        log.publish(&intent).unwrap();

        let key = chunk_key(&file_hash, 0);
        let data = b"ABCD".to_vec();
        let reference = crate::metadata::FileReference::new_file_protocol(
            key,
            file_hash,
            0,
            4,
            layout.chunk_path(&key).to_string_lossy().to_string(),
            hash_bytes(&data),
        );
        chunk_store.store_chunk(&reference, &data).unwrap();

        let record = crate::metadata::FileRecord {
            metadata: crate::metadata::MetaData {
                file_hash,
                total_size: 4,
                file_name: "done.bin".to_string(),
                modified: crate::metadata::now_nanos(),
                permissions: crate::metadata::DEFAULT_PERMISSIONS,
                signature: [0u8; 64],
                ttl: 0,
                block_size: 4,
                total_blocks: 1,
            },
            references: vec![Some(reference)],
        };
        metadata_store.write_record(&record).unwrap();

        let errors = recover_intents(&layout, &metadata_store, &chunk_store);
        assert!(errors.is_empty());
        assert!(layout.chunk_path(&key).exists());
        assert!(!layout.intent_path(&file_hash).exists());
    }
}
