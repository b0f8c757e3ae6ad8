//! The per-file metadata record and its sidecar (de)serialization.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};
use crate::hash::FileHash;
use crate::layout::Layout;

/// Default POSIX permissions for a newly stored file: owner read/write.
pub const DEFAULT_PERMISSIONS: u32 = 0o600;

/// Per-file metadata, independent of which chunks are locally present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaData {
    pub file_hash: FileHash,
    pub total_size: u64,
    pub file_name: String,
    /// Nanoseconds since the Unix epoch.
    pub modified: i64,
    pub permissions: u32,
    /// Reserved, opaque, never verified.
    #[serde(with = "signature_hex")]
    pub signature: [u8; 64],
    /// Seconds; 0 means "never expires".
    pub ttl: u64,
    pub block_size: u32,
    pub total_blocks: u32,
}

impl MetaData {
    pub fn touch_now(&mut self) {
        self.modified = now_nanos();
    }
}

/// Nanoseconds since the Unix epoch. Fits in `i64` until the year 2262; the
/// `toml` crate's serializer only supports `i64` integers, so every field
/// that round-trips through a TOML sidecar must stay within that range.
pub fn now_nanos() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

mod signature_hex {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        hex::encode(sig).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }
}

/// Per-chunk reference, linking a routing key to its on-disk bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileReference {
    pub chunk_key: crate::hash::ChunkKey,
    pub parent: FileHash,
    pub file_index: u32,
    pub size: u64,
    pub location: String,
    pub protocol: String,
    pub data_hash: FileHash,
}

impl FileReference {
    pub fn new_file_protocol(
        chunk_key: crate::hash::ChunkKey,
        parent: FileHash,
        file_index: u32,
        size: u64,
        location: String,
        data_hash: FileHash,
    ) -> Self {
        FileReference {
            chunk_key,
            parent,
            file_index,
            size,
            location,
            protocol: "file".to_string(),
            data_hash,
        }
    }
}

/// A complete file record: metadata plus its ordered chunk references.
/// `references[i] == None` means "chunk not present locally".
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub metadata: MetaData,
    pub references: Vec<Option<FileReference>>,
}

/// The on-disk shape: a dense list of only the present references, each
/// carrying its own ordinal so order survives a format (TOML) with no
/// native representation for "hole in an array".
#[derive(Debug, Serialize, Deserialize)]
struct OnDiskRecord {
    metadata: MetaData,
    references: Vec<FileReference>,
}

impl FileRecord {
    pub fn present_references(&self) -> impl Iterator<Item = &FileReference> {
        self.references.iter().filter_map(|r| r.as_ref())
    }

    fn to_on_disk(&self) -> OnDiskRecord {
        OnDiskRecord {
            metadata: self.metadata.clone(),
            references: self.present_references().cloned().collect(),
        }
    }

    fn from_on_disk(disk: OnDiskRecord) -> Self {
        let total = disk.metadata.total_blocks as usize;
        let mut references: Vec<Option<FileReference>> = vec![None; total];
        for r in disk.references {
            // A location filled in means the chunk is locally present.
            if r.location.is_empty() {
                continue;
            }
            let idx = r.file_index as usize;
            if idx < references.len() {
                references[idx] = Some(r);
            }
        }
        FileRecord {
            metadata: disk.metadata,
            references,
        }
    }
}

/// Writes and reads the TOML sidecar files under `metadata/` (and shares the
/// same shape for `.cache/` markers).
pub struct MetadataStore {
    layout: Layout,
}

impl MetadataStore {
    pub fn new(layout: Layout) -> Self {
        MetadataStore { layout }
    }

    pub fn write_record(&self, record: &FileRecord) -> Result<()> {
        self.write_to(&self.layout.metadata_path(&record.metadata.file_hash), record)
    }

    pub fn write_cache_marker(&self, record: &FileRecord) -> Result<()> {
        self.write_to(&self.layout.cache_path(&record.metadata.file_hash), record)
    }

    fn write_to(&self, path: &Path, record: &FileRecord) -> Result<()> {
        let disk = record.to_on_disk();
        let text = toml::to_string_pretty(&disk)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn load_from(&self, path: &Path) -> Result<FileRecord> {
        let text = fs::read_to_string(path)
            .map_err(|_| Error::not_found(format!("metadata file {}", path.display())))?;
        let disk: OnDiskRecord = toml::from_str(&text)?;
        Ok(FileRecord::from_on_disk(disk))
    }

    pub fn load(&self, hash: &FileHash) -> Result<FileRecord> {
        self.load_from(&self.layout.metadata_path(hash))
    }

    pub fn load_cache_marker(&self, hash: &FileHash) -> Result<FileRecord> {
        self.load_from(&self.layout.cache_path(hash))
    }

    pub fn remove(&self, hash: &FileHash) -> Result<()> {
        let path = self.layout.metadata_path(hash);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn remove_cache_marker(&self, hash: &FileHash) -> Result<()> {
        let path = self.layout.cache_path(hash);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn cache_marker_exists(&self, hash: &FileHash) -> bool {
        self.layout.cache_path(hash).exists()
    }

    /// Scans the metadata directory, decoding every `*.toml` whose filename
    /// matches the expected hex-hash prefix; anything else is skipped.
    pub fn load_all(&self) -> Result<Vec<FileRecord>> {
        let mut records = Vec::new();
        let dir = self.layout.metadata_dir();
        if !dir.is_dir() {
            return Ok(records);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s,
                None => continue,
            };
            if FileHash::from_hex(stem).is_err() {
                continue;
            }
            match self.load_from(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable metadata file");
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{chunk_key, hash_bytes};
    use tempfile::TempDir;

    fn sample_record() -> FileRecord {
        let file_hash = hash_bytes(b"sample file contents");
        let key = chunk_key(&file_hash, 0);
        let data_hash = hash_bytes(b"sample file contents");
        let metadata = MetaData {
            file_hash,
            total_size: 21,
            file_name: "sample.bin".to_string(),
            modified: now_nanos(),
            permissions: DEFAULT_PERMISSIONS,
            signature: [0u8; 64],
            ttl: 0,
            block_size: 21,
            total_blocks: 1,
        };
        let reference = FileReference::new_file_protocol(
            key,
            file_hash,
            0,
            21,
            "/tmp/data/x.kdht".to_string(),
            data_hash,
        );
        FileRecord {
            metadata,
            references: vec![Some(reference)],
        }
    }

    #[test]
    fn round_trips_through_toml() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path()).unwrap();
        let store = MetadataStore::new(layout);
        let record = sample_record();

        store.write_record(&record).unwrap();
        let loaded = store.load(&record.metadata.file_hash).unwrap();

        assert_eq!(loaded.metadata, record.metadata);
        assert_eq!(loaded.references.len(), 1);
        assert_eq!(
            loaded.references[0].as_ref().unwrap().chunk_key,
            record.references[0].as_ref().unwrap().chunk_key
        );
    }

    #[test]
    fn load_all_skips_unrelated_files() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path()).unwrap();
        let store = MetadataStore::new(layout.clone());
        store.write_record(&sample_record()).unwrap();
        fs::write(layout.metadata_dir().join("not-a-hash.toml"), "garbage").unwrap();
        fs::write(layout.metadata_dir().join("notes.txt"), "ignored").unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn missing_location_is_treated_as_absent() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path()).unwrap();
        let store = MetadataStore::new(layout);
        let mut record = sample_record();
        record.references[0].as_mut().unwrap().location.clear();
        store.write_record(&record).unwrap();

        let loaded = store.load(&record.metadata.file_hash).unwrap();
        assert!(loaded.references[0].is_none());
    }
}
