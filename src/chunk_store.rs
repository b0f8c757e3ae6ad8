//! Reads, writes, verifies and deletes individual chunk files. Has no
//! knowledge of the in-memory indexes; callers (the engine) resolve a key to
//! a reference before calling in here.

use std::fs::{self, File};
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::hash::hash_bytes;
use crate::layout::Layout;
use crate::metadata::FileReference;

pub struct ChunkStore {
    layout: Layout,
    verify_on_write: bool,
}

impl ChunkStore {
    pub fn new(layout: Layout, verify_on_write: bool) -> Self {
        ChunkStore {
            layout,
            verify_on_write,
        }
    }

    /// Validates size and hash against `reference`, writes the bytes, and
    /// (if configured) reads them back to verify the write landed intact.
    pub fn store_chunk(&self, reference: &FileReference, data: &[u8]) -> Result<()> {
        if data.len() as u64 != reference.size {
            return Err(Error::SizeMismatch {
                what: format!("chunk {}", reference.chunk_key),
                expected: reference.size,
                actual: data.len() as u64,
            });
        }
        if hash_bytes(data) != reference.data_hash {
            return Err(Error::HashMismatch {
                what: format!("chunk {}", reference.chunk_key),
            });
        }

        let path = self.layout.chunk_path(&reference.chunk_key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        file.write_all(data)?;
        file.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o644));
        }

        if self.verify_on_write {
            let read_back = fs::read(&path)?;
            if read_back != data {
                return Err(Error::Corruption {
                    reason: format!("readback of {} did not match what was written", path.display()),
                });
            }
        }
        Ok(())
    }

    /// Reads a chunk's bytes, recomputing SHA-256 and comparing to the
    /// reference's stored `data_hash`.
    pub fn load_chunk(&self, reference: &FileReference) -> Result<Vec<u8>> {
        let path = self.layout.chunk_path(&reference.chunk_key);
        let mut file = File::open(&path)
            .map_err(|_| Error::not_found(format!("chunk file {}", path.display())))?;
        let mut data = Vec::with_capacity(reference.size as usize);
        file.read_to_end(&mut data)?;

        if data.len() as u64 != reference.size {
            return Err(Error::Corruption {
                reason: format!(
                    "chunk {} size on disk ({}) does not match recorded size ({})",
                    reference.chunk_key,
                    data.len(),
                    reference.size
                ),
            });
        }
        if hash_bytes(&data) != reference.data_hash {
            return Err(Error::HashMismatch {
                what: format!("chunk {}", reference.chunk_key),
            });
        }
        Ok(data)
    }

    /// Stats and size-checks a chunk file without reading its bytes.
    pub fn stat_chunk(&self, reference: &FileReference) -> Result<u64> {
        let path = self.layout.chunk_path(&reference.chunk_key);
        let meta = fs::metadata(&path)
            .map_err(|_| Error::not_found(format!("chunk file {}", path.display())))?;
        Ok(meta.len())
    }

    /// Removing a missing chunk file is not an error.
    pub fn delete_chunk(&self, key: &crate::hash::ChunkKey) -> Result<()> {
        let path = self.layout.chunk_path(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
