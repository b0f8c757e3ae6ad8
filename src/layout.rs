//! On-disk layout: directory creation and deterministic path resolution for
//! chunks, metadata, cache markers, and intents.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::hash::{ChunkKey, FileHash};

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new<P: AsRef<Path>>(storage_root: P) -> Result<Self> {
        let layout = Layout {
            root: storage_root.as_ref().to_path_buf(),
        };
        layout.ensure_dirs()?;
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(".cache")
    }

    pub fn intents_dir(&self) -> PathBuf {
        self.root.join(".intents")
    }

    fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.data_dir(),
            self.metadata_dir(),
            self.cache_dir(),
            self.intents_dir(),
        ] {
            fs::create_dir_all(&dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = fs::Permissions::from_mode(0o755);
                let _ = fs::set_permissions(&dir, perms);
            }
        }
        Ok(())
    }

    pub fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.data_dir().join(format!("{}.kdht", key.to_hex()))
    }

    pub fn metadata_path(&self, hash: &FileHash) -> PathBuf {
        self.metadata_dir().join(format!("{}.toml", hash.to_hex()))
    }

    pub fn cache_path(&self, hash: &FileHash) -> PathBuf {
        self.cache_dir().join(format!("{}.toml", hash.to_hex()))
    }

    pub fn intent_path(&self, hash: &FileHash) -> PathBuf {
        self.intents_dir().join(format!("{}.json", hash.to_hex()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_expected_subdirectories() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path()).unwrap();
        assert!(layout.data_dir().is_dir());
        assert!(layout.metadata_dir().is_dir());
        assert!(layout.cache_dir().is_dir());
        assert!(layout.intents_dir().is_dir());
    }

    #[test]
    fn chunk_path_uses_kdht_extension() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path()).unwrap();
        let key = ChunkKey([7u8; 20]);
        let path = layout.chunk_path(&key);
        assert!(path.to_string_lossy().ends_with(".kdht"));
        assert!(path.starts_with(layout.data_dir()));
    }
}
