//! Hash and key primitives: the file hash, the chunk-key derivation, and the
//! block-size calculator. Every component downstream depends only on these.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::error::{Error, Result};

pub const MIN_BLOCK: u32 = 64 * 1024;
pub const MAX_BLOCK: u32 = 4 * 1024 * 1024;
pub const TARGET_BLOCKS: u64 = 1000;

/// The SHA-256 of a file's complete contents. Primary key for a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHash(pub [u8; 32]);

impl FileHash {
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::BadArgument {
            reason: format!("malformed file hash hex: {s}"),
        })?;
        let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| Error::BadArgument {
            reason: format!("file hash must be 32 bytes, got {}", bytes.len()),
        })?;
        Ok(FileHash(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for FileHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FileHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FileHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// The 20-byte deterministic routing identifier for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey(pub [u8; 20]);

impl ChunkKey {
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::BadArgument {
            reason: format!("malformed chunk key hex: {s}"),
        })?;
        let arr: [u8; 20] = bytes.as_slice().try_into().map_err(|_| Error::BadArgument {
            reason: format!("chunk key must be 20 bytes, got {}", bytes.len()),
        })?;
        Ok(ChunkKey(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ChunkKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChunkKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Canonical chunk-key derivation: `SHA1(file_hash || u64_le(index))`. Every
/// producer and consumer of a chunk key must route through this function.
pub fn chunk_key(file_hash: &FileHash, index: u64) -> ChunkKey {
    let mut hasher = Sha1::new();
    hasher.update(file_hash.as_bytes());
    hasher.update(index.to_le_bytes());
    let digest = hasher.finalize();
    ChunkKey(digest.into())
}

/// SHA-256 over an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> FileHash {
    let digest = Sha256::digest(data);
    FileHash(digest.into())
}

/// Streaming SHA-256 over a file's contents; returns the hash and the byte count read.
pub fn hash_file<P: AsRef<Path>>(path: P) -> Result<(FileHash, u64)> {
    let mut file = File::open(path.as_ref())
        .map_err(|e| Error::io_failure(format!("opening {}", path.as_ref().display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((FileHash(hasher.finalize().into()), total))
}

/// Streaming SHA-256 over any reader; returns the hash and the byte count read.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(FileHash, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((FileHash(hasher.finalize().into()), total))
}

/// Rounds `x` to the nearest integer, ties resolving to the even neighbour.
/// Written out explicitly rather than relying on a specific toolchain's
/// `f64::round_ties_even` availability.
fn round_half_to_even(x: f64) -> f64 {
    let floor = x.floor();
    let diff = x - floor;
    if diff < 0.5 {
        floor
    } else if diff > 0.5 {
        floor + 1.0
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    }
}

fn nearest_power_of_two(x: f64) -> u32 {
    if x <= 1.0 {
        return 1;
    }
    let exponent = round_half_to_even(x.log2());
    2f64.powf(exponent) as u32
}

/// Derives the block size for a file of the given total size. Zero-size files
/// get a zero block size; small files get one block the size of the whole
/// file; otherwise the block size targets `TARGET_BLOCKS` chunks and is
/// snapped to the nearest power of two, clamped to `[MIN_BLOCK, MAX_BLOCK]`.
pub fn block_size(file_size: u64) -> u32 {
    if file_size == 0 {
        return 0;
    }
    if file_size < MIN_BLOCK as u64 {
        return file_size as u32;
    }
    let target = file_size as f64 / TARGET_BLOCKS as f64;
    nearest_power_of_two(target).clamp(MIN_BLOCK, MAX_BLOCK)
}

/// `TotalBlocks` for a file of the given size and block size.
pub fn total_blocks(file_size: u64, block_size: u32) -> u32 {
    if file_size == 0 {
        return 0;
    }
    let bs = block_size as u64;
    (file_size.div_ceil(bs)) as u32
}
