//! Chunk identity — fixed-size fragments named by their SHA-1 digest.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sha1::{Digest, Sha1};

/// Every chunk is exactly this many bytes.
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Length of a SHA-1 digest.
pub const DIGEST_LEN: usize = 20;

/// A chunk's SHA-1 digest. The lowercase hex rendering is the key used
/// in request files and serialized inventories.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHash([u8; DIGEST_LEN]);

impl ChunkHash {
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// `None` unless the slice is exactly [`DIGEST_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Digest of the given bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex form, the key used in files and logs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", self.to_hex())
    }
}

impl FromStr for ChunkHash {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|_| DigestError::BadHex)?;
        Self::from_slice(&raw).ok_or(DigestError::BadLength(raw.len()))
    }
}

// Serialized as the lowercase hex string, so inventory files stay
// keyed the same way request files and logs are.
impl serde::Serialize for ChunkHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for ChunkHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <String as serde::Deserialize>::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    #[error("digest is not valid hex")]
    BadHex,

    #[error("digest must be {DIGEST_LEN} bytes, got {0}")]
    BadLength(usize),
}

// ── Request files ─────────────────────────────────────────────────────────────

/// Parse a hash request file: one chunk per line, `<index> <hex-digest>`.
/// The index column is carried for humans and ignored here.
pub fn load_request_list(path: &Path) -> Result<Vec<ChunkHash>, RequestError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RequestError::Read(path.to_path_buf(), e))?;
    let mut digests = Vec::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let field = line
            .split_whitespace()
            .nth(1)
            .ok_or(RequestError::MissingDigest(number + 1))?;
        let digest = field
            .parse()
            .map_err(|e| RequestError::BadDigest(number + 1, e))?;
        digests.push(digest);
    }
    Ok(digests)
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("line {0}: expected '<index> <hex-digest>'")]
    MissingDigest(usize),

    #[error("line {0}: {1}")]
    BadDigest(usize, DigestError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
