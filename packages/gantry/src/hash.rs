//! Hashing operations and types.
//!
//! Every content hash in the build core is a [`Digest`] produced by one of
//! the supported [`HashAlgorithm`]s. Rule hashes, source hashes and output
//! hashes all fold through [`StreamHasher`] so that a build configured for a
//! different algorithm produces consistently sized fingerprints throughout.

use std::fmt;

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::{Deserialize, Serialize};
use sha1::Digest as _;
use strum::{Display, EnumString};

/// Byte folded into a hash for a `true` boolean field.
///
/// Distinct from [`FALSE_BYTE`] and from the string separator so that the
/// absence of an optional boolean cannot collide with either value.
pub const TRUE_BYTE: u8 = 1;

/// Byte folded into a hash for a `false` boolean field.
pub const FALSE_BYTE: u8 = 2;

/// Separator written after every string folded into a hash.
const STR_SEPARATOR: u8 = 0;

/// The hash function used for content addressing.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, Display, EnumString, Serialize, Deserialize, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// The default algorithm.
    #[default]
    Sha1,
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    /// Size in bytes of a digest produced by this algorithm.
    pub const fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Blake3 => 32,
        }
    }

    /// Create a fresh streaming hasher for this algorithm.
    pub fn hasher(self) -> StreamHasher {
        match self {
            HashAlgorithm::Sha1 => StreamHasher::Sha1(sha1::Sha1::new()),
            HashAlgorithm::Sha256 => StreamHasher::Sha256(sha2::Sha256::new()),
            HashAlgorithm::Blake3 => StreamHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// Hash a byte slice in one shot.
    pub fn hash_bytes(self, bytes: impl AsRef<[u8]>) -> Digest {
        let mut hasher = self.hasher();
        hasher.update(bytes.as_ref());
        hasher.finish()
    }

    /// Suffix appended to extended attribute names for non-default algorithms.
    pub const fn xattr_suffix(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "",
            HashAlgorithm::Sha256 => "_sha256",
            HashAlgorithm::Blake3 => "_blake3",
        }
    }
}

/// A fixed-size content hash.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Digest(Vec<u8>);

impl Digest {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse a digest from its hex representation.
    pub fn from_hex(s: impl AsRef<str>) -> Result<Self> {
        let bytes = hex::decode(s.as_ref()).context("decode hex digest")?;
        if bytes.is_empty() {
            bail!("empty digest");
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// XOR-fold the digest to a quarter of its length.
    ///
    /// Used to derive the short cache key from a full target hash.
    pub fn fold_quarter(&self) -> Digest {
        let quarter = (self.0.len() / 4).max(1);
        let mut folded = vec![0u8; quarter];
        for (i, byte) in self.0.iter().enumerate() {
            folded[i % quarter] ^= byte;
        }
        Digest(folded)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(&self.0))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A streaming hasher over the configured algorithm.
pub enum StreamHasher {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl StreamHasher {
    /// Fold raw bytes into the hash.
    pub fn update(&mut self, bytes: impl AsRef<[u8]>) {
        match self {
            StreamHasher::Sha1(hasher) => hasher.update(bytes.as_ref()),
            StreamHasher::Sha256(hasher) => hasher.update(bytes.as_ref()),
            StreamHasher::Blake3(hasher) => {
                hasher.update(bytes.as_ref());
            }
        }
    }

    /// Fold a string into the hash, terminated so that adjacent strings
    /// cannot alias each other.
    pub fn update_str(&mut self, s: impl AsRef<str>) {
        self.update(s.as_ref().as_bytes());
        self.update([STR_SEPARATOR]);
    }

    /// Fold a boolean into the hash as one of two distinct byte values.
    pub fn update_bool(&mut self, value: bool) {
        self.update([if value { TRUE_BYTE } else { FALSE_BYTE }]);
    }

    /// Fold a boolean into the hash only when it is set.
    ///
    /// Rule fields added after fingerprints already exist in the wild are
    /// folded this way so that targets not using them keep their hashes.
    pub fn update_opt_bool(&mut self, value: bool) {
        if value {
            self.update([TRUE_BYTE]);
        }
    }

    /// Finish the stream and produce the digest.
    pub fn finish(self) -> Digest {
        match self {
            StreamHasher::Sha1(hasher) => Digest(hasher.finalize().to_vec()),
            StreamHasher::Sha256(hasher) => Digest(hasher.finalize().to_vec()),
            StreamHasher::Blake3(hasher) => Digest(hasher.finalize().as_bytes().to_vec()),
        }
    }
}

impl fmt::Debug for StreamHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamHasher::Sha1(_) => "sha1",
            StreamHasher::Sha256(_) => "sha256",
            StreamHasher::Blake3(_) => "blake3",
        };
        write!(f, "StreamHasher({name})")
    }
}
