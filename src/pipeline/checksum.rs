// Streaming digests computed while bytes flow through a pipeline

use super::{Chunk, Stage};
use crate::error::FlashError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Crc32,
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Crc32 => "crc32",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }

    /// Parse an algorithm name as it appears in config files and bmap headers
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "crc32" => Some(ChecksumAlgorithm::Crc32),
            "sha256" => Some(ChecksumAlgorithm::Sha256),
            "sha512" => Some(ChecksumAlgorithm::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single running digest
#[derive(Clone)]
pub enum Hasher {
    Crc32(crc32fast::Hasher),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Crc32 => Hasher::Crc32(crc32fast::Hasher::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Crc32(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Finish the digest and return it hex encoded
    pub fn finalize(self) -> String {
        match self {
            Hasher::Crc32(h) => format!("{:08x}", h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Several digests fed from the same bytes
#[derive(Clone)]
pub struct MultiHasher {
    hashers: Vec<(ChecksumAlgorithm, Hasher)>,
}

impl MultiHasher {
    pub fn new(algorithms: &[ChecksumAlgorithm]) -> Self {
        let mut algorithms = algorithms.to_vec();
        algorithms.sort();
        algorithms.dedup();
        Self {
            hashers: algorithms
                .into_iter()
                .map(|alg| (alg, Hasher::new(alg)))
                .collect(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        for (_, hasher) in &mut self.hashers {
            hasher.update(data);
        }
    }

    pub fn finalize(self) -> ChecksumSet {
        let mut set = ChecksumSet::default();
        for (alg, hasher) in self.hashers {
            set.insert(alg, hasher.finalize());
        }
        set
    }
}

/// Algorithm name mapped to hex digest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChecksumSet(BTreeMap<String, String>);

impl ChecksumSet {
    pub fn insert(&mut self, algorithm: ChecksumAlgorithm, digest: String) {
        self.0.insert(algorithm.name().to_string(), digest);
    }

    pub fn get(&self, algorithm: ChecksumAlgorithm) -> Option<&str> {
        self.0.get(algorithm.name()).map(String::as_str)
    }

    pub fn merge(&mut self, other: ChecksumSet) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ChecksumSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("{}");
        }
        let mut first = true;
        for (name, digest) in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{name}:{digest}")?;
            first = false;
        }
        Ok(())
    }
}

/// Pass-through stage that digests the whole stream
pub struct ChecksumStage {
    hasher: Option<MultiHasher>,
    result: Option<ChecksumSet>,
}

impl ChecksumStage {
    pub fn new(algorithms: &[ChecksumAlgorithm]) -> Self {
        Self {
            hasher: Some(MultiHasher::new(algorithms)),
            result: None,
        }
    }
}

impl Stage for ChecksumStage {
    fn name(&self) -> &'static str {
        "checksum"
    }

    fn transform(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<(), FlashError> {
        if let Some(hasher) = &mut self.hasher {
            hasher.update(&chunk.data);
        }
        out.push(chunk);
        Ok(())
    }

    fn flush(&mut self, _out: &mut Vec<Chunk>) -> Result<(), FlashError> {
        if let Some(hasher) = self.hasher.take() {
            self.result = Some(hasher.finalize());
        }
        Ok(())
    }

    fn take_checksum(&mut self) -> Option<ChecksumSet> {
        self.result.take()
    }
}
