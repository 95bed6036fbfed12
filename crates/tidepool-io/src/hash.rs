//! Hashing filters: whole-stream digests and per-block xxh3 hashes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::Xxh3;

use crate::buffer::FilterBuf;
use crate::error::{StorageError, StorageResult};
use crate::filter::{Filter, FilterDef, FilterResult, PassThrough};

/// Digest algorithm for [`HashFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HashType {
    /// SHA-256
    #[default]
    Sha256,
    /// BLAKE3
    Blake3,
}

enum HashState {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

/// Computes a hex digest of every byte passing through.
pub struct HashFilter {
    algo: HashType,
    state: HashState,
    pass: PassThrough,
    digest: Option<String>,
}

impl HashFilter {
    /// Result key.
    pub const KIND: &'static str = "hash";

    /// Create a hash filter.
    pub fn new(algo: HashType) -> Self {
        let state = match algo {
            HashType::Sha256 => HashState::Sha256(Sha256::new()),
            HashType::Blake3 => HashState::Blake3(Box::new(blake3::Hasher::new())),
        };
        Self {
            algo,
            state,
            pass: PassThrough::new(),
            digest: None,
        }
    }

    /// Hash a complete buffer in one call.
    pub fn digest_of(algo: HashType, data: &[u8]) -> String {
        match algo {
            HashType::Sha256 => hex::encode(Sha256::digest(data)),
            HashType::Blake3 => blake3::hash(data).to_hex().to_string(),
        }
    }
}

impl Filter for HashFilter {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut FilterBuf) -> StorageResult<()> {
        let forwarded = self.pass.forward(input, output);
        match &mut self.state {
            HashState::Sha256(h) => h.update(forwarded),
            HashState::Blake3(h) => {
                h.update(forwarded);
            }
        }
        if input.is_none() && self.digest.is_none() {
            self.digest = Some(match &self.state {
                HashState::Sha256(h) => hex::encode(h.clone().finalize()),
                HashState::Blake3(h) => h.finalize().to_hex().to_string(),
            });
        }
        Ok(())
    }

    fn done(&self) -> bool {
        self.pass.done()
    }

    fn input_same(&self) -> bool {
        self.pass.input_same()
    }

    fn result(&self) -> Option<FilterResult> {
        self.digest.clone().map(FilterResult::Hash)
    }

    fn definition(&self) -> Option<FilterDef> {
        Some(FilterDef::Hash(self.algo))
    }
}

/// Computes one xxh3 hash per `block_size` bytes; the final block may be short.
pub struct BlockHashFilter {
    block_size: usize,
    hasher: Xxh3,
    block_len: usize,
    hashes: Vec<u64>,
    pass: PassThrough,
    finished: bool,
}

impl BlockHashFilter {
    /// Result key.
    pub const KIND: &'static str = "block-hash";

    /// Create a block hash filter. The block size must be non-zero.
    pub fn new(block_size: usize) -> StorageResult<Self> {
        if block_size == 0 {
            return Err(StorageError::Assert(
                "block hash size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            block_size,
            hasher: Xxh3::new(),
            block_len: 0,
            hashes: Vec::new(),
            pass: PassThrough::new(),
            finished: false,
        })
    }

    fn observe(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let take = (self.block_size - self.block_len).min(bytes.len());
            self.hasher.update(&bytes[..take]);
            self.block_len += take;
            bytes = &bytes[take..];
            if self.block_len == self.block_size {
                self.hashes.push(self.hasher.digest());
                self.hasher.reset();
                self.block_len = 0;
            }
        }
    }
}

impl Filter for BlockHashFilter {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut FilterBuf) -> StorageResult<()> {
        let forwarded = self.pass.forward(input, output);
        self.observe(forwarded);
        if input.is_none() && !self.finished {
            if self.block_len > 0 {
                self.hashes.push(self.hasher.digest());
                self.block_len = 0;
            }
            self.finished = true;
        }
        Ok(())
    }

    fn done(&self) -> bool {
        self.pass.done()
    }

    fn input_same(&self) -> bool {
        self.pass.input_same()
    }

    fn result(&self) -> Option<FilterResult> {
        if self.finished {
            Some(FilterResult::BlockHash(self.hashes.clone()))
        } else {
            None
        }
    }

    fn definition(&self) -> Option<FilterDef> {
        Some(FilterDef::BlockHash {
            block_size: self.block_size,
        })
    }
}
