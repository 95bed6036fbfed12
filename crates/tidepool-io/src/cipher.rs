//! Chunked AEAD encryption filter (AES-256-GCM or ChaCha20-Poly1305) with HKDF key derivation.
//!
//! Stream layout: `magic(4) version(1) algo(1) nonce_prefix(8)` followed by segments of
//! `u32 BE ciphertext length` + ciphertext. Each segment seals up to [`SEGMENT_SIZE`] bytes of
//! plaintext with nonce `prefix || counter` and a one-byte AAD flagging the final segment, so
//! truncation and reordering are both detected.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm,
};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::buffer::FilterBuf;
use crate::error::{StorageError, StorageResult};
use crate::filter::{drive_transform, Filter, FilterDef, Passphrase, QueuedOutput};

/// Plaintext bytes per sealed segment.
pub const SEGMENT_SIZE: usize = 64 * 1024;

const MAGIC: &[u8; 4] = b"TPCB";
const VERSION: u8 = 1;
const HEADER_SIZE: usize = 4 + 1 + 1 + 8;
const TAG_SIZE: usize = 16;

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CipherAlgorithm {
    /// AES-256-GCM
    #[default]
    Aes256Gcm,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    fn id(&self) -> u8 {
        match self {
            CipherAlgorithm::Aes256Gcm => 1,
            CipherAlgorithm::ChaCha20Poly1305 => 2,
        }
    }
}

/// Direction of a [`CipherFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Plaintext in, ciphertext out.
    Encrypt,
    /// Ciphertext in, plaintext out.
    Decrypt,
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct StreamKey([u8; 32]);

impl StreamKey {
    fn derive(passphrase: &Passphrase, salt: &[u8]) -> StorageResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(b"tidepool-cipher-block", &mut okm)
            .map_err(|e| StorageError::Crypto(format!("key derivation failed: {}", e)))?;
        Ok(StreamKey(okm))
    }
}

fn nonce_for(prefix: &[u8; 8], counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(prefix);
    nonce[8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn seal(
    algo: CipherAlgorithm,
    key: &StreamKey,
    nonce: &[u8; 12],
    plain: &[u8],
    last: bool,
) -> StorageResult<Vec<u8>> {
    let aad = [u8::from(last)];
    let payload = Payload { msg: plain, aad: &aad };
    match algo {
        CipherAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| StorageError::Crypto(e.to_string()))?;
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(nonce), payload)
                .map_err(|e| StorageError::Crypto(e.to_string()))
        }
        CipherAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| StorageError::Crypto(e.to_string()))?;
            cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .map_err(|e| StorageError::Crypto(e.to_string()))
        }
    }
}

fn open(
    algo: CipherAlgorithm,
    key: &StreamKey,
    nonce: &[u8; 12],
    sealed: &[u8],
    last: bool,
) -> StorageResult<Vec<u8>> {
    let aad = [u8::from(last)];
    let payload = Payload { msg: sealed, aad: &aad };
    let result = match algo {
        CipherAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| StorageError::Crypto(e.to_string()))?;
            cipher.decrypt(aes_gcm::Nonce::from_slice(nonce), payload)
        }
        CipherAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| StorageError::Crypto(e.to_string()))?;
            cipher.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
        }
    };
    result.map_err(|_| {
        StorageError::Crypto("unable to decrypt: authentication failed or data truncated".to_string())
    })
}

struct CipherState {
    key: StreamKey,
    prefix: [u8; 8],
    counter: u32,
}

impl CipherState {
    fn next_nonce(&mut self) -> StorageResult<[u8; 12]> {
        let nonce = nonce_for(&self.prefix, self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| StorageError::Crypto("segment counter overflow".to_string()))?;
        Ok(nonce)
    }
}

/// Encrypts or decrypts a stream in sealed segments.
pub struct CipherFilter {
    mode: CipherMode,
    algo: CipherAlgorithm,
    passphrase: Passphrase,
    state: Option<CipherState>,
    pending: Vec<u8>,
    queue: QueuedOutput,
    finished: bool,
    input_same: bool,
    done: bool,
}

impl CipherFilter {
    /// Create a cipher filter.
    pub fn new(mode: CipherMode, algo: CipherAlgorithm, passphrase: Passphrase) -> Self {
        Self {
            mode,
            algo,
            passphrase,
            state: None,
            pending: Vec::new(),
            queue: QueuedOutput::new(),
            finished: false,
            input_same: false,
            done: false,
        }
    }

    fn start_encrypt(&mut self, queue: &mut QueuedOutput) -> StorageResult<()> {
        if self.state.is_none() {
            let mut prefix = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut prefix);
            let key = StreamKey::derive(&self.passphrase, &prefix)?;
            let mut header = Vec::with_capacity(HEADER_SIZE);
            header.extend_from_slice(MAGIC);
            header.push(VERSION);
            header.push(self.algo.id());
            header.extend_from_slice(&prefix);
            queue.extend(&header);
            self.state = Some(CipherState {
                key,
                prefix,
                counter: 0,
            });
        }
        Ok(())
    }

    fn encrypt_segments(&mut self, queue: &mut QueuedOutput, last: bool) -> StorageResult<()> {
        self.start_encrypt(queue)?;
        let algo = self.algo;
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        // Keep at least one byte back until end of stream so the final segment can be flagged
        while self.pending.len() > SEGMENT_SIZE {
            let nonce = state.next_nonce()?;
            let sealed = seal(algo, &state.key, &nonce, &self.pending[..SEGMENT_SIZE], false)?;
            queue.extend(&(sealed.len() as u32).to_be_bytes());
            queue.extend(&sealed);
            self.pending.drain(..SEGMENT_SIZE);
        }
        if last {
            let nonce = state.next_nonce()?;
            let sealed = seal(algo, &state.key, &nonce, &self.pending, true)?;
            queue.extend(&(sealed.len() as u32).to_be_bytes());
            queue.extend(&sealed);
            self.pending.clear();
        }
        Ok(())
    }

    fn decrypt_segments(&mut self, queue: &mut QueuedOutput, last: bool) -> StorageResult<()> {
        if self.state.is_none() {
            if self.pending.len() < HEADER_SIZE {
                if last {
                    return Err(StorageError::Format(
                        "encrypted stream is missing its header".to_string(),
                    ));
                }
                return Ok(());
            }
            if &self.pending[..4] != MAGIC || self.pending[4] != VERSION {
                return Err(StorageError::Format("encrypted stream header is invalid".to_string()));
            }
            if self.pending[5] != self.algo.id() {
                return Err(StorageError::Crypto(
                    "encrypted stream uses a different cipher".to_string(),
                ));
            }
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&self.pending[6..HEADER_SIZE]);
            let key = StreamKey::derive(&self.passphrase, &prefix)?;
            self.state = Some(CipherState {
                key,
                prefix,
                counter: 0,
            });
            self.pending.drain(..HEADER_SIZE);
        }

        let algo = self.algo;
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        loop {
            if self.pending.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes([
                self.pending[0],
                self.pending[1],
                self.pending[2],
                self.pending[3],
            ]) as usize;
            if len < TAG_SIZE || len > SEGMENT_SIZE + TAG_SIZE {
                return Err(StorageError::Format(format!(
                    "encrypted segment length {} is invalid",
                    len
                )));
            }
            let end = 4 + len;
            let is_final = if self.pending.len() > end {
                false
            } else if self.pending.len() == end && last {
                true
            } else {
                break;
            };
            let nonce = state.next_nonce()?;
            let plain = open(algo, &state.key, &nonce, &self.pending[4..end], is_final)?;
            queue.extend(&plain);
            self.pending.drain(..end);
            if is_final {
                self.finished = true;
            }
        }
        if last && !self.finished {
            return Err(StorageError::Crypto(
                "unable to decrypt: encrypted stream is truncated".to_string(),
            ));
        }
        Ok(())
    }
}

impl Filter for CipherFilter {
    fn kind(&self) -> &'static str {
        match self.mode {
            CipherMode::Encrypt => "encrypt",
            CipherMode::Decrypt => "decrypt",
        }
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut FilterBuf) -> StorageResult<()> {
        let mut queue = std::mem::take(&mut self.queue);
        let result = match input {
            Some(input) => drive_transform(&mut queue, input, output, |data, queue| {
                self.pending.extend_from_slice(data);
                match self.mode {
                    CipherMode::Encrypt => self.encrypt_segments(queue, false),
                    CipherMode::Decrypt => self.decrypt_segments(queue, false),
                }
            })
            .map(|same| {
                self.input_same = same;
            }),
            None => {
                self.input_same = false;
                let flushed = if self.finished {
                    Ok(())
                } else {
                    let r = match self.mode {
                        CipherMode::Encrypt => self.encrypt_segments(&mut queue, true),
                        CipherMode::Decrypt => self.decrypt_segments(&mut queue, true),
                    };
                    self.finished = true;
                    r
                };
                flushed.map(|_| {
                    self.done = queue.drain(output);
                })
            }
        };
        self.queue = queue;
        result
    }

    fn done(&self) -> bool {
        self.done
    }

    fn input_same(&self) -> bool {
        self.input_same
    }

    fn definition(&self) -> Option<FilterDef> {
        let passphrase = self.passphrase.clone();
        Some(match self.mode {
            CipherMode::Encrypt => FilterDef::Encrypt {
                algo: self.algo,
                passphrase,
            },
            CipherMode::Decrypt => FilterDef::Decrypt {
                algo: self.algo,
                passphrase,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(filter: &mut dyn Filter, data: &[u8], piece: usize, out_size: usize) -> StorageResult<Vec<u8>> {
        let mut result = Vec::new();
        let mut out = FilterBuf::new(out_size);
        for chunk in data.chunks(piece.max(1)) {
            loop {
                out.clear();
                filter.process(Some(chunk), &mut out)?;
                result.extend_from_slice(out.as_slice());
                if !filter.input_same() {
                    break;
                }
            }
        }
        while !filter.done() {
            out.clear();
            filter.process(None, &mut out)?;
            result.extend_from_slice(out.as_slice());
        }
        Ok(result)
    }

    fn encrypt(algo: CipherAlgorithm, data: &[u8]) -> Vec<u8> {
        let mut f = CipherFilter::new(CipherMode::Encrypt, algo, Passphrase::new("pass"));
        run(&mut f, data, 10_000, 4096).unwrap()
    }

    fn decrypt(algo: CipherAlgorithm, data: &[u8], pass: &str) -> StorageResult<Vec<u8>> {
        let mut f = CipherFilter::new(CipherMode::Decrypt, algo, Passphrase::new(pass));
        run(&mut f, data, 777, 1000)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_aes_roundtrip(data in prop::collection::vec(0u8..=255, 0..150_000)) {
            let sealed = encrypt(CipherAlgorithm::Aes256Gcm, &data);
            prop_assert_eq!(decrypt(CipherAlgorithm::Aes256Gcm, &sealed, "pass").unwrap(), data);
        }
    }

    #[test]
    fn test_chacha_roundtrip_multi_segment() {
        let data: Vec<u8> = (0..(SEGMENT_SIZE * 2 + 11)).map(|i| (i % 251) as u8).collect();
        let sealed = encrypt(CipherAlgorithm::ChaCha20Poly1305, &data);
        assert_eq!(decrypt(CipherAlgorithm::ChaCha20Poly1305, &sealed, "pass").unwrap(), data);
    }

    #[test]
    fn test_empty_stream_roundtrip() {
        let sealed = encrypt(CipherAlgorithm::Aes256Gcm, b"");
        assert_eq!(sealed.len(), HEADER_SIZE + 4 + TAG_SIZE);
        assert!(decrypt(CipherAlgorithm::Aes256Gcm, &sealed, "pass").unwrap().is_empty());
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let sealed = encrypt(CipherAlgorithm::Aes256Gcm, b"top secret");
        let err = decrypt(CipherAlgorithm::Aes256Gcm, &sealed, "other").unwrap_err();
        assert!(matches!(err, StorageError::Crypto(_)));
    }

    #[test]
    fn test_truncated_stream_detected() {
        let data = vec![1u8; SEGMENT_SIZE + 100];
        let sealed = encrypt(CipherAlgorithm::Aes256Gcm, &data);
        // Drop the final segment entirely: the remaining one was sealed as non-final
        let first_len = u32::from_be_bytes([
            sealed[HEADER_SIZE],
            sealed[HEADER_SIZE + 1],
            sealed[HEADER_SIZE + 2],
            sealed[HEADER_SIZE + 3],
        ]) as usize;
        let truncated = &sealed[..HEADER_SIZE + 4 + first_len];
        let err = decrypt(CipherAlgorithm::Aes256Gcm, truncated, "pass").unwrap_err();
        assert!(matches!(err, StorageError::Crypto(_)));
    }

    #[test]
    fn test_bad_header_is_format_error() {
        let err = decrypt(CipherAlgorithm::Aes256Gcm, b"XXXXXXXXXXXXXXXXXXXX", "pass").unwrap_err();
        assert!(matches!(err, StorageError::Format(_)));
    }

    #[test]
    fn test_each_stream_uses_fresh_nonce_prefix() {
        let a = encrypt(CipherAlgorithm::Aes256Gcm, b"same");
        let b = encrypt(CipherAlgorithm::Aes256Gcm, b"same");
        assert_ne!(a, b);
    }
}
