//! Filter contract, filter results and the simple pass-through filters.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::buffer::FilterBuf;
use crate::chunk::{ChunkFilter, DechunkFilter};
use crate::cipher::{CipherAlgorithm, CipherFilter, CipherMode};
use crate::compress::{CompressAlgorithm, CompressFilter, DecompressFilter};
use crate::error::StorageResult;
use crate::hash::{BlockHashFilter, HashFilter, HashType};

/// One streaming transform stage.
///
/// A filter receives `Some(input)` for data and `None` once the stream has ended. When `output`
/// fills up before `input` is drained the filter must report [`Filter::input_same`] and expects
/// the very same input on the next call. After end of stream the filter keeps being called with
/// `None` until it reports [`Filter::done`].
pub trait Filter: Send {
    /// Short identifier, also the key of the filter's result.
    fn kind(&self) -> &'static str;

    /// Process input (or flush on `None`) into `output`.
    fn process(&mut self, input: Option<&[u8]>, output: &mut FilterBuf) -> StorageResult<()>;

    /// True once all output has been produced after end of stream.
    fn done(&self) -> bool;

    /// True when the last input was not fully consumed.
    fn input_same(&self) -> bool;

    /// Summary produced by the filter, available once done.
    fn result(&self) -> Option<FilterResult> {
        None
    }

    /// Serializable description used to rebuild the filter in another process.
    fn definition(&self) -> Option<FilterDef> {
        None
    }
}

/// Summary value produced by a metadata-collecting filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterResult {
    /// Byte count.
    Size(u64),
    /// Hex digest of the whole stream.
    Hash(String),
    /// One xxh3 hash per block.
    BlockHash(Vec<u64>),
}

/// Results of every filter in a group, in filter order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterResults {
    entries: Vec<(String, FilterResult)>,
}

impl FilterResults {
    /// Create an empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result.
    pub fn push(&mut self, kind: impl Into<String>, result: FilterResult) {
        self.entries.push((kind.into(), result));
    }

    /// First result produced by a filter of the given kind.
    pub fn get(&self, kind: &str) -> Option<&FilterResult> {
        self.entries.iter().find(|(k, _)| k == kind).map(|(_, r)| r)
    }

    /// Convenience accessor for the size filter.
    pub fn size(&self) -> Option<u64> {
        match self.get(SizeFilter::KIND) {
            Some(FilterResult::Size(size)) => Some(*size),
            _ => None,
        }
    }

    /// Convenience accessor for the hash filter.
    pub fn hash(&self) -> Option<&str> {
        match self.get(HashFilter::KIND) {
            Some(FilterResult::Hash(hash)) => Some(hash),
            _ => None,
        }
    }

    /// Number of results.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no results.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(kind, result)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterResult)> {
        self.entries.iter().map(|(k, r)| (k.as_str(), r))
    }
}

/// Secret used to derive cipher keys.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Passphrase(String);

impl Passphrase {
    /// Wrap a passphrase.
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(passphrase.into())
    }

    /// Raw bytes of the passphrase.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Passphrase([REDACTED])")
    }
}

/// Serializable filter description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterDef {
    /// Copy input to output.
    Buffer,
    /// Count bytes.
    Size,
    /// Discard everything.
    Sink,
    /// Digest of the whole stream.
    Hash(HashType),
    /// xxh3 per block of `block_size` bytes.
    BlockHash {
        /// Block size in bytes.
        block_size: usize,
    },
    /// Compress the stream.
    Compress {
        /// Algorithm.
        algo: CompressAlgorithm,
        /// Level (ignored by lz4).
        level: i32,
    },
    /// Decompress the stream.
    Decompress {
        /// Algorithm.
        algo: CompressAlgorithm,
    },
    /// Encrypt the stream.
    Encrypt {
        /// AEAD cipher.
        algo: CipherAlgorithm,
        /// Secret the key is derived from.
        passphrase: Passphrase,
    },
    /// Decrypt the stream.
    Decrypt {
        /// AEAD cipher.
        algo: CipherAlgorithm,
        /// Secret the key is derived from.
        passphrase: Passphrase,
    },
    /// Chunk-frame the stream.
    Chunk,
    /// Decode a chunk-framed stream.
    Dechunk,
}

impl FilterDef {
    /// Build the filter described.
    pub fn build(&self) -> StorageResult<Box<dyn Filter>> {
        Ok(match self {
            FilterDef::Buffer => Box::new(BufferFilter::new()),
            FilterDef::Size => Box::new(SizeFilter::new()),
            FilterDef::Sink => Box::new(SinkFilter::new()),
            FilterDef::Hash(algo) => Box::new(HashFilter::new(*algo)),
            FilterDef::BlockHash { block_size } => Box::new(BlockHashFilter::new(*block_size)?),
            FilterDef::Compress { algo, level } => Box::new(CompressFilter::new(*algo, *level)?),
            FilterDef::Decompress { algo } => Box::new(DecompressFilter::new(*algo)?),
            FilterDef::Encrypt { algo, passphrase } => Box::new(CipherFilter::new(
                CipherMode::Encrypt,
                *algo,
                passphrase.clone(),
            )),
            FilterDef::Decrypt { algo, passphrase } => Box::new(CipherFilter::new(
                CipherMode::Decrypt,
                *algo,
                passphrase.clone(),
            )),
            FilterDef::Chunk => Box::new(ChunkFilter::new()),
            FilterDef::Dechunk => Box::new(DechunkFilter::new()),
        })
    }
}

/// Forwards input to output unchanged while remembering how far into the current input it got.
///
/// Observer filters embed this and look at the slice returned by [`PassThrough::forward`], so
/// every byte is observed exactly once.
#[derive(Debug, Default)]
pub struct PassThrough {
    offset: usize,
    input_same: bool,
    done: bool,
}

impl PassThrough {
    /// Create a new pass-through state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward as much of `input` as fits and return the bytes forwarded by this call.
    pub fn forward<'a>(&mut self, input: Option<&'a [u8]>, output: &mut FilterBuf) -> &'a [u8] {
        match input {
            None => {
                self.done = true;
                self.input_same = false;
                &[]
            }
            Some(input) => {
                let rest = &input[self.offset.min(input.len())..];
                let n = output.push(rest);
                self.offset += n;
                if self.offset >= input.len() {
                    self.offset = 0;
                    self.input_same = false;
                } else {
                    self.input_same = true;
                }
                &rest[..n]
            }
        }
    }

    /// See [`Filter::done`].
    pub fn done(&self) -> bool {
        self.done
    }

    /// See [`Filter::input_same`].
    pub fn input_same(&self) -> bool {
        self.input_same
    }
}

/// Output produced ahead of what the downstream buffer can take.
///
/// Transform filters push everything an input produces into the queue, then drain the queue
/// into the filter output. New input is only accepted once the queue is empty.
#[derive(Debug, Default)]
pub struct QueuedOutput {
    data: Vec<u8>,
    pos: usize,
}

impl QueuedOutput {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.pos == self.data.len() {
            self.data.clear();
            self.pos = 0;
        }
        self.data.extend_from_slice(bytes);
    }

    /// Move queued bytes into `output`; returns true when the queue is empty afterwards.
    pub fn drain(&mut self, output: &mut FilterBuf) -> bool {
        self.pos += output.push(&self.data[self.pos..]);
        if self.pos == self.data.len() {
            self.data.clear();
            self.pos = 0;
            true
        } else {
            false
        }
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }
}

/// Drive a transform filter: drain queued output, then hand new input to `feed` and drain again.
///
/// Returns the new `input_same` value. `feed` is only called when the queue was emptied first.
pub(crate) fn drive_transform<F>(
    queue: &mut QueuedOutput,
    input: &[u8],
    output: &mut FilterBuf,
    feed: F,
) -> StorageResult<bool>
where
    F: FnOnce(&[u8], &mut QueuedOutput) -> StorageResult<()>,
{
    if !queue.drain(output) {
        return Ok(true);
    }
    feed(input, queue)?;
    queue.drain(output);
    Ok(false)
}

/// Copies input to output.
#[derive(Debug, Default)]
pub struct BufferFilter {
    pass: PassThrough,
}

impl BufferFilter {
    /// Create a buffer filter.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Filter for BufferFilter {
    fn kind(&self) -> &'static str {
        "buffer"
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut FilterBuf) -> StorageResult<()> {
        self.pass.forward(input, output);
        Ok(())
    }

    fn done(&self) -> bool {
        self.pass.done()
    }

    fn input_same(&self) -> bool {
        self.pass.input_same()
    }

    fn definition(&self) -> Option<FilterDef> {
        Some(FilterDef::Buffer)
    }
}

/// Counts bytes flowing through.
#[derive(Debug, Default)]
pub struct SizeFilter {
    pass: PassThrough,
    size: u64,
}

impl SizeFilter {
    /// Result key.
    pub const KIND: &'static str = "size";

    /// Create a size filter.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Filter for SizeFilter {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut FilterBuf) -> StorageResult<()> {
        let forwarded = self.pass.forward(input, output);
        self.size += forwarded.len() as u64;
        Ok(())
    }

    fn done(&self) -> bool {
        self.pass.done()
    }

    fn input_same(&self) -> bool {
        self.pass.input_same()
    }

    fn result(&self) -> Option<FilterResult> {
        Some(FilterResult::Size(self.size))
    }

    fn definition(&self) -> Option<FilterDef> {
        Some(FilterDef::Size)
    }
}

/// Consumes all input and produces nothing.
#[derive(Debug, Default)]
pub struct SinkFilter {
    done: bool,
}

impl SinkFilter {
    /// Create a sink filter.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Filter for SinkFilter {
    fn kind(&self) -> &'static str {
        "sink"
    }

    fn process(&mut self, input: Option<&[u8]>, _output: &mut FilterBuf) -> StorageResult<()> {
        if input.is_none() {
            self.done = true;
        }
        Ok(())
    }

    fn done(&self) -> bool {
        self.done
    }

    fn input_same(&self) -> bool {
        false
    }

    fn definition(&self) -> Option<FilterDef> {
        Some(FilterDef::Sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a single filter over `data` with output buffers of `out_size`.
    fn run(filter: &mut dyn Filter, data: &[u8], out_size: usize) -> Vec<u8> {
        let mut result = Vec::new();
        let mut out = FilterBuf::new(out_size);
        for piece in data.chunks(7) {
            loop {
                out.clear();
                filter.process(Some(piece), &mut out).unwrap();
                result.extend_from_slice(out.as_slice());
                if !filter.input_same() {
                    break;
                }
            }
        }
        while !filter.done() {
            out.clear();
            filter.process(None, &mut out).unwrap();
            result.extend_from_slice(out.as_slice());
        }
        result
    }

    #[test]
    fn test_buffer_filter_copies() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut filter = BufferFilter::new();
        assert_eq!(run(&mut filter, &data, 3), data);
    }

    #[test]
    fn test_size_filter_counts_each_byte_once() {
        let data = vec![9u8; 1000];
        let mut filter = SizeFilter::new();
        assert_eq!(run(&mut filter, &data, 1), data);
        assert_eq!(filter.result(), Some(FilterResult::Size(1000)));
    }

    #[test]
    fn test_sink_filter_discards() {
        let mut filter = SinkFilter::new();
        assert!(run(&mut filter, b"abcdef", 4).is_empty());
        assert!(filter.done());
    }

    #[test]
    fn test_pass_through_reports_input_same() {
        let mut pass = PassThrough::new();
        let mut out = FilterBuf::new(2);
        assert_eq!(pass.forward(Some(b"abc"), &mut out), b"ab");
        assert!(pass.input_same());
        out.clear();
        assert_eq!(pass.forward(Some(b"abc"), &mut out), b"c");
        assert!(!pass.input_same());
    }

    #[test]
    fn test_filter_results_lookup() {
        let mut results = FilterResults::new();
        results.push("size", FilterResult::Size(5));
        results.push("hash", FilterResult::Hash("ab".to_string()));
        assert_eq!(results.size(), Some(5));
        assert_eq!(results.hash(), Some("ab"));
        assert_eq!(results.len(), 2);
        assert!(results.get("block-hash").is_none());
    }

    #[test]
    fn test_passphrase_debug_redacted() {
        let p = Passphrase::new("secret");
        assert_eq!(format!("{:?}", p), "Passphrase([REDACTED])");
    }

    #[test]
    fn test_definitions_rebuild() {
        for def in [FilterDef::Buffer, FilterDef::Size, FilterDef::Sink, FilterDef::Chunk] {
            let filter = def.build().unwrap();
            assert_eq!(filter.definition(), Some(def));
        }
    }
}
