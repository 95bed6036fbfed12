//! Chunk framing: self-delimiting byte runs of unknown count and size over one ordered stream.
//!
//! The first run's size is written as a plain varint. Every following run writes
//! `zigzag(size - previous_size) + 1`, so runs of similar size cost one byte of framing. A zero
//! varint ends the stream; empty runs are never written.

use crate::buffer::FilterBuf;
use crate::error::{StorageError, StorageResult};
use crate::filter::{drive_transform, Filter, FilterDef, QueuedOutput};

/// Longest possible encoding of a u64 varint.
pub const VARINT_MAX_LEN: usize = 10;

/// Append `value` as an unsigned LEB128 varint.
pub fn varint_encode(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decode a varint from the start of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the varint does.
pub fn varint_decode(buf: &[u8]) -> StorageResult<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (idx, byte) in buf.iter().enumerate() {
        if idx >= VARINT_MAX_LEN {
            break;
        }
        let bits = u64::from(byte & 0x7f);
        if idx == VARINT_MAX_LEN - 1 && bits > 1 {
            return Err(StorageError::Format("varint overflows 64 bits".to_string()));
        }
        value |= bits << (7 * idx);
        if byte & 0x80 == 0 {
            return Ok(Some((value, idx + 1)));
        }
    }
    if buf.len() >= VARINT_MAX_LEN {
        return Err(StorageError::Format("varint is longer than 10 bytes".to_string()));
    }
    Ok(None)
}

/// Map a signed value onto unsigned so small magnitudes stay small.
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Writes chunk headers.
#[derive(Debug, Default, Clone)]
pub struct ChunkEncoder {
    last: Option<u64>,
}

impl ChunkEncoder {
    /// Create an encoder at the start of a stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the header for a run of `size` bytes. `size` must be non-zero.
    pub fn header(&mut self, size: usize, out: &mut Vec<u8>) {
        let size = size as u64;
        let value = match self.last {
            None => size,
            Some(last) => zigzag_encode(size as i64 - last as i64) + 1,
        };
        varint_encode(value, out);
        self.last = Some(size);
    }

    /// Append the end-of-stream marker and reset for the next stream.
    pub fn end(&mut self, out: &mut Vec<u8>) {
        out.push(0);
        self.last = None;
    }

    /// Append a complete run (header and bytes). Empty runs are skipped.
    pub fn chunk(&mut self, data: &[u8], out: &mut Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.header(data.len(), out);
        out.extend_from_slice(data);
    }
}

/// Turns chunk header varints back into run sizes.
#[derive(Debug, Default, Clone)]
pub struct ChunkDecoder {
    last: Option<u64>,
}

impl ChunkDecoder {
    /// Create a decoder at the start of a stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert a decoded header varint into the run size; `None` marks end of stream.
    pub fn size(&mut self, value: u64) -> StorageResult<Option<u64>> {
        if value == 0 {
            self.last = None;
            return Ok(None);
        }
        let size = match self.last {
            None => value,
            Some(last) => {
                let size = last as i128 + zigzag_decode(value - 1) as i128;
                if size <= 0 || size > u64::MAX as i128 {
                    return Err(StorageError::Format(format!(
                        "chunk size delta {} from {} gives invalid size {}",
                        value, last, size
                    )));
                }
                size as u64
            }
        };
        self.last = Some(size);
        Ok(Some(size))
    }
}

/// Encode a complete sequence of runs, including the terminator.
pub fn encode<T: AsRef<[u8]>>(chunks: &[T]) -> Vec<u8> {
    let mut encoder = ChunkEncoder::new();
    let mut out = Vec::new();
    for chunk in chunks {
        encoder.chunk(chunk.as_ref(), &mut out);
    }
    encoder.end(&mut out);
    out
}

/// Decode a complete frame into its runs. The frame must end exactly at the terminator.
pub fn decode(frame: &[u8]) -> StorageResult<Vec<Vec<u8>>> {
    let mut decoder = ChunkDecoder::new();
    let mut chunks = Vec::new();
    let mut pos = 0;
    loop {
        let (value, used) = varint_decode(&frame[pos..])?
            .ok_or_else(|| StorageError::Format("chunk frame ends inside a size header".to_string()))?;
        pos += used;
        let Some(size) = decoder.size(value)? else {
            break;
        };
        let size = usize::try_from(size)
            .map_err(|_| StorageError::Format(format!("chunk size {} is too large", size)))?;
        if frame.len() - pos < size {
            return Err(StorageError::Format(format!(
                "chunk frame ends after {} of {} bytes",
                frame.len() - pos,
                size
            )));
        }
        chunks.push(frame[pos..pos + size].to_vec());
        pos += size;
    }
    if pos != frame.len() {
        return Err(StorageError::Format(format!(
            "{} bytes follow the chunk frame terminator",
            frame.len() - pos
        )));
    }
    Ok(chunks)
}

/// Frames each input buffer as one run and terminates the stream at end of input.
#[derive(Debug, Default)]
pub struct ChunkFilter {
    encoder: ChunkEncoder,
    queue: QueuedOutput,
    ended: bool,
    input_same: bool,
    done: bool,
}

impl ChunkFilter {
    /// Create a chunk filter.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Filter for ChunkFilter {
    fn kind(&self) -> &'static str {
        "chunk"
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut FilterBuf) -> StorageResult<()> {
        match input {
            Some(input) => {
                let encoder = &mut self.encoder;
                self.input_same = drive_transform(&mut self.queue, input, output, |data, queue| {
                    let mut framed = Vec::with_capacity(data.len() + VARINT_MAX_LEN);
                    encoder.chunk(data, &mut framed);
                    queue.extend(&framed);
                    Ok(())
                })?;
            }
            None => {
                self.input_same = false;
                if !self.ended {
                    let mut tail = Vec::with_capacity(1);
                    self.encoder.end(&mut tail);
                    self.queue.extend(&tail);
                    self.ended = true;
                }
                self.done = self.queue.drain(output);
            }
        }
        Ok(())
    }

    fn done(&self) -> bool {
        self.done
    }

    fn input_same(&self) -> bool {
        self.input_same
    }

    fn definition(&self) -> Option<FilterDef> {
        Some(FilterDef::Chunk)
    }
}

#[derive(Debug)]
enum DechunkState {
    Header,
    Body(usize),
    Ended,
}

/// Decodes a chunk-framed stream back into its payload bytes.
#[derive(Debug)]
pub struct DechunkFilter {
    decoder: ChunkDecoder,
    state: DechunkState,
    header: Vec<u8>,
    queue: QueuedOutput,
    input_same: bool,
    done: bool,
}

impl DechunkFilter {
    /// Create a dechunk filter.
    pub fn new() -> Self {
        Self {
            decoder: ChunkDecoder::new(),
            state: DechunkState::Header,
            header: Vec::with_capacity(VARINT_MAX_LEN),
            queue: QueuedOutput::new(),
            input_same: false,
            done: false,
        }
    }

    fn feed(&mut self, mut data: &[u8], queue: &mut QueuedOutput) -> StorageResult<()> {
        while !data.is_empty() {
            match self.state {
                DechunkState::Header => {
                    self.header.push(data[0]);
                    data = &data[1..];
                    if let Some((value, _)) = varint_decode(&self.header)? {
                        self.header.clear();
                        self.state = match self.decoder.size(value)? {
                            None => DechunkState::Ended,
                            Some(size) => DechunkState::Body(usize::try_from(size).map_err(
                                |_| StorageError::Format(format!("chunk size {} is too large", size)),
                            )?),
                        };
                    }
                }
                DechunkState::Body(remaining) => {
                    let take = remaining.min(data.len());
                    queue.extend(&data[..take]);
                    data = &data[take..];
                    self.state = if take == remaining {
                        DechunkState::Header
                    } else {
                        DechunkState::Body(remaining - take)
                    };
                }
                DechunkState::Ended => {
                    return Err(StorageError::Format(
                        "data follows the chunk frame terminator".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for DechunkFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for DechunkFilter {
    fn kind(&self) -> &'static str {
        "dechunk"
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut FilterBuf) -> StorageResult<()> {
        match input {
            Some(input) => {
                let mut queue = std::mem::take(&mut self.queue);
                let result = drive_transform(&mut queue, input, output, |data, queue| {
                    self.feed(data, queue)
                });
                self.queue = queue;
                self.input_same = result?;
            }
            None => {
                self.input_same = false;
                if !matches!(self.state, DechunkState::Ended) {
                    return Err(StorageError::Format(
                        "chunk frame ended without a terminator".to_string(),
                    ));
                }
                self.done = self.queue.drain(output);
            }
        }
        Ok(())
    }

    fn done(&self) -> bool {
        self.done
    }

    fn input_same(&self) -> bool {
        self.input_same
    }

    fn definition(&self) -> Option<FilterDef> {
        Some(FilterDef::Dechunk)
    }
}
