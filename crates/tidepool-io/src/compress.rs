//! LZ4 and Zstd compression filters

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::buffer::FilterBuf;
use crate::error::{StorageError, StorageResult};
use crate::filter::{drive_transform, Filter, FilterDef, QueuedOutput};

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressAlgorithm {
    /// LZ4 frame format
    #[default]
    Lz4,
    /// Zstandard
    Zstd,
}

impl CompressAlgorithm {
    /// Conventional file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressAlgorithm::Lz4 => "lz4",
            CompressAlgorithm::Zstd => "zst",
        }
    }
}

fn compress_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Compression(e.to_string())
}

enum Encoder {
    Lz4(lz4_flex::frame::FrameEncoder<Vec<u8>>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

impl Encoder {
    fn inner(&mut self) -> &mut Vec<u8> {
        match self {
            Encoder::Lz4(e) => e.get_mut(),
            Encoder::Zstd(e) => e.get_mut(),
        }
    }

    fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        match self {
            Encoder::Lz4(e) => e.write_all(data).map_err(compress_err),
            Encoder::Zstd(e) => e.write_all(data).map_err(compress_err),
        }
    }

    fn finish(self) -> StorageResult<Vec<u8>> {
        match self {
            Encoder::Lz4(e) => e.finish().map_err(compress_err),
            Encoder::Zstd(e) => e.finish().map_err(compress_err),
        }
    }
}

/// Streaming compressor.
pub struct CompressFilter {
    algo: CompressAlgorithm,
    level: i32,
    encoder: Option<Encoder>,
    queue: QueuedOutput,
    input_same: bool,
    done: bool,
}

impl CompressFilter {
    /// Create a compressor. `level` is only used by zstd.
    pub fn new(algo: CompressAlgorithm, level: i32) -> StorageResult<Self> {
        let encoder = match algo {
            CompressAlgorithm::Lz4 => Encoder::Lz4(lz4_flex::frame::FrameEncoder::new(Vec::new())),
            CompressAlgorithm::Zstd => Encoder::Zstd(
                zstd::stream::write::Encoder::new(Vec::new(), level).map_err(compress_err)?,
            ),
        };
        Ok(Self {
            algo,
            level,
            encoder: Some(encoder),
            queue: QueuedOutput::new(),
            input_same: false,
            done: false,
        })
    }
}

impl Filter for CompressFilter {
    fn kind(&self) -> &'static str {
        "compress"
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut FilterBuf) -> StorageResult<()> {
        match input {
            Some(input) => {
                let encoder = &mut self.encoder;
                self.input_same = drive_transform(&mut self.queue, input, output, |data, queue| {
                    if let Some(encoder) = encoder.as_mut() {
                        encoder.write(data)?;
                        let produced = std::mem::take(encoder.inner());
                        queue.extend(&produced);
                    }
                    Ok(())
                })?;
            }
            None => {
                self.input_same = false;
                if let Some(encoder) = self.encoder.take() {
                    let tail = encoder.finish()?;
                    self.queue.extend(&tail);
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
        Some(FilterDef::Compress {
            algo: self.algo,
            level: self.level,
        })
    }
}

enum Decoder {
    // lz4_flex only decodes frames through `Read`, so the compressed stream is gathered first
    Lz4(Vec<u8>),
    Zstd(zstd::stream::write::Decoder<'static, Vec<u8>>),
}

/// Streaming decompressor.
pub struct DecompressFilter {
    algo: CompressAlgorithm,
    decoder: Option<Decoder>,
    queue: QueuedOutput,
    input_same: bool,
    done: bool,
}

impl DecompressFilter {
    /// Create a decompressor.
    pub fn new(algo: CompressAlgorithm) -> StorageResult<Self> {
        let decoder = match algo {
            CompressAlgorithm::Lz4 => Decoder::Lz4(Vec::new()),
            CompressAlgorithm::Zstd => {
                Decoder::Zstd(zstd::stream::write::Decoder::new(Vec::new()).map_err(compress_err)?)
            }
        };
        Ok(Self {
            algo,
            decoder: Some(decoder),
            queue: QueuedOutput::new(),
            input_same: false,
            done: false,
        })
    }
}

impl Filter for DecompressFilter {
    fn kind(&self) -> &'static str {
        "decompress"
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut FilterBuf) -> StorageResult<()> {
        match input {
            Some(input) => {
                let decoder = &mut self.decoder;
                self.input_same = drive_transform(&mut self.queue, input, output, |data, queue| {
                    match decoder.as_mut() {
                        Some(Decoder::Lz4(gathered)) => gathered.extend_from_slice(data),
                        Some(Decoder::Zstd(d)) => {
                            d.write_all(data).map_err(compress_err)?;
                            d.flush().map_err(compress_err)?;
                            let produced = std::mem::take(d.get_mut());
                            queue.extend(&produced);
                        }
                        None => {}
                    }
                    Ok(())
                })?;
            }
            None => {
                self.input_same = false;
                match self.decoder.take() {
                    Some(Decoder::Lz4(gathered)) => {
                        let mut plain = Vec::new();
                        lz4_flex::frame::FrameDecoder::new(gathered.as_slice())
                            .read_to_end(&mut plain)
                            .map_err(compress_err)?;
                        self.queue.extend(&plain);
                    }
                    Some(Decoder::Zstd(mut d)) => {
                        d.flush().map_err(compress_err)?;
                        let tail = d.into_inner();
                        self.queue.extend(&tail);
                    }
                    None => {}
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
        Some(FilterDef::Decompress { algo: self.algo })
    }
}
