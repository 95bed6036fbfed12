#![warn(missing_docs)]

//! Tidepool IO subsystem: streaming reads and writes through ordered filter chains
//!
//! Read path:  Source → IoRead → FilterGroup (decrypt, decompress, hash, size) → caller
//! Write path: caller → IoWrite → FilterGroup (size, hash, compress, encrypt) → Sink

pub mod buffer;
pub mod chunk;
pub mod cipher;
pub mod compress;
pub mod error;
pub mod filter;
pub mod group;
pub mod hash;
pub mod read;
pub mod write;

pub use buffer::{FilterBuf, IO_BUFFER_SIZE_DEFAULT};
pub use chunk::{ChunkDecoder, ChunkEncoder, ChunkFilter, DechunkFilter};
pub use cipher::{CipherAlgorithm, CipherFilter, CipherMode};
pub use compress::{CompressAlgorithm, CompressFilter, DecompressFilter};
pub use error::{StorageError, StorageResult};
pub use filter::{
    BufferFilter, Filter, FilterDef, FilterResult, FilterResults, Passphrase, SinkFilter,
    SizeFilter,
};
pub use group::FilterGroup;
pub use hash::{BlockHashFilter, HashFilter, HashType};
pub use read::{BufferSource, IoRead, ReadSource};
pub use write::{BufferSink, IoWrite, WriteSink};
