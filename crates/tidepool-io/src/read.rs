//! Filtered reads from an asynchronous byte source.

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::buffer::{FilterBuf, IO_BUFFER_SIZE_DEFAULT};
use crate::error::{StorageError, StorageResult};
use crate::filter::{Filter, FilterDef, FilterResults};
use crate::group::FilterGroup;

/// Raw byte source behind an [`IoRead`].
#[async_trait]
pub trait ReadSource: Send {
    /// Open the source. Returns false when the source is missing and missing is acceptable.
    async fn open(&mut self) -> StorageResult<bool>;

    /// Read up to `buf.len()` bytes; zero means end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize>;

    /// Release the source.
    async fn close(&mut self) -> StorageResult<()>;

    /// Offer to run the filters at the source instead of locally. Called before `open`.
    fn offload_filters(&mut self, _defs: &[FilterDef]) -> bool {
        false
    }

    /// Results of offloaded filters, available at end of stream.
    fn remote_results(&mut self) -> Option<FilterResults> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Unopened,
    Opened,
    Missing,
    Closed,
}

/// Reader that passes a source through a filter group.
pub struct IoRead {
    source: Box<dyn ReadSource>,
    group: FilterGroup,
    state: ReadState,
    raw: Vec<u8>,
    raw_len: usize,
    source_eof: bool,
    pending: FilterBuf,
    pending_pos: usize,
    offloaded: bool,
    remote_results: Option<FilterResults>,
}

impl IoRead {
    /// Create a reader with default buffer sizes.
    pub fn new(source: Box<dyn ReadSource>) -> Self {
        Self::with_buffer_size(source, IO_BUFFER_SIZE_DEFAULT)
    }

    /// Create a reader whose internal buffers hold `buffer_size` bytes.
    pub fn with_buffer_size(source: Box<dyn ReadSource>, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            source,
            group: FilterGroup::with_stage_size(buffer_size),
            state: ReadState::Unopened,
            raw: vec![0; buffer_size],
            raw_len: 0,
            source_eof: false,
            pending: FilterBuf::new(buffer_size),
            pending_pos: 0,
            offloaded: false,
            remote_results: None,
        }
    }

    /// Append a filter. Filters can only be added before the reader is opened.
    pub fn add_filter(&mut self, filter: Box<dyn Filter>) -> StorageResult<()> {
        if self.state != ReadState::Unopened {
            return Err(StorageError::Assert(
                "filters must be added before the read is opened".to_string(),
            ));
        }
        self.group.push(filter)
    }

    /// Open the source. Returns false if it is missing and missing was allowed.
    pub async fn open(&mut self) -> StorageResult<bool> {
        if self.state != ReadState::Unopened {
            return Err(StorageError::Assert("read is already open".to_string()));
        }
        if !self.group.is_empty() {
            if let Some(defs) = self.group.definitions() {
                if self.source.offload_filters(&defs) {
                    debug!(filters = defs.len(), "read filters offloaded to source");
                    self.group = FilterGroup::with_stage_size(self.raw.len());
                    self.offloaded = true;
                }
            }
        }
        if self.source.open().await? {
            self.state = ReadState::Opened;
            Ok(true)
        } else {
            self.state = ReadState::Missing;
            Ok(false)
        }
    }

    /// True once the source is missing or every filtered byte has been returned.
    pub fn eof(&self) -> bool {
        match self.state {
            ReadState::Missing => true,
            _ => self.group.done() && self.pending_pos >= self.pending.len(),
        }
    }

    /// Fill `out` as far as possible. Returns fewer bytes than requested only at end of stream.
    pub async fn read(&mut self, out: &mut [u8]) -> StorageResult<usize> {
        match self.state {
            ReadState::Opened => {}
            ReadState::Missing => return Ok(0),
            ReadState::Unopened => {
                return Err(StorageError::Assert("read is not open".to_string()));
            }
            ReadState::Closed => {
                return Err(StorageError::Assert("read is closed".to_string()));
            }
        }

        let mut written = 0;
        while written < out.len() {
            let available = self.pending.len() - self.pending_pos;
            if available > 0 {
                let take = available.min(out.len() - written);
                out[written..written + take].copy_from_slice(
                    &self.pending.as_slice()[self.pending_pos..self.pending_pos + take],
                );
                self.pending_pos += take;
                written += take;
                continue;
            }
            if self.group.done() {
                break;
            }

            self.pending.clear();
            self.pending_pos = 0;

            if self.raw_len == 0 && !self.source_eof {
                let n = self.source.read(&mut self.raw).await?;
                trace!(bytes = n, "read from source");
                if n == 0 {
                    self.source_eof = true;
                    if self.offloaded {
                        self.remote_results = self.source.remote_results();
                    }
                } else {
                    self.raw_len = n;
                }
            }

            if self.source_eof {
                self.group.process(None, &mut self.pending)?;
            } else {
                self.group
                    .process(Some(&self.raw[..self.raw_len]), &mut self.pending)?;
                if !self.group.input_same() {
                    self.raw_len = 0;
                }
            }
        }
        Ok(written)
    }

    /// Read everything that remains.
    pub async fn read_all(&mut self) -> StorageResult<Vec<u8>> {
        let mut result = Vec::new();
        let mut buf = vec![0u8; self.raw.len()];
        loop {
            let n = self.read(&mut buf).await?;
            result.extend_from_slice(&buf[..n]);
            if n < buf.len() || self.eof() {
                break;
            }
        }
        Ok(result)
    }

    /// Close the source. Closing twice, or closing a missing source, does nothing.
    pub async fn close(&mut self) -> StorageResult<()> {
        match self.state {
            ReadState::Opened => {
                self.state = ReadState::Closed;
                self.source.close().await
            }
            ReadState::Unopened | ReadState::Missing => {
                self.state = ReadState::Closed;
                Ok(())
            }
            ReadState::Closed => Ok(()),
        }
    }

    /// Filter results. Complete only once the read has reached end of stream.
    pub fn results(&self) -> FilterResults {
        if self.offloaded {
            self.remote_results.clone().unwrap_or_default()
        } else {
            self.group.results()
        }
    }

    /// True when the filters run at the source.
    pub fn offloaded(&self) -> bool {
        self.offloaded
    }
}

impl std::fmt::Debug for IoRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRead")
            .field("state", &self.state)
            .field("group", &self.group)
            .field("offloaded", &self.offloaded)
            .finish()
    }
}

/// In-memory source, mostly useful for tests and small payloads.
#[derive(Debug)]
pub struct BufferSource {
    data: Option<Vec<u8>>,
    pos: usize,
    opened: bool,
}

impl BufferSource {
    /// Source over `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Some(data),
            pos: 0,
            opened: false,
        }
    }

    /// Source that reports itself as missing.
    pub fn missing() -> Self {
        Self {
            data: None,
            pos: 0,
            opened: false,
        }
    }
}

#[async_trait]
impl ReadSource for BufferSource {
    async fn open(&mut self) -> StorageResult<bool> {
        self.opened = true;
        Ok(self.data.is_some())
    }

    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        let Some(data) = &self.data else {
            return Ok(0);
        };
        let n = (data.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    async fn close(&mut self) -> StorageResult<()> {
        self.opened = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterResult, SizeFilter};
    use crate::hash::{HashFilter, HashType};

    #[tokio::test]
    async fn test_read_all_unfiltered() {
        let data: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let mut read = IoRead::with_buffer_size(Box::new(BufferSource::new(data.clone())), 1000);
        assert!(read.open().await.unwrap());
        assert_eq!(read.read_all().await.unwrap(), data);
        assert!(read.eof());
        read.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_fills_buffer_until_eof() {
        let mut read = IoRead::with_buffer_size(Box::new(BufferSource::new(vec![1; 25])), 4);
        read.open().await.unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(read.read(&mut buf).await.unwrap(), 10);
        assert_eq!(read.read(&mut buf).await.unwrap(), 10);
        assert_eq!(read.read(&mut buf).await.unwrap(), 5);
        assert!(read.eof());
        assert_eq!(read.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_with_filters() {
        let data = b"the quick brown fox".to_vec();
        let mut read = IoRead::with_buffer_size(Box::new(BufferSource::new(data.clone())), 3);
        read.add_filter(Box::new(SizeFilter::new())).unwrap();
        read.add_filter(Box::new(HashFilter::new(HashType::Sha256)))
            .unwrap();
        read.open().await.unwrap();
        assert_eq!(read.read_all().await.unwrap(), data);
        let results = read.results();
        assert_eq!(results.get("size"), Some(&FilterResult::Size(data.len() as u64)));
        assert_eq!(
            results.hash(),
            Some(HashFilter::digest_of(HashType::Sha256, &data).as_str())
        );
    }

    #[tokio::test]
    async fn test_missing_source() {
        let mut read = IoRead::new(Box::new(BufferSource::missing()));
        assert!(!read.open().await.unwrap());
        assert!(read.eof());
        let mut buf = [0u8; 4];
        assert_eq!(read.read(&mut buf).await.unwrap(), 0);
        read.close().await.unwrap();
        read.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_filter_after_open_rejected() {
        let mut read = IoRead::new(Box::new(BufferSource::new(vec![])));
        read.open().await.unwrap();
        let err = read.add_filter(Box::new(SizeFilter::new())).unwrap_err();
        assert!(matches!(err, StorageError::Assert(_)));
    }

    #[tokio::test]
    async fn test_read_before_open_rejected() {
        let mut read = IoRead::new(Box::new(BufferSource::new(vec![1, 2])));
        let mut buf = [0u8; 2];
        assert!(matches!(
            read.read(&mut buf).await,
            Err(StorageError::Assert(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut read = IoRead::new(Box::new(BufferSource::new(vec![1, 2, 3])));
        read.open().await.unwrap();
        read.close().await.unwrap();
        read.close().await.unwrap();
        let mut buf = [0u8; 2];
        assert!(read.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_source() {
        let mut read = IoRead::new(Box::new(BufferSource::new(Vec::new())));
        read.add_filter(Box::new(SizeFilter::new())).unwrap();
        read.open().await.unwrap();
        assert!(read.read_all().await.unwrap().is_empty());
        assert!(read.eof());
        assert_eq!(read.results().size(), Some(0));
    }
}
