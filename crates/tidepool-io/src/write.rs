//! Filtered writes to an asynchronous byte sink.

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::buffer::{FilterBuf, IO_BUFFER_SIZE_DEFAULT};
use crate::error::{StorageError, StorageResult};
use crate::filter::{Filter, FilterDef, FilterResults};
use crate::group::FilterGroup;

/// Raw byte destination behind an [`IoWrite`].
#[async_trait]
pub trait WriteSink: Send {
    /// Prepare the destination.
    async fn open(&mut self) -> StorageResult<()>;

    /// Write all of `data`.
    async fn write(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Commit the destination. Dropping a sink without closing it must discard what was written.
    async fn close(&mut self) -> StorageResult<()>;

    /// Offer to run the filters at the destination instead of locally. Called before `open`.
    fn offload_filters(&mut self, _defs: &[FilterDef]) -> bool {
        false
    }

    /// Results of offloaded filters, available after `close`.
    fn remote_results(&mut self) -> Option<FilterResults> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WriteState {
    Unopened,
    Opened,
    Closed,
    // commit failed; later closes report the same error
    Failed(StorageError),
}

/// Writer that passes data through a filter group before it reaches the sink.
pub struct IoWrite {
    sink: Box<dyn WriteSink>,
    group: FilterGroup,
    state: WriteState,
    output: FilterBuf,
    offloaded: bool,
    remote_results: Option<FilterResults>,
}

impl IoWrite {
    /// Create a writer with default buffer sizes.
    pub fn new(sink: Box<dyn WriteSink>) -> Self {
        Self::with_buffer_size(sink, IO_BUFFER_SIZE_DEFAULT)
    }

    /// Create a writer whose internal buffers hold `buffer_size` bytes.
    pub fn with_buffer_size(sink: Box<dyn WriteSink>, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            sink,
            group: FilterGroup::with_stage_size(buffer_size),
            state: WriteState::Unopened,
            output: FilterBuf::new(buffer_size),
            offloaded: false,
            remote_results: None,
        }
    }

    /// Append a filter. Filters can only be added before the writer is opened.
    pub fn add_filter(&mut self, filter: Box<dyn Filter>) -> StorageResult<()> {
        if self.state != WriteState::Unopened {
            return Err(StorageError::Assert(
                "filters must be added before the write is opened".to_string(),
            ));
        }
        self.group.push(filter)
    }

    /// Open the sink.
    pub async fn open(&mut self) -> StorageResult<()> {
        if self.state != WriteState::Unopened {
            return Err(StorageError::Assert("write is already open".to_string()));
        }
        if !self.group.is_empty() {
            if let Some(defs) = self.group.definitions() {
                if self.sink.offload_filters(&defs) {
                    debug!(filters = defs.len(), "write filters offloaded to sink");
                    self.group = FilterGroup::with_stage_size(self.output.limit());
                    self.offloaded = true;
                }
            }
        }
        self.sink.open().await?;
        self.state = WriteState::Opened;
        Ok(())
    }

    /// Filter `data` and pass the result to the sink.
    pub async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        if self.state != WriteState::Opened {
            return Err(StorageError::Assert("write is not open".to_string()));
        }
        loop {
            self.output.clear();
            self.group.process(Some(data), &mut self.output)?;
            self.flush().await?;
            if !self.group.input_same() {
                break;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> StorageResult<()> {
        if !self.output.is_empty() {
            trace!(bytes = self.output.len(), "write to sink");
            self.sink.write(self.output.as_slice()).await?;
        }
        Ok(())
    }

    /// Flush the filters and commit the sink. Closing twice does nothing, but once a close
    /// has failed every later close returns that failure.
    pub async fn close(&mut self) -> StorageResult<()> {
        match &self.state {
            WriteState::Closed => return Ok(()),
            WriteState::Failed(err) => return Err(err.clone()),
            WriteState::Unopened => {
                return Err(StorageError::Assert("write is not open".to_string()));
            }
            WriteState::Opened => {}
        }
        if let Err(err) = self.commit().await {
            self.state = WriteState::Failed(err.clone());
            return Err(err);
        }
        self.state = WriteState::Closed;
        if self.offloaded {
            self.remote_results = self.sink.remote_results();
        }
        Ok(())
    }

    async fn commit(&mut self) -> StorageResult<()> {
        while !self.group.done() {
            self.output.clear();
            self.group.process(None, &mut self.output)?;
            self.flush().await?;
        }
        self.sink.close().await
    }

    /// Filter results, complete after `close`.
    pub fn results(&self) -> FilterResults {
        if self.offloaded {
            self.remote_results.clone().unwrap_or_default()
        } else {
            self.group.results()
        }
    }

    /// True once the writer has been closed.
    pub fn closed(&self) -> bool {
        self.state == WriteState::Closed
    }

    /// True when the filters run at the sink.
    pub fn offloaded(&self) -> bool {
        self.offloaded
    }
}

impl std::fmt::Debug for IoWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoWrite")
            .field("state", &self.state)
            .field("group", &self.group)
            .field("offloaded", &self.offloaded)
            .finish()
    }
}

/// In-memory sink that hands its contents to a shared buffer on close.
#[derive(Debug, Default, Clone)]
pub struct BufferSink {
    staged: Vec<u8>,
    committed: std::sync::Arc<parking_lot::Mutex<Option<Vec<u8>>>>,
}

impl BufferSink {
    /// Create a sink; [`BufferSink::contents`] on any clone returns the committed data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Data committed by `close`, if it has happened.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.committed.lock().clone()
    }
}

#[async_trait]
impl WriteSink for BufferSink {
    async fn open(&mut self) -> StorageResult<()> {
        self.staged.clear();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.staged.extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) -> StorageResult<()> {
        *self.committed.lock() = Some(std::mem::take(&mut self.staged));
        Ok(())
    }
}
