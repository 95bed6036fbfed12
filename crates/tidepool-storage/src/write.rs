//! Write stream handed out by the facade.

use std::sync::Arc;

use tidepool_io::{Filter, FilterResults, IoWrite, StorageResult};
use tracing::debug;

use crate::driver::{StorageDriver, WriteOptions};

/// Filtered write of one file on one driver.
///
/// Dropping it without [`StorageWrite::close`] aborts the write; atomic writes leave nothing
/// under the final name.
#[derive(Debug)]
pub struct StorageWrite {
    driver: Arc<dyn StorageDriver>,
    name: String,
    options: WriteOptions,
    io: IoWrite,
}

impl StorageWrite {
    pub(crate) fn new(
        driver: Arc<dyn StorageDriver>,
        name: String,
        options: WriteOptions,
    ) -> StorageResult<Self> {
        let sink = driver.new_write(&name, &options)?;
        Ok(Self {
            driver,
            name,
            options,
            io: IoWrite::new(sink),
        })
    }

    /// Absolute path being written.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Effective options after the driver adjusted them.
    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    pub(crate) fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    /// Append a filter. Only allowed before open.
    pub fn add_filter(&mut self, filter: Box<dyn Filter>) -> StorageResult<()> {
        self.io.add_filter(filter)
    }

    /// Open the file for writing.
    pub async fn open(&mut self) -> StorageResult<()> {
        debug!(driver = self.driver.kind(), path = %self.name, atomic = self.options.atomic, "open write");
        self.io.open().await
    }

    /// Write `data` through the filters.
    pub async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.io.write(data).await
    }

    /// Flush the filters and commit the file. A second close after a successful one does
    /// nothing; after a failed one it returns the same error.
    pub async fn close(&mut self) -> StorageResult<()> {
        if self.io.closed() {
            return Ok(());
        }
        self.io.close().await?;
        debug!(driver = self.driver.kind(), path = %self.name, "write committed");
        Ok(())
    }

    /// Filter results, complete after close.
    pub fn results(&self) -> FilterResults {
        self.io.results()
    }
}
