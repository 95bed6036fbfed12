//! Read stream handed out by the facade.

use std::sync::Arc;

use tidepool_io::{Filter, FilterResults, IoRead, StorageResult};
use tracing::debug;

use crate::driver::{ReadOptions, StorageDriver};

/// Filtered read of one file on one driver.
#[derive(Debug)]
pub struct StorageRead {
    driver: Arc<dyn StorageDriver>,
    name: String,
    options: ReadOptions,
    io: IoRead,
}

impl StorageRead {
    pub(crate) fn new(
        driver: Arc<dyn StorageDriver>,
        name: String,
        options: ReadOptions,
    ) -> StorageResult<Self> {
        let source = driver.new_read(&name, &options)?;
        Ok(Self {
            driver,
            name,
            options,
            io: IoRead::new(source),
        })
    }

    /// Absolute path being read.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options the read was created with.
    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    /// True when a missing file is not an error.
    pub fn ignore_missing(&self) -> bool {
        self.options.ignore_missing
    }

    pub(crate) fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    /// Append a filter. Only allowed before open.
    pub fn add_filter(&mut self, filter: Box<dyn Filter>) -> StorageResult<()> {
        self.io.add_filter(filter)
    }

    /// Open the file. Returns false when it is missing and `ignore_missing` is set.
    pub async fn open(&mut self) -> StorageResult<bool> {
        debug!(driver = self.driver.kind(), path = %self.name, "open read");
        self.io.open().await
    }

    /// Fill `out`; fewer bytes than requested only at end of file.
    pub async fn read(&mut self, out: &mut [u8]) -> StorageResult<usize> {
        self.io.read(out).await
    }

    /// Read everything that remains.
    pub async fn read_all(&mut self) -> StorageResult<Vec<u8>> {
        self.io.read_all().await
    }

    /// True at end of file.
    pub fn eof(&self) -> bool {
        self.io.eof()
    }

    /// Close the file. A second close does nothing.
    pub async fn close(&mut self) -> StorageResult<()> {
        self.io.close().await
    }

    /// Filter results, complete at end of file.
    pub fn results(&self) -> FilterResults {
        self.io.results()
    }
}
