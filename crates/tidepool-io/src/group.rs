//! Ordered chain of filters driven as one filter.

use tracing::trace;

use crate::buffer::{FilterBuf, IO_BUFFER_SIZE_DEFAULT};
use crate::error::{StorageError, StorageResult};
use crate::filter::{Filter, FilterDef, FilterResults, PassThrough};

/// Filters applied in order, each feeding the next through an intermediate buffer.
///
/// Upstream filters only run once the buffer they write into has been fully consumed by the
/// next filter, so a stage never holds more than `stage_size` bytes regardless of how much a
/// filter expands its input.
pub struct FilterGroup {
    filters: Vec<Box<dyn Filter>>,
    stages: Vec<FilterBuf>,
    stage_size: usize,
    pass: PassThrough,
    input_same: bool,
    done: bool,
    started: bool,
}

impl FilterGroup {
    /// Create an empty group. With no filters the group copies input to output.
    pub fn new() -> Self {
        Self::with_stage_size(IO_BUFFER_SIZE_DEFAULT)
    }

    /// Create an empty group whose intermediate buffers hold `stage_size` bytes.
    pub fn with_stage_size(stage_size: usize) -> Self {
        Self {
            filters: Vec::new(),
            stages: Vec::new(),
            stage_size: stage_size.max(1),
            pass: PassThrough::new(),
            input_same: false,
            done: false,
            started: false,
        }
    }

    /// Rebuild a group from serialized definitions.
    pub fn from_definitions(defs: &[FilterDef]) -> StorageResult<Self> {
        let mut group = Self::new();
        for def in defs {
            group.push(def.build()?)?;
        }
        Ok(group)
    }

    /// Append a filter to the end of the chain. Not allowed once processing has started.
    pub fn push(&mut self, filter: Box<dyn Filter>) -> StorageResult<()> {
        if self.started {
            return Err(StorageError::Assert(format!(
                "cannot add filter '{}' after processing has started",
                filter.kind()
            )));
        }
        if !self.filters.is_empty() {
            self.stages.push(FilterBuf::new(self.stage_size));
        }
        self.filters.push(filter);
        Ok(())
    }

    /// Number of filters in the chain.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// True when the chain has no filters.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Results of every filter that produced one, in chain order.
    pub fn results(&self) -> FilterResults {
        let mut results = FilterResults::new();
        for filter in &self.filters {
            if let Some(result) = filter.result() {
                results.push(filter.kind(), result);
            }
        }
        results
    }

    /// Definitions of every filter, or `None` if any filter cannot be described.
    pub fn definitions(&self) -> Option<Vec<FilterDef>> {
        self.filters.iter().map(|f| f.definition()).collect()
    }

    fn run(&mut self, input: Option<&[u8]>, output: &mut FilterBuf) -> StorageResult<()> {
        let count = self.filters.len();
        let mut input_consumed = false;

        loop {
            let mut progress = false;

            for idx in 0..count {
                if self.filters[idx].done() {
                    continue;
                }
                let upstream_done = idx > 0 && self.filters[idx - 1].done();
                let (before, after) = self.stages.split_at_mut(idx);

                let src: Option<&[u8]> = if idx == 0 {
                    match input {
                        Some(_) if input_consumed => continue,
                        other => other,
                    }
                } else {
                    let stage = &before[idx - 1];
                    if !stage.is_empty() {
                        Some(stage.as_slice())
                    } else if upstream_done {
                        None
                    } else {
                        continue;
                    }
                };

                let dest: &mut FilterBuf = if idx == count - 1 {
                    if output.is_full() {
                        continue;
                    }
                    &mut *output
                } else {
                    let stage = &mut after[0];
                    if !stage.is_empty() {
                        continue;
                    }
                    stage
                };

                let filter = &mut self.filters[idx];
                let dest_before = dest.len();
                filter.process(src, dest)?;
                let produced = dest.len() > dest_before;
                let consumed = src.is_some() && !filter.input_same();
                let finished = filter.done();

                if consumed {
                    if idx == 0 {
                        input_consumed = true;
                    } else {
                        before[idx - 1].clear();
                    }
                }
                if produced || consumed || finished {
                    progress = true;
                }
            }

            if !progress || output.is_full() {
                break;
            }
        }

        self.input_same = input.is_some() && !input_consumed;
        self.done = input.is_none()
            && self.filters.iter().all(|f| f.done())
            && self.stages.iter().all(|s| s.is_empty());
        if self.done {
            trace!(filters = count, "filter group done");
        }
        Ok(())
    }
}

impl Default for FilterGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FilterGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&str> = self.filters.iter().map(|f| f.kind()).collect();
        f.debug_struct("FilterGroup")
            .field("filters", &kinds)
            .field("stage_size", &self.stage_size)
            .field("done", &self.done)
            .finish()
    }
}

impl Filter for FilterGroup {
    fn kind(&self) -> &'static str {
        "group"
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut FilterBuf) -> StorageResult<()> {
        self.started = true;
        if self.filters.is_empty() {
            self.pass.forward(input, output);
            self.input_same = self.pass.input_same();
            self.done = self.pass.done();
            return Ok(());
        }
        self.run(input, output)
    }

    fn done(&self) -> bool {
        self.done
    }

    fn input_same(&self) -> bool {
        self.input_same
    }
}
