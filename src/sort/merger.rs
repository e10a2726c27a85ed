//! K-way merging of runs through the merge heap.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::compare::Compare;
use crate::diskio::io_stats::IoStatsTracker;
use crate::error::{Result, SortError};
use crate::record::Record;
use crate::resources::{MemoryBucket, Reservation, Resources};
use crate::sort::catalog::RunCatalog;
use crate::sort::merge_heap::MergeHeap;
use crate::sort::params::stream_memory;
use crate::sort::progress::ProgressTracker;
use crate::sort::run::{RunCursor, RunDescriptor, RunReader};

/// What every run stream of one sorter is opened with.
#[derive(Clone)]
pub struct StreamContext {
    pub resources: Arc<Resources>,
    pub memory: MemoryBucket,
    pub block_size: usize,
    pub io_tracker: IoStatsTracker,
}

impl StreamContext {
    pub fn stream_memory(&self) -> usize {
        stream_memory(self.block_size)
    }
}

/// Merges up to `fanout` runs, one input stream per run.
pub struct Merger<T> {
    readers: Vec<Option<RunReader<T>>>,
    heap: MergeHeap<T>,
    _memory: Reservation,
}

impl<T: Record> Merger<T> {
    /// Bytes a merger over `runs` inputs reserves.
    pub fn memory_usage(ctx: &StreamContext, runs: usize) -> usize {
        runs * ctx.stream_memory() + MergeHeap::<T>::memory_usage(runs)
    }

    /// Opens every input and loads its head. Inputs keep their relative order
    /// for tie-breaking.
    pub fn open<C: Compare<T>>(
        ctx: &StreamContext,
        catalog: &mut RunCatalog,
        inputs: Vec<RunCursor>,
        cmp: &C,
    ) -> Result<Self> {
        let memory = ctx.memory.reserve(Self::memory_usage(ctx, inputs.len()))?;
        let mut merger = Self {
            readers: Vec::with_capacity(inputs.len()),
            heap: MergeHeap::with_capacity(inputs.len()),
            _memory: memory,
        };
        for (i, cursor) in inputs.into_iter().enumerate() {
            let path = catalog.file_path(cursor.run.file);
            let mut reader = RunReader::open(
                &ctx.resources,
                &path,
                cursor,
                ctx.block_size,
                Some(ctx.io_tracker.clone()),
            )?;
            match reader.next_item()? {
                Some(head) => {
                    merger.heap.unsafe_push(head, i);
                    merger.readers.push(Some(reader));
                }
                None => {
                    catalog.release_run(reader.run(), reader.handle())?;
                    merger.readers.push(None);
                }
            }
        }
        merger.heap.make_safe(cmp);
        Ok(merger)
    }

    pub fn can_pull(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Inputs the merger was opened with.
    pub fn width(&self) -> usize {
        self.readers.len()
    }

    /// Open input streams.
    pub fn active_runs(&self) -> usize {
        self.heap.len()
    }

    /// Next item in merged order, advancing the run it came from. An exhausted
    /// run is closed and released from the catalog.
    pub fn pull<C: Compare<T>>(&mut self, catalog: &mut RunCatalog, cmp: &C) -> Result<Option<T>> {
        let run = match self.heap.top() {
            Some((_, run)) => run,
            None => return Ok(None),
        };
        let Some(reader) = self.readers[run].as_mut() else {
            // No stream behind this head; it is the last item of its run.
            return Ok(self.heap.pop(cmp).map(|(item, _)| item));
        };
        match reader.next_item()? {
            Some(next) => {
                if let Some((head, _)) = self.heap.top() {
                    if cmp.compare(&next, head).is_lt() {
                        let run = reader.run();
                        return Err(SortError::CorruptRun {
                            level: run.level,
                            run: run.index,
                            offset: reader.cursor_at_head().offset,
                            reason: format!(
                                "item {} is smaller than its predecessor",
                                run.items - reader.remaining() - 1
                            ),
                        });
                    }
                }
                Ok(self.heap.replace_top(next, cmp).map(|(item, _)| item))
            }
            None => {
                let popped = self.heap.pop(cmp).map(|(item, _)| item);
                if let Some(reader) = self.readers[run].take() {
                    catalog.release_run(reader.run(), reader.handle())?;
                }
                Ok(popped)
            }
        }
    }

    /// Positions to resume every unfinished input from, in input order.
    pub fn cursors(&self) -> Vec<RunCursor> {
        self.readers
            .iter()
            .flatten()
            .map(|reader| reader.cursor_at_head())
            .collect()
    }
}

/// Merges `inputs` into a new run at `level`.
pub(crate) fn merge_runs<T: Record, C: Compare<T>>(
    ctx: &StreamContext,
    catalog: &mut RunCatalog,
    inputs: Vec<RunCursor>,
    level: usize,
    cmp: &C,
    progress: &mut ProgressTracker<'_>,
) -> Result<RunDescriptor> {
    let start = Instant::now();
    let input_count = inputs.len();
    let mut merger = Merger::open(ctx, catalog, inputs, cmp)?;
    let _out_memory = ctx.memory.reserve(ctx.stream_memory())?;
    let mut writer = catalog.start_run::<T>(
        &ctx.resources,
        level,
        ctx.block_size,
        Some(ctx.io_tracker.clone()),
    )?;
    while let Some(item) = merger.pull(catalog, cmp)? {
        writer.push(&item)?;
        progress.tick();
    }
    drop(merger);
    let run = catalog.finish_run(writer)?;
    debug!(
        inputs = input_count,
        level,
        run = run.index,
        items = run.items,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "merged runs"
    );
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::NaturalOrder;
    use crate::sort::progress::NoProgress;
    use tempfile::tempdir;

    fn context(resources: &Arc<Resources>) -> StreamContext {
        StreamContext {
            resources: Arc::clone(resources),
            memory: MemoryBucket::new(Arc::clone(resources)),
            block_size: 64,
            io_tracker: IoStatsTracker::new(),
        }
    }

    fn write_level(
        catalog: &mut RunCatalog,
        ctx: &StreamContext,
        level: usize,
        runs: &[&[u64]],
    ) -> Vec<RunCursor> {
        runs.iter()
            .map(|items| {
                let mut writer = catalog
                    .start_run::<u64>(&ctx.resources, level, ctx.block_size, None)
                    .unwrap();
                for item in items.iter() {
                    writer.push(item).unwrap();
                }
                RunCursor::start(&catalog.finish_run(writer).unwrap())
            })
            .collect()
    }

    fn pull_all(
        merger: &mut Merger<u64>,
        catalog: &mut RunCatalog,
    ) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        while let Some(item) = merger.pull(catalog, &NaturalOrder)? {
            out.push(item);
        }
        Ok(out)
    }

    #[test]
    fn test_merge_releases_everything() {
        let base = tempdir().unwrap();
        let resources = Resources::unlimited();
        let ctx = context(&resources);
        let mut catalog = RunCatalog::new(base.path(), 4);
        let inputs = write_level(&mut catalog, &ctx, 0, &[&[1, 4, 9], &[], &[2, 3, 10, 11], &[0]]);

        let mut merger = Merger::open(&ctx, &mut catalog, inputs, &NaturalOrder).unwrap();
        assert_eq!(merger.active_runs(), 3);
        assert_eq!(resources.files().used(), 3);
        let out = pull_all(&mut merger, &mut catalog).unwrap();
        assert_eq!(out, vec![0, 1, 2, 3, 4, 9, 10, 11]);
        assert!(!merger.can_pull());
        assert_eq!(resources.files().used(), 0);
        assert_eq!(catalog.temp_bytes(), 0);

        drop(merger);
        assert_eq!(resources.memory().used(), 0);
    }

    #[test]
    fn test_resume_from_cursors() {
        let base = tempdir().unwrap();
        let resources = Resources::unlimited();
        let ctx = context(&resources);
        let mut catalog = RunCatalog::new(base.path(), 4);
        let inputs = write_level(&mut catalog, &ctx, 0, &[&[1, 5, 5, 8], &[2, 5, 6], &[3]]);

        let mut merger = Merger::open(&ctx, &mut catalog, inputs, &NaturalOrder).unwrap();
        let mut out = Vec::new();
        for _ in 0..4 {
            out.push(merger.pull(&mut catalog, &NaturalOrder).unwrap().unwrap());
        }
        let cursors = merger.cursors();
        assert_eq!(cursors.len(), 2);
        drop(merger);
        assert_eq!(resources.files().used(), 0);

        let mut merger = Merger::open(&ctx, &mut catalog, cursors, &NaturalOrder).unwrap();
        out.extend(pull_all(&mut merger, &mut catalog).unwrap());
        assert_eq!(out, vec![1, 2, 3, 5, 5, 5, 6, 8]);
    }

    #[test]
    fn test_unsorted_run_is_corrupt() {
        let base = tempdir().unwrap();
        let resources = Resources::unlimited();
        let ctx = context(&resources);
        let mut catalog = RunCatalog::new(base.path(), 2);
        let inputs = write_level(&mut catalog, &ctx, 0, &[&[1, 7, 3], &[2]]);

        let mut merger = Merger::open(&ctx, &mut catalog, inputs, &NaturalOrder).unwrap();
        let err = pull_all(&mut merger, &mut catalog).unwrap_err();
        assert!(matches!(err, SortError::CorruptRun { level: 0, run: 0, .. }));
    }

    #[test]
    fn test_merge_runs_writes_next_level() {
        let base = tempdir().unwrap();
        let resources = Resources::unlimited();
        let ctx = context(&resources);
        let mut catalog = RunCatalog::new(base.path(), 2);
        let inputs = write_level(&mut catalog, &ctx, 0, &[&[3, 5], &[1, 3]]);

        let mut sink = NoProgress;
        let mut progress = ProgressTracker::new(&mut sink, 4);
        let run = merge_runs::<u64, _>(&ctx, &mut catalog, inputs, 1, &NaturalOrder, &mut progress).unwrap();
        assert_eq!((run.level, run.index, run.items), (1, 0, 4));
        assert_eq!(catalog.run_count(1), 1);

        let mut merger =
            Merger::open(&ctx, &mut catalog, vec![RunCursor::start(&run)], &NaturalOrder).unwrap();
        assert_eq!(pull_all(&mut merger, &mut catalog).unwrap(), vec![1, 3, 3, 5]);
    }

    #[test]
    fn test_head_without_stream_ends_its_run() {
        let base = tempdir().unwrap();
        let resources = Resources::unlimited();
        let ctx = context(&resources);
        let mut catalog = RunCatalog::new(base.path(), 2);
        let inputs = write_level(&mut catalog, &ctx, 0, &[&[1, 4], &[2, 3]]);

        let mut merger = Merger::open(&ctx, &mut catalog, inputs, &NaturalOrder).unwrap();
        merger.readers[0] = None;
        assert_eq!(pull_all(&mut merger, &mut catalog).unwrap(), vec![1, 2, 3]);
        assert!(!merger.can_pull());
    }
}
