//! Sequential writing and checked reading of a single run.

use std::io;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use crate::diskio::block_io::{BlockReader, BlockWriter};
use crate::diskio::file::{FileHandle, OpenMode};
use crate::diskio::io_stats::IoStatsTracker;
use crate::error::{Result, SortError};
use crate::record::Record;
use crate::resources::Resources;

/// Location and size of a closed run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunDescriptor {
    /// Merge level; leaf runs are level 0.
    pub level: usize,
    /// Run number within its level.
    pub index: usize,
    /// Catalog file the run lives in.
    pub file: usize,
    pub offset: u64,
    pub bytes: u64,
    pub items: u64,
}

impl RunDescriptor {
    pub fn end(&self) -> u64 {
        self.offset + self.bytes
    }
}

/// Where reading of a partially consumed run resumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunCursor {
    pub run: RunDescriptor,
    /// Byte offset of the next item to return.
    pub offset: u64,
    /// Items left, including the one at `offset`.
    pub remaining: u64,
}

impl RunCursor {
    pub fn start(run: &RunDescriptor) -> Self {
        Self {
            run: run.clone(),
            offset: run.offset,
            remaining: run.items,
        }
    }
}

pub struct RunWriter<T> {
    writer: BlockWriter,
    level: usize,
    index: usize,
    file: usize,
    offset: u64,
    items: u64,
    _marker: PhantomData<T>,
}

impl<T: Record> RunWriter<T> {
    /// Opens `path` and positions the new run at `offset`. With `truncate` the
    /// file is emptied first and `offset` must be 0.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        resources: &Arc<Resources>,
        path: &Path,
        truncate: bool,
        offset: u64,
        level: usize,
        index: usize,
        file: usize,
        block_size: usize,
        io_tracker: Option<IoStatsTracker>,
    ) -> Result<Self> {
        debug_assert!(!truncate || offset == 0);
        let mode = if truncate {
            OpenMode::Truncate
        } else {
            OpenMode::Write
        };
        let handle = FileHandle::open(resources, path, mode)?;
        Ok(Self {
            writer: BlockWriter::new(handle, offset, block_size, io_tracker),
            level,
            index,
            file,
            offset,
            items: 0,
            _marker: PhantomData,
        })
    }

    pub fn push(&mut self, item: &T) -> Result<()> {
        let position = self.writer.position();
        item.write_to(&mut self.writer).map_err(|e| {
            SortError::io(self.writer.handle().path(), position, e)
        })?;
        self.items += 1;
        Ok(())
    }

    /// Flushes and closes the run.
    pub fn finish(self) -> Result<RunDescriptor> {
        let path = self.writer.handle().path().to_path_buf();
        let position = self.writer.position();
        let bytes = self
            .writer
            .finish()
            .map_err(|e| SortError::io(path, position, e))?;
        Ok(RunDescriptor {
            level: self.level,
            index: self.index,
            file: self.file,
            offset: self.offset,
            bytes,
            items: self.items,
        })
    }
}

/// Reads a run back, checking it against its descriptor.
pub struct RunReader<T> {
    reader: BlockReader,
    run: RunDescriptor,
    remaining: u64,
    head_offset: u64,
    _marker: PhantomData<T>,
}

impl<T: Record> RunReader<T> {
    pub fn open(
        resources: &Arc<Resources>,
        path: &Path,
        cursor: RunCursor,
        block_size: usize,
        io_tracker: Option<IoStatsTracker>,
    ) -> Result<Self> {
        let run = cursor.run;
        let handle = FileHandle::open(resources, path, OpenMode::Update)?;
        let file_len = handle
            .fd()
            .size()
            .map_err(|e| SortError::io(path, 0, e))?;
        if file_len < run.end() {
            return Err(corrupt(
                &run,
                file_len,
                format!(
                    "run spans bytes {}..{} but the file is {} bytes long",
                    run.offset,
                    run.end(),
                    file_len
                ),
            ));
        }
        if cursor.offset < run.offset || cursor.offset > run.end() || cursor.remaining > run.items {
            return Err(corrupt(
                &run,
                cursor.offset,
                format!(
                    "resume point (offset {}, {} items) lies outside the run",
                    cursor.offset, cursor.remaining
                ),
            ));
        }
        Ok(Self {
            reader: BlockReader::new(handle, cursor.offset, run.end(), block_size, io_tracker),
            run,
            remaining: cursor.remaining,
            head_offset: cursor.offset,
            _marker: PhantomData,
        })
    }

    pub fn run(&self) -> &RunDescriptor {
        &self.run
    }

    /// Items not yet returned by `next_item`.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Cursor positioned at the most recently returned item, so that a reader
    /// reopened from it returns that item again.
    pub fn cursor_at_head(&self) -> RunCursor {
        RunCursor {
            run: self.run.clone(),
            offset: self.head_offset,
            remaining: self.remaining + 1,
        }
    }

    pub fn handle(&self) -> &FileHandle {
        self.reader.handle()
    }

    pub fn next_item(&mut self) -> Result<Option<T>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let offset = self.reader.position();
        let item = T::read_from(&mut self.reader).map_err(|e| self.read_error(offset, e))?;
        self.head_offset = offset;
        self.remaining -= 1;
        if self.remaining == 0 && self.reader.remaining() != 0 {
            return Err(corrupt(
                &self.run,
                self.reader.position(),
                format!(
                    "{} trailing bytes after the last of {} items",
                    self.reader.remaining(),
                    self.run.items
                ),
            ));
        }
        Ok(Some(item))
    }

    fn read_error(&self, offset: u64, e: io::Error) -> SortError {
        let read = self.run.items - self.remaining;
        match e.kind() {
            io::ErrorKind::UnexpectedEof => corrupt(
                &self.run,
                offset,
                format!("run ends after {} of {} items", read, self.run.items),
            ),
            io::ErrorKind::InvalidData => corrupt(
                &self.run,
                offset,
                format!("item {} does not decode: {}", read, e),
            ),
            _ => SortError::io(self.reader.handle().path(), offset, e),
        }
    }
}

fn corrupt(run: &RunDescriptor, offset: u64, reason: String) -> SortError {
    SortError::CorruptRun {
        level: run.level,
        run: run.index,
        offset,
        reason,
    }
}
