//! Bookkeeping of closed runs and the temp files that hold them.
//!
//! Runs are banked by level parity over `2 * fanout` files: run `r` of level
//! `l` is appended to file `(l % 2) * fanout + r % fanout`. Merging level `l`
//! writes level `l + 1` into the other bank, so the first run a file receives
//! at a new level may truncate it, since whatever it held two levels below has
//! been merged already.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::diskio::file::FileHandle;
use crate::diskio::io_stats::IoStatsTracker;
use crate::error::{Result, SortError};
use crate::record::Record;
use crate::resources::Resources;
use crate::sort::run::{RunDescriptor, RunWriter};

/// Uniquely named scratch directory, removed with everything in it on drop.
pub struct TempDirInfo {
    path: PathBuf,
    created: bool,
}

impl TempDirInfo {
    /// Picks a fresh name under `base`; the directory is created on first use.
    pub fn new(base: impl AsRef<Path>) -> Self {
        let name = format!("runmerge-{}-{:016x}", std::process::id(), rand::random::<u64>());
        Self {
            path: base.as_ref().join(name),
            created: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ensure_created(&mut self) -> Result<&Path> {
        if !self.created {
            std::fs::create_dir_all(&self.path).map_err(|e| SortError::io(&self.path, 0, e))?;
            self.created = true;
        }
        Ok(&self.path)
    }
}

impl Drop for TempDirInfo {
    fn drop(&mut self) {
        if self.created {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

impl AsRef<Path> for TempDirInfo {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

#[derive(Clone, Debug, Default)]
struct RunFile {
    len: u64,
    level: Option<usize>,
    live_runs: usize,
}

pub struct RunCatalog {
    dir: TempDirInfo,
    fanout: usize,
    files: Vec<RunFile>,
    /// Closed runs per merge level, in creation order.
    levels: Vec<Vec<RunDescriptor>>,
    runs_written: usize,
}

impl RunCatalog {
    pub fn new(base: impl AsRef<Path>, fanout: usize) -> Self {
        Self {
            dir: TempDirInfo::new(base),
            fanout,
            files: vec![RunFile::default(); 2 * fanout],
            levels: Vec::new(),
            runs_written: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn file_index(&self, level: usize, run: usize) -> usize {
        (level % 2) * self.fanout + run % self.fanout
    }

    pub fn file_path(&self, file: usize) -> PathBuf {
        self.dir.path().join(format!("run_file_{}", file))
    }

    pub fn runs(&self, level: usize) -> &[RunDescriptor] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn run_count(&self, level: usize) -> usize {
        self.runs(level).len()
    }

    /// Highest level holding any run.
    pub fn top_level(&self) -> Option<usize> {
        self.levels.iter().rposition(|runs| !runs.is_empty())
    }

    /// Bytes currently held by run files.
    pub fn temp_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }

    /// Opens a writer for the next run of `level`.
    pub fn start_run<T: Record>(
        &mut self,
        resources: &Arc<Resources>,
        level: usize,
        block_size: usize,
        io_tracker: Option<IoStatsTracker>,
    ) -> Result<RunWriter<T>> {
        let index = self.run_count(level);
        let file = self.file_index(level, index);
        self.dir.ensure_created()?;
        let path = self.file_path(file);

        let slot = &mut self.files[file];
        let truncate = slot.level != Some(level);
        if truncate {
            *slot = RunFile {
                len: 0,
                level: Some(level),
                live_runs: 0,
            };
        }
        RunWriter::create(
            resources, &path, truncate, slot.len, level, index, file, block_size, io_tracker,
        )
    }

    /// Closes the writer and records the run.
    pub fn finish_run<T: Record>(&mut self, writer: RunWriter<T>) -> Result<RunDescriptor> {
        let run = writer.finish()?;
        let slot = &mut self.files[run.file];
        slot.len = run.end();
        slot.live_runs += 1;
        if self.levels.len() <= run.level {
            self.levels.resize_with(run.level + 1, Vec::new);
        }
        self.levels[run.level].push(run.clone());
        self.runs_written += 1;
        if self.runs_written <= 10 {
            debug!(
                level = run.level,
                run = run.index,
                items = run.items,
                bytes = run.bytes,
                file = run.file,
                "wrote run"
            );
        } else if self.runs_written == 11 {
            debug!("...");
        }
        Ok(run)
    }

    /// Forgets the descriptors of a fully merged level.
    pub fn clear_level(&mut self, level: usize) {
        if let Some(runs) = self.levels.get_mut(level) {
            runs.clear();
        }
    }

    /// Marks a run as consumed. When its file holds no other live run the file
    /// is truncated through `handle`, which must be open on that file.
    pub fn release_run(&mut self, run: &RunDescriptor, handle: &FileHandle) -> Result<()> {
        let slot = &mut self.files[run.file];
        slot.live_runs = slot.live_runs.saturating_sub(1);
        if slot.live_runs == 0 && slot.level == Some(run.level) {
            handle
                .fd()
                .truncate(0)
                .map_err(|e| SortError::io(handle.path(), 0, e))?;
            *slot = RunFile::default();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diskio::file::OpenMode;
    use tempfile::tempdir;

    fn write<T: Record>(
        catalog: &mut RunCatalog,
        resources: &Arc<Resources>,
        level: usize,
        items: &[T],
    ) -> RunDescriptor {
        let mut writer = catalog.start_run::<T>(resources, level, 64, None).unwrap();
        for item in items {
            writer.push(item).unwrap();
        }
        catalog.finish_run(writer).unwrap()
    }

    #[test]
    fn test_parity_banking() {
        let base = tempdir().unwrap();
        let resources = Resources::unlimited();
        let mut catalog = RunCatalog::new(base.path(), 3);

        let runs: Vec<_> = (0..5u64)
            .map(|i| write(&mut catalog, &resources, 0, &[i]))
            .collect();
        let files: Vec<_> = runs.iter().map(|r| r.file).collect();
        assert_eq!(files, vec![0, 1, 2, 0, 1]);
        assert_eq!(runs[3].offset, 8);

        let merged = write(&mut catalog, &resources, 1, &[0u64, 1, 2]);
        assert_eq!(merged.file, 3);
        assert_eq!(catalog.top_level(), Some(1));
        assert_eq!(catalog.temp_bytes(), 5 * 8 + 24);
    }

    #[test]
    fn test_new_level_truncates_file() {
        let base = tempdir().unwrap();
        let resources = Resources::unlimited();
        let mut catalog = RunCatalog::new(base.path(), 2);

        write(&mut catalog, &resources, 0, &[1u64, 2, 3]);
        // Level 2 shares the even bank with level 0.
        let run = write(&mut catalog, &resources, 2, &[9u64]);
        assert_eq!(run.file, 0);
        assert_eq!(run.offset, 0);
        assert_eq!(catalog.temp_bytes(), 8);
    }

    #[test]
    fn test_release_truncates_when_file_drained() {
        let base = tempdir().unwrap();
        let resources = Resources::unlimited();
        let mut catalog = RunCatalog::new(base.path(), 2);

        let a = write(&mut catalog, &resources, 0, &[1u64]);
        let _b = write(&mut catalog, &resources, 0, &[2u64]);
        let c = write(&mut catalog, &resources, 0, &[3u64]);
        assert_eq!(a.file, c.file);

        let handle = FileHandle::open(&resources, catalog.file_path(a.file), OpenMode::Update).unwrap();
        catalog.release_run(&a, &handle).unwrap();
        assert_eq!(catalog.temp_bytes(), 24);
        catalog.release_run(&c, &handle).unwrap();
        assert_eq!(catalog.temp_bytes(), 8);
        assert_eq!(handle.fd().size().unwrap(), 0);
    }

    #[test]
    fn test_dir_removed_on_drop() {
        let base = tempdir().unwrap();
        let resources = Resources::unlimited();
        let dir;
        {
            let mut catalog = RunCatalog::new(base.path(), 2);
            dir = catalog.dir().to_path_buf();
            assert!(!dir.exists());
            write(&mut catalog, &resources, 0, &[1u64]);
            assert!(dir.exists());
        }
        assert!(!dir.exists());
    }
}
