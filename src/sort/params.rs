//! Derivation of run length and fanout from the phase budgets.
//!
//! Every quantity is accounted in bytes using the units below:
//!
//! - an item buffered during formation costs `item_size::<T>()`;
//! - an open run stream costs one block plus [`STREAM_OVERHEAD`];
//! - a merge heap slot costs `size_of::<(T, usize)>()`;
//! - the run catalog costs [`RUN_FILE_FOOTPRINT`] per run file, and holds
//!   `2 * fanout` files for the lifetime of the sort.

use std::fmt;
use std::mem::size_of;

use tracing::debug;

use crate::error::{Result, SortError};
use crate::record::item_size;

pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;
/// Bookkeeping of one open stream on top of its block buffer.
pub const STREAM_OVERHEAD: usize = 256;
/// Bookkeeping of one run file in the catalog.
pub const RUN_FILE_FOOTPRINT: usize = 128;
pub const DEFAULT_PHASE_MEMORY: usize = 16 * 1024 * 1024;
pub const DEFAULT_FILES: usize = 253;
pub const MIN_FILES_PHASE_1: usize = 1;
pub const MIN_FILES_PHASE_2: usize = 5;
pub const MIN_FILES_PHASE_3: usize = 5;

/// The three phases with separate budgets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Formation,
    Merge,
    Drain,
}

impl Phase {
    pub fn index(self) -> usize {
        match self {
            Phase::Formation => 0,
            Phase::Merge => 1,
            Phase::Drain => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Formation => "formation",
            Phase::Merge => "merge",
            Phase::Drain => "drain",
        }
    }
}

pub fn stream_memory(block_size: usize) -> usize {
    block_size + STREAM_OVERHEAD
}

pub fn heap_entry_size<T>() -> usize {
    size_of::<(T, usize)>().max(1)
}

pub fn catalog_memory(fanout: usize) -> usize {
    2 * fanout * RUN_FILE_FOOTPRINT
}

/// Merging `fanout` runs into one: input streams, heap, output stream, catalog.
pub fn fanout_memory_usage<T>(fanout: usize, block_size: usize) -> usize {
    fanout * (stream_memory(block_size) + heap_entry_size::<T>())
        + stream_memory(block_size)
        + catalog_memory(fanout)
}

/// Draining a merge of `final_fanout` runs; no output stream.
pub fn final_memory_usage<T>(final_fanout: usize, fanout: usize, block_size: usize) -> usize {
    final_fanout * (stream_memory(block_size) + heap_entry_size::<T>()) + catalog_memory(fanout)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortParameters {
    /// Items per leaf run.
    pub run_length: usize,
    /// Runs merged per intermediate merge.
    pub fanout: usize,
    /// Runs merged by the draining merger.
    pub final_fanout: usize,
    /// Largest item count that may stay in memory through all three phases.
    pub internal_report_threshold: usize,
    pub memory_phase_1: usize,
    pub memory_phase_2: usize,
    pub memory_phase_3: usize,
    pub files_phase_1: usize,
    pub files_phase_2: usize,
    pub files_phase_3: usize,
    pub block_size: usize,
}

impl fmt::Display for SortParameters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Sort parameters:")?;
        writeln!(
            f,
            "  Memory: phase 1 = {} b, phase 2 = {} b, phase 3 = {} b",
            self.memory_phase_1, self.memory_phase_2, self.memory_phase_3
        )?;
        writeln!(
            f,
            "  Files: phase 1 = {}, phase 2 = {}, phase 3 = {}",
            self.files_phase_1, self.files_phase_2, self.files_phase_3
        )?;
        writeln!(f, "  Block size: {} b", self.block_size)?;
        writeln!(f, "  Run length: {}", self.run_length)?;
        writeln!(f, "  Fanout: {}", self.fanout)?;
        writeln!(f, "  Final fanout: {}", self.final_fanout)?;
        write!(
            f,
            "  Internal report threshold: {}",
            self.internal_report_threshold
        )
    }
}

/// Budgets the parameters are derived from.
#[derive(Clone, Copy, Debug)]
pub struct Budgets {
    pub memory: [usize; 3],
    pub files: [usize; 3],
    pub block_size: usize,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            memory: [DEFAULT_PHASE_MEMORY; 3],
            files: [DEFAULT_FILES; 3],
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl SortParameters {
    /// Derives the largest fanouts and run length that fit the budgets.
    pub fn calculate<T>(budgets: &Budgets) -> Result<Self> {
        let [m1, m2, m3] = budgets.memory;
        let [f1, f2, f3] = budgets.files;
        let block = budgets.block_size;
        let item = item_size::<T>();

        // Largest fanout in [2, f2 - 2) whose merge fits in m2.
        let min_merge = fanout_memory_usage::<T>(2, block);
        if min_merge > m2 {
            return Err(SortError::OutOfMemory {
                phase: Phase::Merge.name(),
                required: min_merge,
                available: m2,
            });
        }
        let mut lo = 2;
        let mut hi = f2.saturating_sub(2).max(3);
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            if fanout_memory_usage::<T>(mid, block) <= m2 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let fanout = lo;

        let min_final = final_memory_usage::<T>(2, fanout, block);
        if min_final > m3 {
            return Err(SortError::OutOfMemory {
                phase: Phase::Drain.name(),
                required: min_final,
                available: m3,
            });
        }
        let mut final_fanout = fanout.min(f3.saturating_sub(2)).max(2);
        while final_fanout > 2 && final_memory_usage::<T>(final_fanout, fanout, block) > m3 {
            final_fanout -= 1;
        }

        let fixed = stream_memory(block) + catalog_memory(fanout);
        let run_length = m1.saturating_sub(fixed) / item;
        if run_length == 0 {
            return Err(SortError::OutOfMemory {
                phase: Phase::Formation.name(),
                required: fixed + item,
                available: m1,
            });
        }

        let smallest = m1.min(m2).min(m3);
        let internal_report_threshold =
            run_length.min(smallest.saturating_sub(catalog_memory(fanout)) / item);

        let params = Self {
            run_length,
            fanout,
            final_fanout,
            internal_report_threshold,
            memory_phase_1: m1,
            memory_phase_2: m2,
            memory_phase_3: m3,
            files_phase_1: f1,
            files_phase_2: f2,
            files_phase_3: f3,
            block_size: block,
        };
        debug!(
            run_length,
            fanout,
            final_fanout,
            internal_report_threshold,
            "calculated sort parameters"
        );
        Ok(params)
    }

    /// Uses caller-chosen run length and fanout instead of deriving them.
    pub fn explicit(run_length: usize, fanout: usize, budgets: &Budgets) -> Result<Self> {
        validate_explicit(run_length, fanout)?;
        if fanout + 2 > budgets.files[1] {
            return Err(SortError::OutOfFiles {
                needed: fanout + 2,
                available: budgets.files[1],
            });
        }
        Ok(Self {
            run_length,
            fanout,
            final_fanout: fanout,
            internal_report_threshold: run_length,
            memory_phase_1: budgets.memory[0],
            memory_phase_2: budgets.memory[1],
            memory_phase_3: budgets.memory[2],
            files_phase_1: budgets.files[0],
            files_phase_2: budgets.files[1],
            files_phase_3: budgets.files[2],
            block_size: budgets.block_size,
        })
    }

    pub fn memory_usage_phase_1<T>(&self) -> usize {
        self.run_length * item_size::<T>()
            + stream_memory(self.block_size)
            + catalog_memory(self.fanout)
    }

    pub fn memory_usage_phase_2<T>(&self) -> usize {
        fanout_memory_usage::<T>(self.fanout, self.block_size)
    }

    pub fn memory_usage_phase_3<T>(&self) -> usize {
        final_memory_usage::<T>(self.final_fanout, self.fanout, self.block_size)
    }
}

pub(crate) fn validate_explicit(run_length: usize, fanout: usize) -> Result<()> {
    if run_length == 0 {
        return Err(SortError::InvalidParameters(
            "run length must be at least 1".to_string(),
        ));
    }
    if fanout < 2 {
        return Err(SortError::InvalidParameters(format!(
            "fanout must be at least 2, got {}",
            fanout
        )));
    }
    Ok(())
}

pub fn minimum_memory_phase_1<T>(block_size: usize) -> usize {
    item_size::<T>() + stream_memory(block_size) + catalog_memory(2)
}

pub fn minimum_memory_phase_2<T>(block_size: usize) -> usize {
    fanout_memory_usage::<T>(2, block_size)
}

pub fn minimum_memory_phase_3<T>(block_size: usize) -> usize {
    final_memory_usage::<T>(2, 2, block_size)
}
