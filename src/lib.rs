// External merge sort with per-phase memory budgets

//! `runmerge` sorts more items than fit in memory.
//!
//! Items are pushed into sorted runs on disk (phase 1), the runs are merged
//! level by level until few enough remain (phase 2), and the last merge is
//! drained lazily by the caller (phase 3). Each phase gets its own memory
//! and file budget, and a sorter can give back all but a small amount of its
//! memory between calls with [`MergeSorter::evacuate`].
//!
//! ```no_run
//! use runmerge::{MergeSorter, NoProgress, Resources};
//!
//! let mut sorter = MergeSorter::natural(Resources::unlimited());
//! sorter.set_available_memory_total(64 << 20)?;
//! sorter.begin()?;
//! for item in [5u64, 3, 9, 1] {
//!     sorter.push(item)?;
//! }
//! sorter.end()?;
//! sorter.calc(&mut NoProgress)?;
//! while sorter.can_pull()? {
//!     println!("{}", sorter.pull()?);
//! }
//! # Ok::<(), runmerge::SortError>(())
//! ```

/// Statistics about a sort operation
#[derive(Clone, Debug, Default)]
pub struct SortStats {
    pub run_gen_stats: RunGenerationStats,
    pub per_merge_stats: Vec<MergeStats>,
}

impl SortStats {
    pub fn new(run_gen_stats: RunGenerationStats, per_merge_stats: Vec<MergeStats>) -> Self {
        Self {
            run_gen_stats,
            per_merge_stats,
        }
    }

    /// Items written by intermediate merges.
    pub fn merged_items(&self) -> u64 {
        self.per_merge_stats
            .iter()
            .flat_map(|m| m.merge_entry_num.iter())
            .sum()
    }
}

impl std::fmt::Display for SortStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "SortStats:")?;
        let rg = &self.run_gen_stats;
        if rg.internal {
            writeln!(f, "  Kept in memory, no runs written")?;
        } else {
            writeln!(f, "  Number of runs: {}", rg.num_runs)?;
        }
        writeln!(f, "  (R) time: {} ms", rg.time_ms)?;
        writeln!(
            f,
            "  (R) breakdown: sort={} ms, store={} ms",
            rg.sort_time_ms, rg.store_time_ms
        )?;
        if let Some(io) = &rg.io_stats {
            writeln!(f, "  (R) I/O stats: {}", io)?;
        }

        let total_merge_time_ms: u128 = self.per_merge_stats.iter().map(|m| m.time_ms).sum();
        writeln!(f, "  (M) time: {} ms", total_merge_time_ms)?;

        // Bytes read back by merges per byte written during formation.
        if let Some(run_gen_io) = &rg.io_stats {
            let merge_read_bytes: u64 = self
                .per_merge_stats
                .iter()
                .filter_map(|m| m.io_stats.as_ref())
                .map(|io| io.read_bytes)
                .sum();
            if run_gen_io.write_bytes > 0 && merge_read_bytes > 0 {
                writeln!(
                    f,
                    "  Merge read amplification: {:.2}x",
                    merge_read_bytes as f64 / run_gen_io.write_bytes as f64
                )?;
            }
        }

        if !self.per_merge_stats.is_empty() {
            writeln!(f, "  Merge passes: {}", self.per_merge_stats.len())?;
            for (i, merge_stat) in self.per_merge_stats.iter().enumerate() {
                writeln!(
                    f,
                    "    Pass {} (level {}): {} -> {} runs, {} ms",
                    i + 1,
                    merge_stat.level,
                    merge_stat.input_runs,
                    merge_stat.output_runs,
                    merge_stat.time_ms
                )?;
                if let Some(ref io) = merge_stat.io_stats {
                    writeln!(
                        f,
                        "      I/O: read={:.2} MiB, write={:.2} MiB",
                        io.read_bytes as f64 / (1024.0 * 1024.0),
                        io.write_bytes as f64 / (1024.0 * 1024.0)
                    )?;
                }
                if merge_stat.merge_entry_num.len() > 1 {
                    let total: u64 = merge_stat.merge_entry_num.iter().sum();
                    let avg = total as f64 / merge_stat.merge_entry_num.len() as f64;
                    let max = *merge_stat.merge_entry_num.iter().max().unwrap_or(&0);
                    writeln!(
                        f,
                        "      Output runs: {}, imbalance: {:.2}x",
                        merge_stat.merge_entry_num.len(),
                        max as f64 / avg
                    )?;
                }
            }
        }

        Ok(())
    }
}

/// Information about a single run
#[derive(Clone, Debug)]
pub struct RunInfo {
    pub entries: usize,
    pub file_size: u64,
}

impl std::fmt::Display for RunInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "entries={}, file_size={}", self.entries, self.file_size)
    }
}

/// Statistics from the run formation phase
#[derive(Clone, Debug, Default)]
pub struct RunGenerationStats {
    pub num_runs: usize,
    pub runs_info: Vec<RunInfo>,
    pub time_ms: u128,
    pub io_stats: Option<IoStats>,
    pub sort_time_ms: u128,
    pub store_time_ms: u128,
    /// The items fit the internal report threshold and never reached disk.
    pub internal: bool,
}

/// Statistics from one merge pass
#[derive(Clone, Debug)]
pub struct MergeStats {
    /// Level the inputs were read from.
    pub level: usize,
    pub input_runs: usize,
    pub output_runs: usize,
    /// Items in each output run.
    pub merge_entry_num: Vec<u64>,
    pub time_ms: u128,
    pub io_stats: Option<IoStats>,
}

pub mod compare;
pub mod diskio;
pub mod error;
pub mod record;
pub mod resources;
pub mod sort;

pub use compare::{ByKey, Compare, NaturalOrder, Reversed};
pub use diskio::io_stats::{IoStats, IoStatsTracker};
pub use error::{Result, SortError};
pub use record::Record;
pub use resources::{
    Enforcement, FileSlot, MemoryBucket, Reservation, ResourceExhausted, ResourceKind,
    ResourceManager, Resources,
};
pub use sort::params::{
    Phase, SortParameters, minimum_memory_phase_1, minimum_memory_phase_2, minimum_memory_phase_3,
};
pub use sort::progress::{NoProgress, PROGRESS_GRANULARITY, Progress};
pub use sort::sorter::{MergeSorter, SorterState};
