//! The three-phase merge sorter.
//!
//! ```text
//! Initial --begin()--> Forming --end()--> Ready --calc()--> Built --pull()--> Draining --> Closed
//! ```
//!
//! `evacuate()` moves a `Ready`, `Built` or `Draining` sorter to `Evacuated`,
//! from which the next `calc()`, `can_pull()` or `pull()` continues where it
//! left off. A fatal error moves the sorter to `Failed` and releases every
//! file and memory registration it holds.

use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use std::vec;

use tracing::{debug, warn};

use crate::compare::{Compare, NaturalOrder};
use crate::diskio::io_stats::IoStatsTracker;
use crate::error::{Result, SortError};
use crate::record::Record;
use crate::resources::{Enforcement, MemoryBucket, Reservation, Resources};
use crate::sort::catalog::RunCatalog;
use crate::sort::evacuation::{EvacuatedState, Resume, spill_items};
use crate::sort::formation::{RunBuffer, write_sorted_run};
use crate::sort::merger::{Merger, StreamContext, merge_runs};
use crate::sort::params::{
    Budgets, MIN_FILES_PHASE_1, MIN_FILES_PHASE_2, MIN_FILES_PHASE_3, Phase, SortParameters,
    catalog_memory, validate_explicit,
};
use crate::sort::progress::{NoProgress, Progress, ProgressTracker};
use crate::sort::run::RunCursor;
use crate::{MergeStats, RunGenerationStats, RunInfo, SortStats};

/// Lifecycle of a [`MergeSorter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SorterState {
    Initial,
    Forming,
    /// Formation ended, merge tree not built yet.
    Ready,
    /// Merge tree built, nothing pulled yet.
    Built,
    Draining,
    Evacuated,
    Closed,
    Failed,
}

/// Data between `end()` and the last `pull()`.
enum Output<T> {
    /// Sorted items that never left memory.
    Internal {
        items: vec::IntoIter<T>,
        memory: Reservation,
    },
    /// Runs waiting in the catalog for `calc()`.
    Pending,
    /// The draining merge.
    Merging(Merger<T>),
}

enum Stage<T> {
    Initial,
    Forming(RunBuffer<T>),
    Ready(Output<T>),
    Built(Output<T>),
    Draining(Output<T>),
    Evacuated(EvacuatedState),
    Closed,
    Failed,
}

impl<T> Stage<T> {
    fn state(&self) -> SorterState {
        match self {
            Stage::Initial => SorterState::Initial,
            Stage::Forming(_) => SorterState::Forming,
            Stage::Ready(_) => SorterState::Ready,
            Stage::Built(_) => SorterState::Built,
            Stage::Draining(_) => SorterState::Draining,
            Stage::Evacuated(_) => SorterState::Evacuated,
            Stage::Closed => SorterState::Closed,
            Stage::Failed => SorterState::Failed,
        }
    }
}

/// Run files and the memory charged for their bookkeeping, from `begin()`
/// until the sorter closes or fails.
struct Session {
    catalog: RunCatalog,
    _catalog_memory: Reservation,
}

/// Shape of the merge work `calc()` has left to do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct MergePlan {
    /// Intermediate merge passes, the final-fanout merge included.
    passes: usize,
    /// Items written by those passes.
    items_to_write: u64,
    /// Most files open at once, the draining merge included.
    max_open_files: usize,
    /// Inputs of the draining merge.
    final_inputs: usize,
}

impl MergePlan {
    fn new(run_items: &[u64], fanout: usize, final_fanout: usize) -> Self {
        let mut plan = MergePlan::default();
        let mut runs = run_items.to_vec();
        while runs.len() > fanout {
            plan.max_open_files = plan.max_open_files.max(fanout + 1);
            runs = runs.chunks(fanout).map(|group| group.iter().sum()).collect();
            plan.items_to_write += runs.iter().sum::<u64>();
            plan.passes += 1;
        }
        if runs.len() > final_fanout {
            let trailing = &runs[final_fanout - 1..];
            plan.items_to_write += trailing.iter().sum::<u64>();
            plan.max_open_files = plan.max_open_files.max(trailing.len() + 1);
            plan.passes += 1;
            plan.final_inputs = final_fanout;
        } else {
            plan.final_inputs = runs.len();
        }
        plan.max_open_files = plan.max_open_files.max(plan.final_inputs);
        plan
    }
}

/// External merge sorter over items of type `T` ordered by `C`.
pub struct MergeSorter<T, C = NaturalOrder> {
    cmp: C,
    resources: Arc<Resources>,
    memory: MemoryBucket,
    budgets: Budgets,
    explicit: Option<(usize, usize)>,
    item_bound: Option<u64>,
    temp_dir: Option<PathBuf>,
    params: Option<SortParameters>,
    stage: Stage<T>,
    session: Option<Session>,
    items: u64,
    formation_start: Option<Instant>,
    run_gen: RunGenerationStats,
    merges: Vec<MergeStats>,
    formation_io: IoStatsTracker,
    drain_io: IoStatsTracker,
}

impl<T: Record> MergeSorter<T, NaturalOrder>
where
    T: Ord,
{
    pub fn natural(resources: Arc<Resources>) -> Self {
        Self::new(NaturalOrder, resources)
    }
}

impl<T: Record, C: Compare<T>> MergeSorter<T, C> {
    pub fn new(cmp: C, resources: Arc<Resources>) -> Self {
        Self {
            cmp,
            memory: MemoryBucket::new(Arc::clone(&resources)),
            resources,
            budgets: Budgets::default(),
            explicit: None,
            item_bound: None,
            temp_dir: None,
            params: None,
            stage: Stage::Initial,
            session: None,
            items: 0,
            formation_start: None,
            run_gen: RunGenerationStats::default(),
            merges: Vec::new(),
            formation_io: IoStatsTracker::new(),
            drain_io: IoStatsTracker::new(),
        }
    }

    pub fn state(&self) -> SorterState {
        self.stage.state()
    }

    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    // ---- configuration -------------------------------------------------

    pub fn set_available_memory(&mut self, m1: usize, m2: usize, m3: usize) -> Result<()> {
        self.ensure_initial("set_available_memory")?;
        self.budgets.memory = [m1, m2, m3];
        Ok(())
    }

    /// Gives every phase the same budget.
    pub fn set_available_memory_total(&mut self, m: usize) -> Result<()> {
        self.set_available_memory(m, m, m)
    }

    pub fn set_phase_memory(&mut self, phase: Phase, m: usize) -> Result<()> {
        self.ensure_initial("set_phase_memory")?;
        self.budgets.memory[phase.index()] = m;
        Ok(())
    }

    pub fn set_available_files(&mut self, files: usize) -> Result<()> {
        self.set_available_files_per_phase(files, files, files)
    }

    pub fn set_available_files_per_phase(&mut self, f1: usize, f2: usize, f3: usize) -> Result<()> {
        self.ensure_initial("set_available_files")?;
        let minimums = [MIN_FILES_PHASE_1, MIN_FILES_PHASE_2, MIN_FILES_PHASE_3];
        for (phase, (files, min)) in [f1, f2, f3].into_iter().zip(minimums).enumerate() {
            if files < min {
                return Err(SortError::InvalidParameters(format!(
                    "phase {} needs at least {} files, got {}",
                    phase + 1,
                    min,
                    files
                )));
            }
        }
        self.budgets.files = [f1, f2, f3];
        Ok(())
    }

    /// Fixes run length and fanout instead of deriving them from the budgets.
    pub fn set_parameters(&mut self, run_length: usize, fanout: usize) -> Result<()> {
        self.ensure_initial("set_parameters")?;
        validate_explicit(run_length, fanout)?;
        self.explicit = Some((run_length, fanout));
        Ok(())
    }

    /// Upper bound on the number of items; only shrinks the formation buffer.
    pub fn set_items(&mut self, upper_bound: u64) -> Result<()> {
        self.ensure_initial("set_items")?;
        self.item_bound = Some(upper_bound);
        Ok(())
    }

    pub fn set_block_size(&mut self, bytes: usize) -> Result<()> {
        self.ensure_initial("set_block_size")?;
        if bytes == 0 {
            return Err(SortError::InvalidParameters(
                "block size must be positive".to_string(),
            ));
        }
        self.budgets.block_size = bytes;
        Ok(())
    }

    pub fn set_temp_dir(&mut self, dir: impl Into<PathBuf>) -> Result<()> {
        self.ensure_initial("set_temp_dir")?;
        self.temp_dir = Some(dir.into());
        Ok(())
    }

    // ---- formation -----------------------------------------------------

    pub fn begin(&mut self) -> Result<()> {
        self.ensure_initial("begin")?;
        let result = self.begin_inner();
        self.guard(result)
    }

    fn begin_inner(&mut self) -> Result<()> {
        let mut params = match self.explicit {
            Some((run_length, fanout)) => SortParameters::explicit(run_length, fanout, &self.budgets)?,
            None => SortParameters::calculate::<T>(&self.budgets)?,
        };
        if let Some(bound) = self.item_bound {
            let bound = usize::try_from(bound).unwrap_or(usize::MAX);
            if bound < params.run_length {
                params.run_length = bound.max(params.internal_report_threshold).max(1);
                debug!(bound, run_length = params.run_length, "shrunk run length to item bound");
            }
        }
        debug!("{}", params);

        let catalog_memory = self.memory.reserve(catalog_memory(params.fanout))?;
        let buffer = RunBuffer::new(&self.memory, params.run_length)?;
        let base = self.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
        self.session = Some(Session {
            catalog: RunCatalog::new(base, params.fanout),
            _catalog_memory: catalog_memory,
        });
        self.params = Some(params);
        self.stage = Stage::Forming(buffer);
        self.formation_start = Some(Instant::now());
        Ok(())
    }

    pub fn push(&mut self, item: T) -> Result<()> {
        let result = self.push_inner(item);
        self.guard(result)
    }

    fn push_inner(&mut self, item: T) -> Result<()> {
        let mut buffer = match mem::replace(&mut self.stage, Stage::Failed) {
            Stage::Forming(buffer) => buffer,
            other => {
                self.stage = other;
                return Err(self.wrong_phase("push"));
            }
        };
        if buffer.is_full() {
            self.sort_buffer(&mut buffer);
            self.write_leaf_run(&mut buffer)?;
        }
        buffer.push(item);
        self.items += 1;
        self.stage = Stage::Forming(buffer);
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        let result = self.end_inner();
        self.guard(result)
    }

    fn end_inner(&mut self) -> Result<()> {
        let mut buffer = match mem::replace(&mut self.stage, Stage::Failed) {
            Stage::Forming(buffer) => buffer,
            other => {
                self.stage = other;
                return Err(self.wrong_phase("end"));
            }
        };
        let params = self.params()?.clone();
        self.sort_buffer(&mut buffer);

        if self.run_gen.num_runs == 0 && buffer.len() <= params.internal_report_threshold {
            buffer = buffer.shrink_to_len(&self.memory);
            let resident = buffer.reserved_bytes() + catalog_memory(params.fanout);
            let limit = params.memory_phase_2.min(params.memory_phase_3);
            if self.explicit.is_some() || resident <= limit {
                debug!(items = buffer.len(), resident, "keeping items in memory");
                let (items, memory) = buffer.into_parts();
                self.stage = Stage::Ready(Output::Internal {
                    items: items.into_iter(),
                    memory,
                });
                self.finish_formation(true);
                return Ok(());
            }
        }

        if !buffer.is_empty() {
            self.write_leaf_run(&mut buffer)?;
        }
        drop(buffer);
        debug!(runs = self.run_gen.num_runs, items = self.items, "formation flushed to runs");
        self.stage = Stage::Ready(Output::Pending);
        self.finish_formation(false);
        Ok(())
    }

    fn sort_buffer(&mut self, buffer: &mut RunBuffer<T>) {
        let start = Instant::now();
        buffer.sort(&self.cmp);
        self.run_gen.sort_time_ms += start.elapsed().as_millis();
    }

    fn write_leaf_run(&mut self, buffer: &mut RunBuffer<T>) -> Result<()> {
        let ctx = self.stream_context(&self.formation_io);
        let session = self.session_mut("push")?;
        let (run, store_ms) = write_sorted_run(&ctx, &mut session.catalog, 0, buffer.drain())?;
        self.run_gen.store_time_ms += store_ms;
        self.run_gen.num_runs += 1;
        self.run_gen.runs_info.push(RunInfo {
            entries: run.items as usize,
            file_size: run.bytes,
        });
        Ok(())
    }

    fn finish_formation(&mut self, internal: bool) {
        self.run_gen.internal = internal;
        self.run_gen.time_ms = self
            .formation_start
            .map(|start| start.elapsed().as_millis())
            .unwrap_or(0);
        self.run_gen.io_stats = Some(self.formation_io.get_detailed_stats());
    }

    // ---- merge ---------------------------------------------------------

    /// Builds the merge tree, reporting items written by intermediate merges.
    pub fn calc(&mut self, progress: &mut dyn Progress) -> Result<()> {
        let result = self.calc_inner(progress);
        self.guard(result)
    }

    fn calc_inner(&mut self, progress: &mut dyn Progress) -> Result<()> {
        match mem::replace(&mut self.stage, Stage::Failed) {
            Stage::Ready(Output::Internal { items, memory }) => {
                ProgressTracker::new(progress, 0).finish();
                self.stage = Stage::Built(Output::Internal { items, memory });
                Ok(())
            }
            Stage::Ready(Output::Pending)
            | Stage::Evacuated(EvacuatedState {
                resume: Resume::Ready,
                ..
            }) => {
                let inputs = self.merge_to_final_fanout(progress)?;
                let merger = self.open_merger(inputs)?;
                self.stage = Stage::Built(Output::Merging(merger));
                Ok(())
            }
            other => {
                self.stage = other;
                Err(self.wrong_phase("calc"))
            }
        }
    }

    fn plan(&self) -> Result<MergePlan> {
        let params = self.params()?;
        let session = self.session_ref("calc")?;
        let level = session.catalog.top_level().unwrap_or(0);
        let items: Vec<u64> = session.catalog.runs(level).iter().map(|r| r.items).collect();
        Ok(MergePlan::new(&items, params.fanout, params.final_fanout))
    }

    /// Merges levels until the draining merge has at most `final_fanout`
    /// inputs, and returns those inputs.
    fn merge_to_final_fanout(&mut self, progress: &mut dyn Progress) -> Result<Vec<RunCursor>> {
        let plan = self.plan()?;
        let files = self.resources.files();
        if files.enforcement() == Enforcement::Throw && plan.max_open_files > files.available() {
            return Err(SortError::OutOfFiles {
                needed: plan.max_open_files,
                available: files.available(),
            });
        }
        let params = self.params()?.clone();
        let (fanout, final_fanout) = (params.fanout, params.final_fanout);
        debug!(
            passes = plan.passes,
            items_to_write = plan.items_to_write,
            final_inputs = plan.final_inputs,
            "building merge tree"
        );

        let mut tracker = ProgressTracker::new(progress, plan.items_to_write);
        let base_ctx = self.stream_context(&self.drain_io);
        let Self {
            session,
            cmp,
            merges,
            stage,
            ..
        } = self;
        let state = stage.state();
        let catalog = &mut session
            .as_mut()
            .ok_or(SortError::WrongPhase {
                operation: "calc",
                state,
            })?
            .catalog;

        let mut level = catalog.top_level().unwrap_or(0);
        while catalog.run_count(level) > fanout {
            let start = Instant::now();
            let io = IoStatsTracker::new();
            let ctx = StreamContext {
                io_tracker: io.clone(),
                ..base_ctx.clone()
            };
            let runs = catalog.runs(level).to_vec();
            let mut produced = Vec::with_capacity(runs.len().div_ceil(fanout));
            for group in runs.chunks(fanout) {
                let inputs = group.iter().map(RunCursor::start).collect();
                let run = merge_runs(&ctx, catalog, inputs, level + 1, &*cmp, &mut tracker)?;
                produced.push(run.items);
            }
            catalog.clear_level(level);
            debug!(level, input_runs = runs.len(), output_runs = produced.len(), "merged level");
            merges.push(MergeStats {
                level,
                input_runs: runs.len(),
                output_runs: produced.len(),
                merge_entry_num: produced,
                time_ms: start.elapsed().as_millis(),
                io_stats: Some(io.get_detailed_stats()),
            });
            level += 1;
        }

        let runs = catalog.runs(level).to_vec();
        let mut inputs: Vec<RunCursor>;
        if runs.len() > final_fanout {
            // Fold the tail into one run so the draining merge fits its budget.
            let keep = final_fanout - 1;
            debug!(
                runs = runs.len(),
                final_fanout,
                merged = runs.len() - keep,
                "merging tail runs for final fanout"
            );
            let start = Instant::now();
            let io = IoStatsTracker::new();
            let ctx = StreamContext {
                io_tracker: io.clone(),
                ..base_ctx.clone()
            };
            let tail = runs[keep..].iter().map(RunCursor::start).collect();
            let extra = merge_runs(&ctx, catalog, tail, level + 1, &*cmp, &mut tracker)?;
            merges.push(MergeStats {
                level,
                input_runs: runs.len() - keep,
                output_runs: 1,
                merge_entry_num: vec![extra.items],
                time_ms: start.elapsed().as_millis(),
                io_stats: Some(io.get_detailed_stats()),
            });
            inputs = runs[..keep].iter().map(RunCursor::start).collect();
            inputs.push(RunCursor::start(&extra));
        } else {
            inputs = runs.iter().map(RunCursor::start).collect();
        }
        tracker.finish();
        Ok(inputs)
    }

    fn open_merger(&mut self, inputs: Vec<RunCursor>) -> Result<Merger<T>> {
        let ctx = self.stream_context(&self.drain_io);
        let state = self.stage.state();
        let session = self.session.as_mut().ok_or(SortError::WrongPhase {
            operation: "pull",
            state,
        })?;
        Merger::open(&ctx, &mut session.catalog, inputs, &self.cmp)
    }

    /// Whether `calc()` will merge nothing.
    pub fn is_calc_free(&self) -> bool {
        match &self.stage {
            Stage::Ready(Output::Internal { .. }) => true,
            Stage::Ready(_)
            | Stage::Evacuated(EvacuatedState {
                resume: Resume::Ready,
                ..
            }) => self.plan().map(|plan| plan.passes == 0).unwrap_or(false),
            Stage::Initial | Stage::Forming(_) | Stage::Failed => false,
            _ => true,
        }
    }

    // ---- drain ---------------------------------------------------------

    pub fn can_pull(&mut self) -> Result<bool> {
        let result = self.can_pull_inner();
        self.guard(result)
    }

    fn can_pull_inner(&mut self) -> Result<bool> {
        self.enter_drain("can_pull")?;
        let more = match &self.stage {
            Stage::Draining(Output::Internal { items, .. }) => !items.as_slice().is_empty(),
            Stage::Draining(Output::Merging(merger)) => merger.can_pull(),
            _ => false,
        };
        if !more {
            self.close();
        }
        Ok(more)
    }

    pub fn pull(&mut self) -> Result<T> {
        let result = self.pull_inner();
        self.guard(result)
    }

    fn pull_inner(&mut self) -> Result<T> {
        self.enter_drain("pull")?;
        let Self {
            stage,
            session,
            cmp,
            ..
        } = self;
        let (item, exhausted) = match stage {
            Stage::Draining(Output::Internal { items, .. }) => {
                let item = items.next();
                (item, items.as_slice().is_empty())
            }
            Stage::Draining(Output::Merging(merger)) => match session.as_mut() {
                Some(session) => {
                    let item = merger.pull(&mut session.catalog, &*cmp)?;
                    (item, !merger.can_pull())
                }
                None => (None, true),
            },
            _ => (None, true),
        };
        if exhausted {
            self.close();
        }
        item.ok_or(SortError::EndOfSequence)
    }

    /// Moves a built or evacuated sorter into `Draining`; leaves `Closed` alone.
    fn enter_drain(&mut self, operation: &'static str) -> Result<()> {
        if matches!(
            self.stage,
            Stage::Ready(_)
                | Stage::Evacuated(EvacuatedState {
                    resume: Resume::Ready,
                    ..
                })
        ) {
            self.calc_inner(&mut NoProgress)?;
        }
        match mem::replace(&mut self.stage, Stage::Failed) {
            Stage::Built(output) | Stage::Draining(output) => {
                self.stage = Stage::Draining(output);
            }
            Stage::Evacuated(state) => {
                debug!(
                    inputs = state.inputs.len(),
                    pending = state.pending_items(),
                    "reloading evacuated merge"
                );
                if state.inputs.is_empty() {
                    self.close();
                } else {
                    let merger = self.open_merger(state.inputs)?;
                    self.stage = Stage::Draining(Output::Merging(merger));
                }
            }
            Stage::Closed => self.stage = Stage::Closed,
            other => {
                self.stage = other;
                return Err(self.wrong_phase(operation));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stage = Stage::Closed;
        self.session = None;
    }

    // ---- evacuation ----------------------------------------------------

    /// Moves resident items and merge buffers to run files.
    pub fn evacuate(&mut self) -> Result<()> {
        let result = self.evacuate_inner();
        self.guard(result)
    }

    /// Evacuates between `end()` and `calc()`; a no-op in any other state.
    pub fn evacuate_before_merging(&mut self) -> Result<()> {
        match self.stage {
            Stage::Ready(_) => self.evacuate(),
            _ => Ok(()),
        }
    }

    /// Evacuates a built sorter, or one partway through an external drain.
    /// A no-op in any other state, including an internal drain that has
    /// already returned items.
    pub fn evacuate_before_reporting(&mut self) -> Result<()> {
        match self.stage {
            Stage::Built(_) | Stage::Draining(Output::Merging(_)) => self.evacuate(),
            _ => Ok(()),
        }
    }

    fn evacuate_inner(&mut self) -> Result<()> {
        let before = self.memory.used();
        let next = match mem::replace(&mut self.stage, Stage::Failed) {
            Stage::Ready(Output::Internal { items, memory }) => {
                self.spill(items, memory)?;
                EvacuatedState::new(Resume::Ready, Vec::new())
            }
            Stage::Built(Output::Internal { items, memory }) => {
                let inputs = self.spill(items, memory)?;
                EvacuatedState::new(Resume::Built, inputs)
            }
            Stage::Draining(Output::Internal { items, memory }) => {
                let inputs = self.spill(items, memory)?;
                EvacuatedState::new(Resume::Draining, inputs)
            }
            Stage::Built(Output::Merging(merger)) => {
                EvacuatedState::new(Resume::Built, merger.cursors())
            }
            Stage::Draining(Output::Merging(merger)) => {
                EvacuatedState::new(Resume::Draining, merger.cursors())
            }
            stage @ (Stage::Ready(_) | Stage::Evacuated(_) | Stage::Closed) => {
                self.stage = stage;
                return Ok(());
            }
            other => {
                self.stage = other;
                return Err(self.wrong_phase("evacuate"));
            }
        };
        self.stage = Stage::Evacuated(next);
        debug!(
            resident_before = before,
            resident_after = self.memory.used(),
            temp_bytes = self.temp_storage_usage(),
            "evacuated"
        );
        Ok(())
    }

    fn spill(&mut self, items: vec::IntoIter<T>, memory: Reservation) -> Result<Vec<RunCursor>> {
        let ctx = self.stream_context(&self.drain_io);
        let session = self.session_mut("evacuate")?;
        let run = spill_items(&ctx, &mut session.catalog, items, memory)?;
        Ok(run.iter().map(RunCursor::start).collect())
    }

    /// Resident bytes of an evacuated sorter: the run catalog. Zero once the
    /// sorter has closed or failed.
    pub fn evacuated_memory_usage(&self) -> usize {
        match (&self.session, &self.params) {
            (Some(_), Some(params)) => catalog_memory(params.fanout),
            _ => 0,
        }
    }

    // ---- accounting ----------------------------------------------------

    /// Bytes currently registered with the memory manager by this sorter.
    pub fn resident_memory(&self) -> usize {
        self.memory.used()
    }

    /// Bytes currently held in run files.
    pub fn temp_storage_usage(&self) -> u64 {
        self.session
            .as_ref()
            .map(|s| s.catalog.temp_bytes())
            .unwrap_or(0)
    }

    /// Items pushed so far.
    pub fn item_count(&self) -> u64 {
        self.items
    }

    pub fn size(&self) -> u64 {
        self.items
    }

    pub fn parameters(&self) -> Option<&SortParameters> {
        self.params.as_ref()
    }

    pub fn memory_usage_phase_1(&self) -> Option<usize> {
        self.params.as_ref().map(|p| p.memory_usage_phase_1::<T>())
    }

    pub fn memory_usage_phase_2(&self) -> Option<usize> {
        self.params.as_ref().map(|p| p.memory_usage_phase_2::<T>())
    }

    pub fn memory_usage_phase_3(&self) -> Option<usize> {
        self.params.as_ref().map(|p| p.memory_usage_phase_3::<T>())
    }

    /// Memory the drain phase needs for the data at hand, which can be less
    /// than the phase 3 budget.
    pub fn actual_memory_phase_3(&self) -> Result<usize> {
        let params = self.params()?;
        let ctx = self.stream_context(&self.drain_io);
        let catalog = catalog_memory(params.fanout);
        let drain = match &self.stage {
            Stage::Ready(Output::Internal { memory, .. })
            | Stage::Built(Output::Internal { memory, .. })
            | Stage::Draining(Output::Internal { memory, .. }) => memory.bytes(),
            Stage::Ready(Output::Pending)
            | Stage::Evacuated(EvacuatedState {
                resume: Resume::Ready,
                ..
            }) => Merger::<T>::memory_usage(&ctx, self.plan()?.final_inputs),
            Stage::Built(Output::Merging(merger)) | Stage::Draining(Output::Merging(merger)) => {
                Merger::<T>::memory_usage(&ctx, merger.width())
            }
            Stage::Evacuated(state) => Merger::<T>::memory_usage(&ctx, state.inputs.len()),
            _ => return Err(self.wrong_phase("actual_memory_phase_3")),
        };
        Ok(drain + catalog)
    }

    pub fn stats(&self) -> SortStats {
        SortStats::new(self.run_gen.clone(), self.merges.clone())
    }

    // ---- helpers -------------------------------------------------------

    fn stream_context(&self, io: &IoStatsTracker) -> StreamContext {
        StreamContext {
            resources: Arc::clone(&self.resources),
            memory: self.memory.clone(),
            block_size: self.budgets.block_size,
            io_tracker: io.clone(),
        }
    }

    fn params(&self) -> Result<&SortParameters> {
        self.params.as_ref().ok_or(SortError::WrongPhase {
            operation: "parameters",
            state: self.stage.state(),
        })
    }

    fn session_ref(&self, operation: &'static str) -> Result<&Session> {
        self.session.as_ref().ok_or(SortError::WrongPhase {
            operation,
            state: self.stage.state(),
        })
    }

    fn session_mut(&mut self, operation: &'static str) -> Result<&mut Session> {
        let state = self.stage.state();
        self.session
            .as_mut()
            .ok_or(SortError::WrongPhase { operation, state })
    }

    fn ensure_initial(&self, operation: &'static str) -> Result<()> {
        match self.stage {
            Stage::Initial => Ok(()),
            _ => Err(self.wrong_phase(operation)),
        }
    }

    fn wrong_phase(&self, operation: &'static str) -> SortError {
        SortError::WrongPhase {
            operation,
            state: self.stage.state(),
        }
    }

    fn guard<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if e.is_fatal() {
                warn!(error = %e, "sorter failed");
                self.stage = Stage::Failed;
                self.session = None;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::Reversed;
    use tempfile::tempdir;

    fn sorter(dir: &std::path::Path) -> MergeSorter<u64> {
        let mut sorter = MergeSorter::natural(Resources::unlimited());
        sorter.set_temp_dir(dir).unwrap();
        sorter
    }

    fn drain<T: Record, C: Compare<T>>(sorter: &mut MergeSorter<T, C>) -> Vec<T> {
        let mut out = Vec::new();
        while sorter.can_pull().unwrap() {
            out.push(sorter.pull().unwrap());
        }
        out
    }

    #[test]
    fn test_merge_plan() {
        let plan = MergePlan::new(&[1; 100], 4, 4);
        assert_eq!(plan.passes, 3);
        assert_eq!(plan.items_to_write, 300);
        assert_eq!(plan.final_inputs, 2);
        assert_eq!(plan.max_open_files, 5);

        let plan = MergePlan::new(&[10; 6], 8, 3);
        assert_eq!(plan.passes, 1);
        assert_eq!(plan.items_to_write, 40);
        assert_eq!(plan.final_inputs, 3);
        assert_eq!(plan.max_open_files, 5);

        assert_eq!(MergePlan::new(&[], 4, 4), MergePlan::default());
    }

    #[test]
    fn test_state_transitions() {
        let dir = tempdir().unwrap();
        let mut sorter = sorter(dir.path());
        assert_eq!(sorter.state(), SorterState::Initial);
        assert!(matches!(sorter.push(1), Err(SortError::WrongPhase { .. })));

        sorter.begin().unwrap();
        assert_eq!(sorter.state(), SorterState::Forming);
        assert!(matches!(
            sorter.set_parameters(2, 2),
            Err(SortError::WrongPhase { state: SorterState::Forming, .. })
        ));
        assert!(matches!(sorter.pull(), Err(SortError::WrongPhase { .. })));
        assert!(matches!(sorter.evacuate(), Err(SortError::WrongPhase { .. })));
        sorter.push(2).unwrap();
        sorter.push(1).unwrap();
        sorter.end().unwrap();
        assert_eq!(sorter.state(), SorterState::Ready);
        assert!(matches!(sorter.push(3), Err(SortError::WrongPhase { .. })));

        sorter.calc(&mut NoProgress).unwrap();
        assert_eq!(sorter.state(), SorterState::Built);
        assert!(matches!(sorter.calc(&mut NoProgress), Err(SortError::WrongPhase { .. })));
        assert_eq!(sorter.pull().unwrap(), 1);
        assert_eq!(sorter.state(), SorterState::Draining);
        assert_eq!(sorter.pull().unwrap(), 2);
        assert_eq!(sorter.state(), SorterState::Closed);
        assert!(matches!(sorter.pull(), Err(SortError::EndOfSequence)));
        assert!(!sorter.can_pull().unwrap());
    }

    #[test]
    fn test_internal_report_mode() {
        let dir = tempdir().unwrap();
        let mut sorter = sorter(dir.path());
        sorter.begin().unwrap();
        for item in [3u64, 1, 2] {
            sorter.push(item).unwrap();
        }
        sorter.end().unwrap();
        assert!(sorter.is_calc_free());
        assert_eq!(sorter.temp_storage_usage(), 0);
        // The formation buffer was cut down to the three items.
        assert_eq!(
            sorter.resident_memory(),
            3 * 8 + sorter.evacuated_memory_usage()
        );
        assert_eq!(sorter.actual_memory_phase_3().unwrap(), sorter.resident_memory());
        assert_eq!(drain(&mut sorter), vec![1, 2, 3]);
        assert!(sorter.stats().run_gen_stats.internal);
        assert_eq!(sorter.resident_memory(), 0);
    }

    #[test]
    fn test_lazy_calc_on_pull() {
        let dir = tempdir().unwrap();
        let mut sorter = sorter(dir.path());
        sorter.set_parameters(2, 2).unwrap();
        sorter.begin().unwrap();
        for item in [9u64, 4, 7, 1, 8] {
            sorter.push(item).unwrap();
        }
        sorter.end().unwrap();
        assert!(!sorter.is_calc_free());
        assert_eq!(sorter.pull().unwrap(), 1);
        assert_eq!(drain(&mut sorter), vec![4, 7, 8, 9]);
        assert_eq!(sorter.stats().run_gen_stats.num_runs, 3);
    }

    #[test]
    fn test_custom_comparator() {
        let dir = tempdir().unwrap();
        let mut sorter = MergeSorter::new(Reversed(NaturalOrder), Resources::unlimited());
        sorter.set_temp_dir(dir.path()).unwrap();
        sorter.set_parameters(3, 2).unwrap();
        sorter.begin().unwrap();
        for item in 0..10i32 {
            sorter.push(item).unwrap();
        }
        sorter.end().unwrap();
        sorter.calc(&mut NoProgress).unwrap();
        assert_eq!(drain(&mut sorter), (0..10).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_runs_within_fanout_need_no_merge() {
        let dir = tempdir().unwrap();
        let mut sorter = sorter(dir.path());
        sorter.set_parameters(2, 4).unwrap();
        sorter.begin().unwrap();
        for item in (0..8u64).rev() {
            sorter.push(item).unwrap();
        }
        sorter.end().unwrap();
        // Four runs with fanout 4: no merge needed.
        assert!(sorter.is_calc_free());
        assert_eq!(sorter.plan().unwrap().final_inputs, 4);
        sorter.calc(&mut NoProgress).unwrap();
        assert!(sorter.stats().per_merge_stats.is_empty());
        assert_eq!(drain(&mut sorter), (0..8).collect::<Vec<_>>());
        assert_eq!(sorter.temp_storage_usage(), 0);
    }

    #[test]
    fn test_evacuated_memory_usage_ends_with_session() {
        let dir = tempdir().unwrap();
        let mut sorter = sorter(dir.path());
        assert_eq!(sorter.evacuated_memory_usage(), 0);
        sorter.set_parameters(2, 2).unwrap();
        sorter.begin().unwrap();
        for item in [3u64, 1, 2] {
            sorter.push(item).unwrap();
        }
        sorter.end().unwrap();
        assert_eq!(sorter.evacuated_memory_usage(), catalog_memory(2));

        assert_eq!(drain(&mut sorter), vec![1, 2, 3]);
        assert_eq!(sorter.state(), SorterState::Closed);
        assert_eq!(sorter.evacuated_memory_usage(), 0);
        assert_eq!(sorter.resident_memory(), 0);
    }

    #[test]
    fn test_out_of_memory_at_begin() {
        let dir = tempdir().unwrap();
        let mut sorter = sorter(dir.path());
        sorter.set_available_memory(1024, 1 << 20, 1 << 20).unwrap();
        let err = sorter.begin().unwrap_err();
        assert!(matches!(err, SortError::OutOfMemory { phase: "formation", .. }));
        assert_eq!(sorter.state(), SorterState::Failed);
        assert_eq!(sorter.resident_memory(), 0);
        assert!(matches!(sorter.push(1), Err(SortError::WrongPhase { state: SorterState::Failed, .. })));
    }

    #[test]
    fn test_setter_validation() {
        let dir = tempdir().unwrap();
        let mut sorter = sorter(dir.path());
        assert!(matches!(sorter.set_parameters(0, 4), Err(SortError::InvalidParameters(_))));
        assert!(matches!(sorter.set_available_files(4), Err(SortError::InvalidParameters(_))));
        assert!(matches!(sorter.set_block_size(0), Err(SortError::InvalidParameters(_))));
        assert_eq!(sorter.state(), SorterState::Initial);
        sorter.set_available_files_per_phase(1, 5, 5).unwrap();
    }
}
