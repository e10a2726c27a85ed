//! State of a sorter whose resident buffers were moved to run files.

use std::vec;

use tracing::debug;

use crate::error::Result;
use crate::record::Record;
use crate::resources::Reservation;
use crate::sort::catalog::RunCatalog;
use crate::sort::formation::write_sorted_run;
use crate::sort::merger::StreamContext;
use crate::sort::run::{RunCursor, RunDescriptor};

/// Where an evacuated sorter picks up again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    /// Before `calc()`; the runs wait in the catalog.
    Ready,
    /// After `calc()`, nothing pulled yet.
    Built,
    /// Mid-drain.
    Draining,
}

#[derive(Debug)]
pub struct EvacuatedState {
    pub resume: Resume,
    /// Inputs of the draining merge, in tie-break order. Unused for `Resume::Ready`.
    pub inputs: Vec<RunCursor>,
}

impl EvacuatedState {
    pub fn new(resume: Resume, inputs: Vec<RunCursor>) -> Self {
        Self { resume, inputs }
    }

    /// Items the draining merge still has to return.
    pub fn pending_items(&self) -> u64 {
        self.inputs.iter().map(|c| c.remaining).sum()
    }
}

/// Writes sorted items that never left memory to a leaf run and gives their
/// memory back. Returns `None` when there was nothing left to write.
pub fn spill_items<T: Record>(
    ctx: &StreamContext,
    catalog: &mut RunCatalog,
    items: vec::IntoIter<T>,
    memory: Reservation,
) -> Result<Option<RunDescriptor>> {
    if items.as_slice().is_empty() {
        return Ok(None);
    }
    let count = items.len();
    let (run, elapsed_ms) = write_sorted_run(ctx, catalog, 0, items)?;
    drop(memory);
    debug!(items = count, bytes = run.bytes, elapsed_ms = elapsed_ms as u64, "evacuated resident items");
    Ok(Some(run))
}
