//! Error types for the merge sorter.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::sort::sorter::SorterState;

/// Errors surfaced by the sorter and its storage layer.
#[derive(Debug, Error)]
pub enum SortError {
    /// A phase budget cannot hold the minimum structure it needs.
    #[error("out of memory in {phase}: {required} b required, {available} b available")]
    OutOfMemory {
        phase: &'static str,
        required: usize,
        available: usize,
    },

    /// More simultaneously open run files are needed than the file budget allows.
    #[error("out of files: {needed} open run files needed, {available} available")]
    OutOfFiles { needed: usize, available: usize },

    /// A run failed a consistency check while being read back.
    #[error("corrupt run {run} at merge level {level} (byte offset {offset}): {reason}")]
    CorruptRun {
        level: usize,
        run: usize,
        offset: u64,
        reason: String,
    },

    /// `pull()` was called after the last item was returned.
    #[error("pull() called past the end of the sorted sequence")]
    EndOfSequence,

    /// An operation was called in a phase that does not allow it.
    #[error("{operation}() is not allowed in state {state:?}")]
    WrongPhase {
        operation: &'static str,
        state: SorterState,
    },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Backing storage failure, with the file and offset involved.
    #[error("I/O error on {} at offset {offset}: {source}", path.display())]
    Io {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },
}

impl SortError {
    pub(crate) fn io(path: impl Into<PathBuf>, offset: u64, source: io::Error) -> Self {
        SortError::Io {
            path: path.into(),
            offset,
            source,
        }
    }

    /// Whether the error leaves the sorter unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SortError::EndOfSequence | SortError::WrongPhase { .. } | SortError::InvalidParameters(_)
        )
    }
}

/// Result type for sorter operations.
pub type Result<T> = std::result::Result<T, SortError>;
