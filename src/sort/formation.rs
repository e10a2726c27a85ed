use std::time::Instant;

use crate::compare::Compare;
use crate::error::Result;
use crate::record::{Record, item_size};
use crate::resources::{MemoryBucket, Reservation};
use crate::sort::catalog::RunCatalog;
use crate::sort::merger::StreamContext;
use crate::sort::run::RunDescriptor;

/// In-memory buffer of one run being formed, with its memory reserved up front.
pub struct RunBuffer<T> {
    items: Vec<T>,
    capacity: usize,
    memory: Reservation,
}

impl<T> RunBuffer<T> {
    pub fn new(memory: &MemoryBucket, capacity: usize) -> Result<Self> {
        let reservation = memory.reserve(capacity * item_size::<T>())?;
        Ok(Self {
            items: Vec::with_capacity(capacity),
            capacity,
            memory: reservation,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn push(&mut self, item: T) {
        debug_assert!(!self.is_full());
        self.items.push(item);
    }

    pub fn sort<C: Compare<T>>(&mut self, cmp: &C) {
        self.items.sort_unstable_by(|a, b| cmp.compare(a, b));
    }

    /// Hands out the buffered items and leaves the buffer empty.
    pub fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.items.drain(..)
    }

    /// Moves the items into a buffer of exactly their count, if memory for the
    /// copy is available. Returns the buffer unchanged otherwise.
    pub fn shrink_to_len(mut self, memory: &MemoryBucket) -> Self {
        let len = self.items.len();
        if len >= self.capacity {
            return self;
        }
        match memory.try_reserve(len * item_size::<T>()) {
            Some(reservation) => {
                let mut items = Vec::with_capacity(len);
                items.append(&mut self.items);
                Self {
                    items,
                    capacity: len,
                    memory: reservation,
                }
            }
            None => self,
        }
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// The items together with the memory they are charged to.
    pub fn into_parts(self) -> (Vec<T>, Reservation) {
        (self.items, self.memory)
    }

    pub fn reserved_bytes(&self) -> usize {
        self.memory.bytes()
    }
}

/// Writes already sorted items as the next run of `level`. Returns the run
/// and the time spent writing.
pub fn write_sorted_run<T: Record>(
    ctx: &StreamContext,
    catalog: &mut RunCatalog,
    level: usize,
    items: impl Iterator<Item = T>,
) -> Result<(RunDescriptor, u128)> {
    let start = Instant::now();
    let _stream = ctx.memory.reserve(ctx.stream_memory())?;
    let mut writer = catalog.start_run::<T>(
        &ctx.resources,
        level,
        ctx.block_size,
        Some(ctx.io_tracker.clone()),
    )?;
    for item in items {
        writer.push(&item)?;
    }
    let run = catalog.finish_run(writer)?;
    Ok((run, start.elapsed().as_millis()))
}
