use std::cmp::Ordering;

use crate::compare::Compare;

/// Binary min-heap of run heads, `(item, run index)`.
///
/// Equal items are ordered by run index, lower first, so the merge output is
/// deterministic for a given run layout. The comparator is passed to every
/// operation instead of being stored, which keeps the heap free of borrows.
pub struct MergeHeap<T> {
    entries: Vec<(T, usize)>,
}

impl<T> MergeHeap<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes held by a heap with room for `capacity` heads.
    pub fn memory_usage(capacity: usize) -> usize {
        capacity * std::mem::size_of::<(T, usize)>()
    }

    pub fn top(&self) -> Option<(&T, usize)> {
        self.entries.first().map(|(item, run)| (item, *run))
    }

    pub fn push<C: Compare<T>>(&mut self, item: T, run: usize, cmp: &C) {
        self.entries.push((item, run));
        let last = self.entries.len() - 1;
        self.sift_up(last, cmp);
    }

    /// Appends without restoring heap order; call `make_safe` before reading.
    pub fn unsafe_push(&mut self, item: T, run: usize) {
        self.entries.push((item, run));
    }

    /// Restores heap order after `unsafe_push` calls.
    pub fn make_safe<C: Compare<T>>(&mut self, cmp: &C) {
        let n = self.entries.len();
        for i in (0..n / 2).rev() {
            self.sift_down(i, cmp);
        }
    }

    pub fn pop<C: Compare<T>>(&mut self, cmp: &C) -> Option<(T, usize)> {
        if self.entries.is_empty() {
            return None;
        }
        let top = self.entries.swap_remove(0);
        if !self.entries.is_empty() {
            self.sift_down(0, cmp);
        }
        Some(top)
    }

    /// Swaps the top for the next head of the same run and restores order.
    /// Cheaper than a pop followed by a push.
    pub fn replace_top<C: Compare<T>>(&mut self, item: T, cmp: &C) -> Option<(T, usize)> {
        let first = self.entries.first_mut()?;
        let run = first.1;
        let old = std::mem::replace(first, (item, run));
        self.sift_down(0, cmp);
        Some(old)
    }

    fn less<C: Compare<T>>(&self, a: usize, b: usize, cmp: &C) -> bool {
        let (ia, ra) = &self.entries[a];
        let (ib, rb) = &self.entries[b];
        match cmp.compare(ia, ib) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => ra < rb,
        }
    }

    fn sift_up<C: Compare<T>>(&mut self, mut i: usize, cmp: &C) {
        while i > 0 {
            let parent = parent_index(i);
            if !self.less(i, parent, cmp) {
                break;
            }
            self.entries.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down<C: Compare<T>>(&mut self, mut i: usize, cmp: &C) {
        let n = self.entries.len();
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let smallest = if right < n && self.less(right, left, cmp) {
                right
            } else {
                left
            };
            if !self.less(smallest, i, cmp) {
                break;
            }
            self.entries.swap(i, smallest);
            i = smallest;
        }
    }
}

fn parent_index(index: usize) -> usize {
    (index - 1) / 2
}
