/// Items between two forwarded progress updates.
pub const PROGRESS_GRANULARITY: u64 = 1024;

/// Receives progress of the merge phase.
pub trait Progress {
    fn init(&mut self, total: u64) {
        let _ = total;
    }

    fn step(&mut self, done: u64, total: u64);

    fn done(&mut self) {}
}

/// Any `FnMut(done, total)` closure works as a progress callback.
impl<F: FnMut(u64, u64)> Progress for F {
    fn step(&mut self, done: u64, total: u64) {
        self(done, total)
    }
}

pub struct NoProgress;

impl Progress for NoProgress {
    fn step(&mut self, _done: u64, _total: u64) {}
}

/// Counts items and forwards every `PROGRESS_GRANULARITY`-th one.
pub(crate) struct ProgressTracker<'a> {
    sink: &'a mut dyn Progress,
    done: u64,
    total: u64,
    pending: u64,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a mut dyn Progress, total: u64) -> Self {
        sink.init(total);
        Self {
            sink,
            done: 0,
            total,
            pending: 0,
        }
    }

    #[inline]
    pub fn tick(&mut self) {
        self.done += 1;
        self.pending += 1;
        if self.pending >= PROGRESS_GRANULARITY {
            self.pending = 0;
            self.sink.step(self.done, self.total);
        }
    }

    pub fn finish(self) {
        if self.pending > 0 || self.done == 0 {
            self.sink.step(self.done, self.total);
        }
        self.sink.done();
    }
}
