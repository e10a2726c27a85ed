//! Process-wide style accounting of memory and open files.
//!
//! A [`Resources`] context is created explicitly and shared (via `Arc`) by every
//! sorter that should draw from the same limits. Sorters register increases and
//! decreases through RAII guards so a failing or abandoned sorter still hands
//! back everything it registered.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::SortError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Memory,
    Files,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::Files => write!(f, "files"),
        }
    }
}

/// What to do when a registration pushes usage over the limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enforcement {
    Ignore,
    Debug,
    Warn,
    Throw,
}

impl Enforcement {
    fn to_u8(self) -> u8 {
        match self {
            Enforcement::Ignore => 0,
            Enforcement::Debug => 1,
            Enforcement::Warn => 2,
            Enforcement::Throw => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Enforcement::Ignore,
            1 => Enforcement::Debug,
            2 => Enforcement::Warn,
            _ => Enforcement::Throw,
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind} limit exceeded: requested {requested}, used {used}, limit {limit}")]
pub struct ResourceExhausted {
    pub kind: ResourceKind,
    pub requested: usize,
    pub used: usize,
    pub limit: usize,
}

impl From<ResourceExhausted> for SortError {
    fn from(e: ResourceExhausted) -> Self {
        let available = e.limit.saturating_sub(e.used);
        match e.kind {
            ResourceKind::Memory => SortError::OutOfMemory {
                phase: "memory manager",
                required: e.requested,
                available,
            },
            ResourceKind::Files => SortError::OutOfFiles {
                needed: e.requested,
                available,
            },
        }
    }
}

/// Tracks usage of one resource against a limit.
pub struct ResourceManager {
    kind: ResourceKind,
    used: AtomicUsize,
    limit: AtomicUsize,
    enforcement: AtomicU8,
}

impl ResourceManager {
    pub fn new(kind: ResourceKind, limit: usize, enforcement: Enforcement) -> Self {
        Self {
            kind,
            used: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
            enforcement: AtomicU8::new(enforcement.to_u8()),
        }
    }

    pub fn unlimited(kind: ResourceKind) -> Self {
        Self::new(kind, usize::MAX, Enforcement::Ignore)
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.used())
    }

    /// Lowering the limit below current usage is allowed and never fails.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    pub fn enforcement(&self) -> Enforcement {
        Enforcement::from_u8(self.enforcement.load(Ordering::SeqCst))
    }

    pub fn set_enforcement(&self, enforcement: Enforcement) {
        self.enforcement.store(enforcement.to_u8(), Ordering::SeqCst);
    }

    pub fn register_increase(&self, amount: usize) -> Result<(), ResourceExhausted> {
        let used = self.used.fetch_add(amount, Ordering::SeqCst) + amount;
        let limit = self.limit();
        if used <= limit {
            return Ok(());
        }
        match self.enforcement() {
            Enforcement::Ignore => Ok(()),
            Enforcement::Debug => {
                debug!(kind = %self.kind, used, limit, "resource limit exceeded");
                Ok(())
            }
            Enforcement::Warn => {
                warn!(kind = %self.kind, used, limit, "resource limit exceeded");
                Ok(())
            }
            Enforcement::Throw => {
                self.used.fetch_sub(amount, Ordering::SeqCst);
                Err(ResourceExhausted {
                    kind: self.kind,
                    requested: amount,
                    used: used - amount,
                    limit,
                })
            }
        }
    }

    pub fn register_decrease(&self, amount: usize) {
        let prev = self.used.fetch_sub(amount, Ordering::SeqCst);
        debug_assert!(prev >= amount, "{} usage underflow", self.kind);
    }
}

/// The memory and file managers shared by a group of sorters.
pub struct Resources {
    memory: ResourceManager,
    files: ResourceManager,
}

impl Resources {
    pub fn new(memory_limit: usize, file_limit: usize, enforcement: Enforcement) -> Arc<Self> {
        Arc::new(Self {
            memory: ResourceManager::new(ResourceKind::Memory, memory_limit, enforcement),
            files: ResourceManager::new(ResourceKind::Files, file_limit, enforcement),
        })
    }

    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            memory: ResourceManager::unlimited(ResourceKind::Memory),
            files: ResourceManager::unlimited(ResourceKind::Files),
        })
    }

    pub fn memory(&self) -> &ResourceManager {
        &self.memory
    }

    pub fn files(&self) -> &ResourceManager {
        &self.files
    }

    /// Registers one open file; released when the slot is dropped.
    pub fn acquire_file(self: &Arc<Self>) -> Result<FileSlot, ResourceExhausted> {
        self.files.register_increase(1)?;
        Ok(FileSlot {
            resources: Arc::clone(self),
        })
    }
}

/// One registered open file.
pub struct FileSlot {
    resources: Arc<Resources>,
}

impl Drop for FileSlot {
    fn drop(&mut self) {
        self.resources.files.register_decrease(1);
    }
}

/// Per-sorter memory account that forwards to the shared memory manager.
#[derive(Clone)]
pub struct MemoryBucket {
    resources: Arc<Resources>,
    used: Arc<AtomicUsize>,
}

impl MemoryBucket {
    pub fn new(resources: Arc<Resources>) -> Self {
        Self {
            resources,
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    /// Bytes currently reserved through this bucket.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn reserve(&self, bytes: usize) -> Result<Reservation, ResourceExhausted> {
        self.resources.memory.register_increase(bytes)?;
        self.used.fetch_add(bytes, Ordering::SeqCst);
        Ok(Reservation {
            bucket: self.clone(),
            bytes,
        })
    }

    /// Reserves only if the memory manager has room, regardless of enforcement.
    pub fn try_reserve(&self, bytes: usize) -> Option<Reservation> {
        if bytes > self.resources.memory.available() {
            return None;
        }
        self.reserve(bytes).ok()
    }
}

/// Reserved bytes, handed back on drop.
pub struct Reservation {
    bucket: MemoryBucket,
    bytes: usize,
}

impl Reservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.bucket.used.fetch_sub(self.bytes, Ordering::SeqCst);
        self.bucket.resources.memory.register_decrease(self.bytes);
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reservation({} b)", self.bytes)
    }
}
