//! Resource allocation for running tasks.

use std::future::Future;
use std::sync::Arc;

use derive_more::Display;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{instrument, trace};

/// The resources a task needs while performing: CPU slots and memory
/// in MB.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
#[display("np={np} mem={mem}MB")]
pub struct Requirement {
    pub np: u32,
    pub mem: u32,
}

impl Requirement {
    /// No resources at all. Used by tasks that only inspect the store.
    pub const NONE: Self = Self { np: 0, mem: 0 };
}

/// A granted resource. Slots return to the allocator when the grant is
/// dropped.
#[derive(Debug)]
pub struct Grant {
    np: u32,
    mem: u32,
    _cpu: OwnedSemaphorePermit,
    _mem: OwnedSemaphorePermit,
}

impl Grant {
    /// CPU slots held by this grant.
    pub fn np(&self) -> u32 {
        self.np
    }

    /// Memory held by this grant, in MB.
    pub fn mem(&self) -> u32 {
        self.mem
    }
}

/// The allocator refused the request permanently.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[display("{message}")]
pub struct AllocError {
    pub message: String,
}

impl std::error::Error for AllocError {}

/// Grants and reclaims `{np, mem}` resources.
///
/// `request` suspends until the resources are available, or fails
/// immediately when the request can never be satisfied.
pub trait Allocator: Clone + Send + Sync + 'static {
    fn request(&self, req: Requirement) -> impl Future<Output = Result<Grant, AllocError>> + Send;
}

/// Allocator over fixed machine-local totals.
///
/// CPU slots and memory are each a fair counting semaphore, so waiters
/// are served in FIFO order. Both are always acquired in the same order
/// (CPU, then memory), which rules out circular waits between
/// concurrent requests.
#[derive(Clone, Debug)]
pub struct LocalAlloc {
    np_total: u32,
    mem_total: u32,
    cpu: Arc<Semaphore>,
    mem: Arc<Semaphore>,
}

impl LocalAlloc {
    /// An allocator over `np` CPU slots and `mem` MB of memory.
    pub fn new(np: u32, mem: u32) -> Self {
        Self {
            np_total: np,
            mem_total: mem,
            cpu: Arc::new(Semaphore::new(np as usize)),
            mem: Arc::new(Semaphore::new(mem as usize)),
        }
    }

    /// An allocator sized to the current machine: every CPU, and the
    /// machine's total memory.
    pub fn detect() -> Self {
        let np = num_cpus::get() as u32;
        let mem = sysinfo::System::new_with_specifics(
            sysinfo::RefreshKind::nothing()
                .with_memory(sysinfo::MemoryRefreshKind::everything()),
        )
        .total_memory()
            / (1024 * 1024);
        Self::new(np, mem.min(u64::from(u32::MAX)) as u32)
    }

    /// The configured CPU total.
    pub fn np_total(&self) -> u32 {
        self.np_total
    }

    /// The configured memory total, in MB.
    pub fn mem_total(&self) -> u32 {
        self.mem_total
    }
}

impl Allocator for LocalAlloc {
    #[instrument(name = "LocalAlloc::request", skip(self))]
    async fn request(&self, req: Requirement) -> Result<Grant, AllocError> {
        if req.np > self.np_total {
            return Err(AllocError {
                message: format!(
                    "cannot allocate {} CPU slots: only {} exist",
                    req.np, self.np_total
                ),
            });
        }
        if req.mem > self.mem_total {
            return Err(AllocError {
                message: format!(
                    "cannot allocate {}MB of memory: only {}MB exist",
                    req.mem, self.mem_total
                ),
            });
        }

        let cpu = Arc::clone(&self.cpu)
            .acquire_many_owned(req.np)
            .await
            .map_err(|err| AllocError {
                message: format!("cpu slots unavailable: {err}"),
            })?;
        let mem = Arc::clone(&self.mem)
            .acquire_many_owned(req.mem)
            .await
            .map_err(|err| AllocError {
                message: format!("memory unavailable: {err}"),
            })?;

        trace!(np = req.np, mem = req.mem, "granted resources");
        Ok(Grant {
            np: req.np,
            mem: req.mem,
            _cpu: cpu,
            _mem: mem,
        })
    }
}
