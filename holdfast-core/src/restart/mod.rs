//! Hot restart: replacing the running process with a new image while keeping
//! listen sockets bound and connections flowing.
//!
//! Generations coordinate through a versioned shared memory region and a
//! local control channel. [`HotRestart`] is the façade the bootstrap and
//! shutdown sequences use; the child and parent protocol roles behind it are
//! exported for direct use in tests.

use std::{io, os::fd::OwnedFd};

use tracing::error;

mod channel;
mod child;
mod message;
mod parent;
mod shmem;

pub use channel::DEFAULT_RPC_TIMEOUT;
pub use child::HotRestartingChild;
pub use message::{HotRestartMessage, Reply, Request};
pub use parent::{HotRestartingParent, ParentCallbacks, SocketRegistry};
pub use shmem::{LockGuard, RecoverableLock, SharedMemoryRegion, HOT_RESTART_VERSION};

use crate::{stats::StatsStore, RestartError};

/// Last-known resource usage of the previous generation, for display.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerStatsFromParent {
    pub parent_memory_allocated: u64,
    pub parent_connections: u64,
}

/// Coordinator for one process generation: owns the shared memory region and
/// both protocol roles.
pub struct HotRestart {
    shmem: SharedMemoryRegion,
    as_child: HotRestartingChild,
    as_parent: HotRestartingParent,
}

impl HotRestart {
    /// Attach to the restart machinery for `base_id` at `epoch`.
    ///
    /// A layout-incompatible region means two binary-incompatible images on
    /// one base id; there is no safe continuation and the process aborts. A
    /// predecessor still initializing yields the retryable
    /// [`RestartError::StillInitializing`].
    pub fn new(base_id: u64, epoch: u64) -> Result<Self, RestartError> {
        let shmem = match SharedMemoryRegion::attach(base_id, epoch) {
            Ok(region) => region,
            Err(e) if e.is_fatal() => {
                error!("{e}");
                std::process::abort();
            }
            Err(e) => return Err(e),
        };
        let as_child = HotRestartingChild::new(base_id, epoch)?;
        let as_parent = HotRestartingParent::new(base_id, epoch)?;

        // If the generation that spawned us ever goes away, terminate: this
        // process must never outlive its parent unnoticed.
        #[cfg(target_os = "linux")]
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        }

        Ok(Self {
            shmem,
            as_child,
            as_parent,
        })
    }

    /// Ask the previous generation for the fd of its socket bound to
    /// `address`; `None` when there is no previous generation or it holds no
    /// such socket.
    pub fn duplicate_parent_listen_socket(&self, address: &str) -> io::Result<Option<OwnedFd>> {
        self.as_child.duplicate_parent_listen_socket(address)
    }

    /// Tell the previous generation to drain now that this generation's
    /// listeners are confirmed up, then clear INITIALIZING so the next
    /// generation can start.
    pub fn drain_parent_listeners(&self) -> io::Result<()> {
        self.as_child.drain_parent_listeners()?;
        self.shmem.clear_initializing();
        Ok(())
    }

    /// Fold the previous generation's stats into `store` so cumulative
    /// metrics survive the restart.
    pub fn merge_parent_stats_if_any(
        &self,
        store: &StatsStore,
    ) -> io::Result<ServerStatsFromParent> {
        let mut response = ServerStatsFromParent::default();
        if let Some(snapshot) = self.as_child.get_parent_stats()? {
            store.merge(&snapshot);
            response.parent_memory_allocated = snapshot.memory_allocated;
            response.parent_connections = snapshot.num_connections;
        }
        Ok(response)
    }

    /// Returns the parent's original start time when a parent exists.
    pub fn send_parent_admin_shutdown_request(&self) -> io::Result<Option<u64>> {
        self.as_child.send_parent_admin_shutdown_request()
    }

    pub fn send_parent_terminate_request(&self) -> io::Result<()> {
        self.as_child.send_parent_terminate_request()
    }

    /// Start serving this generation's parent role for a future child.
    pub fn initialize(&mut self, callbacks: ParentCallbacks) {
        self.as_parent.initialize(callbacks);
    }

    /// Offer a listen socket for duplication to a future child generation.
    pub fn register_parent_socket(&self, address: String, fd: OwnedFd) {
        self.as_parent
            .registry()
            .lock()
            .expect("socket registry lock poisoned")
            .insert(address, fd);
    }

    /// Stop serving as a potential parent. Idempotent.
    pub fn shutdown(&mut self) {
        self.as_parent.shutdown();
    }

    /// Compatibility string; differs between any two binaries whose shared
    /// memory layouts differ, down to a single byte.
    pub fn version() -> String {
        SharedMemoryRegion::version_string()
    }

    pub fn log_lock(&self) -> RecoverableLock<'_> {
        self.shmem.log_lock()
    }

    pub fn access_log_lock(&self) -> RecoverableLock<'_> {
        self.shmem.access_log_lock()
    }
}
