//! Fixed-layout shared memory attached by every process generation.
//!
//! The region carries the INITIALIZING flag that serializes generation
//! start-up plus two process-shared, crash-robust mutexes guarding the log
//! sinks. The layout is versioned: a mismatch across generations means two
//! binary-incompatible images and has no safe continuation.

use std::{
    ffi::CString,
    io, mem,
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::warn;

use crate::RestartError;

/// Bumped whenever the cross-generation protocol or this layout changes.
pub const HOT_RESTART_VERSION: u64 = 11;

const SHMEM_FLAGS_INITIALIZING: u64 = 0x1;

#[repr(C)]
struct SharedMemory {
    size: u64,
    version: u64,
    flags: AtomicU64,
    log_lock: libc::pthread_mutex_t,
    access_log_lock: libc::pthread_mutex_t,
}

#[derive(Debug)]
pub struct SharedMemoryRegion {
    shmem: NonNull<SharedMemory>,
}

// The region is a process-shared mapping; all mutation goes through atomics
// or the embedded process-shared mutexes.
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

impl SharedMemoryRegion {
    /// Map the region for `base_id`, creating it at epoch 0 and re-attaching
    /// at later epochs. Acquires the INITIALIZING bit; a live predecessor
    /// still holding it yields the retryable [`RestartError::StillInitializing`].
    pub fn attach(base_id: u64, epoch: u64) -> Result<SharedMemoryRegion, RestartError> {
        Self::attach_with_layout(
            base_id,
            epoch,
            mem::size_of::<SharedMemory>() as u64,
            HOT_RESTART_VERSION,
        )
    }

    /// Layout parameters are injectable so incompatibility handling is
    /// testable without compiling a second binary.
    fn attach_with_layout(
        base_id: u64,
        epoch: u64,
        expected_size: u64,
        expected_version: u64,
    ) -> Result<SharedMemoryRegion, RestartError> {
        let name = Self::shmem_name(base_id);
        let cname = CString::new(name.clone()).expect("shmem name contains no NUL");

        let mut oflag = libc::O_RDWR;
        if epoch == 0 {
            oflag |= libc::O_CREAT | libc::O_EXCL;
            // Best effort: a previous unclean shutdown may have left the
            // object behind; unlink so create-exclusive can succeed.
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }

        let fd = unsafe {
            libc::shm_open(cname.as_ptr(), oflag, (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t)
        };
        if fd < 0 {
            let e = io::Error::last_os_error();
            return Err(RestartError::Io(io::Error::new(
                e.kind(),
                format!("cannot open shared memory region {name}, check user permissions: {e}"),
            )));
        }

        let map_len = mem::size_of::<SharedMemory>();
        if epoch == 0 {
            let rc = unsafe { libc::ftruncate(fd, map_len as libc::off_t) };
            if rc != 0 {
                let e = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(RestartError::Io(e));
            }
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(RestartError::Io(io::Error::last_os_error()));
        }
        let shmem = ptr as *mut SharedMemory;

        if epoch == 0 {
            unsafe {
                (*shmem).size = expected_size;
                (*shmem).version = expected_version;
                (*shmem).flags = AtomicU64::new(0);
                initialize_mutex(&mut (*shmem).log_lock)?;
                initialize_mutex(&mut (*shmem).access_log_lock)?;
            }
        } else {
            let (size, version) = unsafe { ((*shmem).size, (*shmem).version) };
            if size != expected_size {
                return Err(RestartError::Incompatible(format!(
                    "shared memory size mismatch: region has {size}, this binary expects \
                     {expected_size}; you must have hot restarted into a \
                     hot-restart-incompatible new version"
                )));
            }
            if version != expected_version {
                return Err(RestartError::Incompatible(format!(
                    "hot restart version mismatch: region has {version}, this binary expects \
                     {expected_version}; you must have hot restarted into a \
                     hot-restart-incompatible new version"
                )));
            }
        }

        let region = SharedMemoryRegion {
            shmem: NonNull::new(shmem).expect("mmap returned a non-null mapping"),
        };

        // A new generation starting while the current one has not finished
        // initializing fails early here, without touching any running
        // process; the supervisor retries with backoff and the same epoch.
        let old_flags = region
            .flags()
            .fetch_or(SHMEM_FLAGS_INITIALIZING, Ordering::SeqCst);
        if old_flags & SHMEM_FLAGS_INITIALIZING != 0 {
            return Err(RestartError::StillInitializing);
        }
        Ok(region)
    }

    pub fn shmem_name(base_id: u64) -> String {
        format!("/envoy_shared_memory_{base_id}")
    }

    /// Compatibility string checked by supervisors before attempting a hot
    /// restart between two binaries: protocol version plus the exact
    /// structure size.
    pub fn version_string() -> String {
        version_string_for(mem::size_of::<SharedMemory>() as u64)
    }

    fn flags(&self) -> &AtomicU64 {
        unsafe { &self.shmem.as_ref().flags }
    }

    pub fn initializing(&self) -> bool {
        self.flags().load(Ordering::SeqCst) & SHMEM_FLAGS_INITIALIZING != 0
    }

    /// Called once start-up completed (all listeners warmed, parent drained);
    /// unblocks any next generation racing to start.
    pub fn clear_initializing(&self) {
        self.flags()
            .fetch_and(!SHMEM_FLAGS_INITIALIZING, Ordering::SeqCst);
    }

    pub fn log_lock(&self) -> RecoverableLock<'_> {
        RecoverableLock {
            mutex: unsafe { &self.shmem.as_ref().log_lock as *const _ as *mut _ },
            _region: std::marker::PhantomData,
        }
    }

    pub fn access_log_lock(&self) -> RecoverableLock<'_> {
        RecoverableLock {
            mutex: unsafe { &self.shmem.as_ref().access_log_lock as *const _ as *mut _ },
            _region: std::marker::PhantomData,
        }
    }
}

fn version_string_for(size: u64) -> String {
    format!("{HOT_RESTART_VERSION}.{size}")
}

fn initialize_mutex(mutex: *mut libc::pthread_mutex_t) -> Result<(), RestartError> {
    unsafe {
        let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
        check_rc(libc::pthread_mutexattr_init(&mut attr))?;
        check_rc(libc::pthread_mutexattr_setpshared(
            &mut attr,
            libc::PTHREAD_PROCESS_SHARED,
        ))?;
        check_rc(libc::pthread_mutexattr_setrobust(
            &mut attr,
            libc::PTHREAD_MUTEX_ROBUST,
        ))?;
        check_rc(libc::pthread_mutex_init(mutex, &attr))?;
        libc::pthread_mutexattr_destroy(&mut attr);
    }
    Ok(())
}

fn check_rc(rc: libc::c_int) -> Result<(), RestartError> {
    if rc != 0 {
        return Err(RestartError::Io(io::Error::from_raw_os_error(rc)));
    }
    Ok(())
}

/// Process-shared mutex that survives the death of a holder: if the owning
/// process died mid-critical-section the next acquirer observes it, marks
/// the state consistent and proceeds instead of deadlocking forever.
pub struct RecoverableLock<'a> {
    mutex: *mut libc::pthread_mutex_t,
    _region: std::marker::PhantomData<&'a SharedMemoryRegion>,
}

impl<'a> RecoverableLock<'a> {
    pub fn lock(&self) -> LockGuard<'a> {
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex) };
        let recovered = rc == libc::EOWNERDEAD;
        if recovered {
            warn!("recovered a shared-memory lock held by a dead process");
            unsafe { libc::pthread_mutex_consistent(self.mutex) };
        }
        assert!(rc == 0 || recovered, "pthread_mutex_lock failed: {rc}");
        LockGuard {
            mutex: self.mutex,
            recovered,
            _region: std::marker::PhantomData,
        }
    }
}

pub struct LockGuard<'a> {
    mutex: *mut libc::pthread_mutex_t,
    recovered: bool,
    _region: std::marker::PhantomData<&'a SharedMemoryRegion>,
}

impl LockGuard<'_> {
    /// Whether this acquisition recovered the lock from a dead holder; the
    /// caller should treat the protected state as possibly torn.
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        unsafe { libc::pthread_mutex_unlock(self.mutex) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_base_id(offset: u64) -> u64 {
        // Distinct per test process so parallel CI runs don't collide.
        1_000_000 + std::process::id() as u64 * 100 + offset
    }

    fn unlink(base_id: u64) {
        let name = CString::new(SharedMemoryRegion::shmem_name(base_id)).unwrap();
        unsafe { libc::shm_unlink(name.as_ptr()) };
    }

    #[test]
    fn epoch_zero_creates_and_sets_initializing() {
        let base_id = test_base_id(0);
        let region = SharedMemoryRegion::attach(base_id, 0).unwrap();
        assert!(region.initializing());
        region.clear_initializing();
        assert!(!region.initializing());
        unlink(base_id);
    }

    #[test]
    fn racing_generation_gets_a_retryable_error() {
        let base_id = test_base_id(1);
        let gen0 = SharedMemoryRegion::attach(base_id, 0).unwrap();
        // gen0 has not finished initializing yet.
        let err = SharedMemoryRegion::attach(base_id, 1).unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.is_fatal());

        gen0.clear_initializing();
        let gen1 = SharedMemoryRegion::attach(base_id, 1).unwrap();
        assert!(gen1.initializing());
        unlink(base_id);
    }

    #[test]
    fn size_mismatch_is_fatal() {
        let base_id = test_base_id(2);
        let gen0 = SharedMemoryRegion::attach(base_id, 0).unwrap();
        gen0.clear_initializing();

        let wrong_size = mem::size_of::<SharedMemory>() as u64 + 1;
        let err =
            SharedMemoryRegion::attach_with_layout(base_id, 1, wrong_size, HOT_RESTART_VERSION)
                .unwrap_err();
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        unlink(base_id);
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let base_id = test_base_id(3);
        let gen0 = SharedMemoryRegion::attach(base_id, 0).unwrap();
        gen0.clear_initializing();

        let err = SharedMemoryRegion::attach_with_layout(
            base_id,
            1,
            mem::size_of::<SharedMemory>() as u64,
            HOT_RESTART_VERSION + 1,
        )
        .unwrap_err();
        assert!(err.is_fatal());
        unlink(base_id);
    }

    #[test]
    fn version_string_embeds_the_structure_size() {
        let size = mem::size_of::<SharedMemory>() as u64;
        let current = SharedMemoryRegion::version_string();
        assert_eq!(current, format!("{HOT_RESTART_VERSION}.{size}"));
        // A layout change of a single byte yields a different string.
        assert_ne!(current, version_string_for(size + 1));
    }

    #[test]
    fn locks_acquire_and_release() {
        let base_id = test_base_id(4);
        let region = SharedMemoryRegion::attach(base_id, 0).unwrap();
        {
            let guard = region.log_lock().lock();
            assert!(!guard.recovered());
        }
        {
            let guard = region.access_log_lock().lock();
            assert!(!guard.recovered());
        }
        // Re-acquire after release works.
        let _guard = region.log_lock().lock();
        unlink(base_id);
    }
}
