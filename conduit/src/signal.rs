//! # Exit Signal
//!
//! A single shared boolean used for cooperative cancellation of every worker
//! instance in a pipeline. Workers poll [`ExitSignal::is_requested`] at the top
//! of each loop iteration and whenever a timed queue call comes back empty.
//!
//! The flag lives in an anonymous shared mapping created by
//! [`ExitSignal::new`]. Worker instances are forked children of the
//! orchestrating process, so they inherit the mapping and every process sees
//! the same byte. Clones share the flag as well.
//!
//! Nothing in this module interrupts a worker; an instance that never polls
//! the signal never stops.

use std::fmt;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// Sleep granularity of [`ExitSignal::wait_timeout`].
const WAIT_SLICE: Duration = Duration::from_millis(5);

/// One `AtomicBool` in a `MAP_SHARED | MAP_ANONYMOUS` page.
struct SharedFlag {
    flag: NonNull<AtomicBool>,
    len: usize,
}

// The mapping is only ever accessed through the atomic.
unsafe impl Send for SharedFlag {}
unsafe impl Sync for SharedFlag {}

impl SharedFlag {
    fn map() -> io::Result<Self> {
        let len = std::mem::size_of::<AtomicBool>();
        // SAFETY: a fresh anonymous mapping with no address hint; the kernel
        // zero-fills it, which is a valid `false`.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let flag = NonNull::new(addr.cast::<AtomicBool>()).ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Self { flag, len })
    }

    fn get(&self) -> &AtomicBool {
        // SAFETY: the mapping stays valid until `drop` and is page aligned.
        unsafe { self.flag.as_ref() }
    }
}

impl Drop for SharedFlag {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly what `map` returned. Other processes keep
        // their own reference to the pages.
        unsafe {
            libc::munmap(self.flag.as_ptr().cast(), self.len);
        }
    }
}

/// Pipeline-wide exit request shared by the orchestrator and all workers,
/// across process boundaries.
#[derive(Clone)]
pub struct ExitSignal {
    shared: Arc<SharedFlag>,
}

impl fmt::Debug for ExitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitSignal")
            .field("requested", &self.is_requested())
            .finish()
    }
}

impl ExitSignal {
    /// Create a signal in the not-requested state.
    ///
    /// Must be called before any worker process is started, so that the
    /// workers inherit the mapping. Fails only if the shared page cannot be
    /// mapped.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            shared: Arc::new(SharedFlag::map()?),
        })
    }

    /// Ask every worker to exit. Idempotent.
    pub fn request(&self) {
        let was_requested = self.shared.get().swap(true, Ordering::SeqCst);
        if !was_requested {
            debug!("Exit requested");
        }
    }

    /// Whether exit has been requested. Never blocks or allocates.
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.shared.get().load(Ordering::SeqCst)
    }

    /// Reset the signal to not-requested.
    ///
    /// Only call this after `join` has returned for every pool observing this
    /// signal. A worker still running when the flag is cleared may never see
    /// the earlier request.
    pub fn clear(&self) {
        self.shared.get().store(false, Ordering::SeqCst);
        debug!("Exit signal cleared");
    }

    /// Sleep for up to `period`, waking early if exit is requested.
    ///
    /// The flag is re-checked every few milliseconds, so a request from
    /// another process is seen within one slice. Returns whether exit has
    /// been requested.
    pub fn wait_timeout(&self, period: Duration) -> bool {
        let deadline = Instant::now() + period;
        loop {
            if self.is_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(WAIT_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    #[test]
    fn test_request_is_idempotent() {
        let signal = ExitSignal::new().unwrap();
        assert!(!signal.is_requested());

        signal.request();
        signal.request();
        assert!(signal.is_requested());
    }

    #[test]
    fn test_clones_share_flag() {
        let signal = ExitSignal::new().unwrap();
        let observer = signal.clone();

        signal.request();
        assert!(observer.is_requested());

        observer.clear();
        assert!(!signal.is_requested());
    }

    #[test]
    fn test_request_visible_from_other_thread() {
        let signal = ExitSignal::new().unwrap();
        let observer = signal.clone();
        signal.request();

        let seen = thread::spawn(move || observer.is_requested()).join().unwrap();
        assert!(seen);
    }

    #[test]
    fn test_request_visible_in_forked_child() {
        let signal = ExitSignal::new().unwrap();

        // The child exits 0 only if it sees the parent's request.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let seen = signal.wait_timeout(Duration::from_secs(10));
                std::process::exit(if seen { 0 } else { 1 });
            }
            ForkResult::Parent { child } => {
                thread::sleep(Duration::from_millis(50));
                signal.request();
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }
    }

    #[test]
    fn test_request_from_forked_child_reaches_parent() {
        let signal = ExitSignal::new().unwrap();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                signal.request();
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                waitpid(child, None).unwrap();
                assert!(signal.is_requested());
            }
        }
    }

    #[test]
    fn test_wait_timeout_elapses_without_request() {
        let signal = ExitSignal::new().unwrap();
        let start = Instant::now();

        assert!(!signal.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_timeout_wakes_early_on_request() {
        let signal = ExitSignal::new().unwrap();
        let requester = signal.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            requester.request();
        });

        let start = Instant::now();
        assert!(signal.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_returns_immediately_when_already_requested() {
        let signal = ExitSignal::new().unwrap();
        signal.request();
        assert!(signal.wait_timeout(Duration::from_secs(10)));
    }
}
