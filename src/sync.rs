//! Synchronization primitives that stay safe around asynchronous signals.

use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide exclusion flag.
///
/// A conventional mutex cannot guard a region that spans an asynchronous
/// signal delivery: the unlock may have to happen on a path the parking and
/// poisoning machinery was never designed for. This gate is a bare atomic
/// exchange loop instead, const-constructible so it can live in a `static`.
pub struct SpinGate {
    locked: AtomicBool,
}

impl SpinGate {
    pub const fn new() -> SpinGate {
        SpinGate {
            locked: AtomicBool::new(false),
        }
    }

    /// Spins until exclusive ownership is obtained.
    pub fn lock(&self) -> SpinGateGuard<'_> {
        while self.locked.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
        SpinGateGuard { gate: self }
    }
}

pub struct SpinGateGuard<'a> {
    gate: &'a SpinGate,
}

impl<'a> Drop for SpinGateGuard<'a> {
    fn drop(&mut self) {
        self.gate.locked.store(false, Ordering::Release);
    }
}

#[cfg(target_os = "linux")]
pub use self::sem::PosixSemaphore;

#[cfg(target_os = "linux")]
mod sem {
    use std::cell::UnsafeCell;
    use std::io;
    use std::mem::MaybeUninit;
    use std::time::Duration;

    /// Wraps a POSIX semaphore.
    ///
    /// `sem_post` is one of the few primitives that may be called from a
    /// signal handler, which is why the capture completion signal is a
    /// semaphore and not a condvar.
    pub struct PosixSemaphore {
        sem: UnsafeCell<libc::sem_t>,
    }

    impl PosixSemaphore {
        /// Returns a new semaphore if initialization succeeded.
        pub fn new(value: u32) -> Option<PosixSemaphore> {
            let mut sem = MaybeUninit::<libc::sem_t>::uninit();
            let rc = unsafe {
                libc::sem_init(sem.as_mut_ptr(), 0 /* not shared */, value)
            };
            if rc == -1 {
                return None;
            }
            Some(PosixSemaphore {
                sem: UnsafeCell::new(unsafe { sem.assume_init() }),
            })
        }

        pub fn post(&self) -> io::Result<()> {
            if unsafe { libc::sem_post(self.sem.get()) } == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }

        pub fn wait(&self) -> io::Result<()> {
            if unsafe { libc::sem_wait(self.sem.get()) } == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }

        /// Waits up to `timeout` for a post.
        ///
        /// Returns `Ok(true)` when the post arrived, `Ok(false)` on timeout.
        /// Retries when interrupted by an unrelated signal.
        pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
            let mut deadline = MaybeUninit::<libc::timespec>::uninit();
            if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, deadline.as_mut_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let mut deadline = unsafe { deadline.assume_init() };
            deadline.tv_sec += timeout.as_secs() as libc::time_t;
            deadline.tv_nsec += timeout.subsec_nanos() as libc::c_long;
            if deadline.tv_nsec >= 1_000_000_000 {
                deadline.tv_sec += 1;
                deadline.tv_nsec -= 1_000_000_000;
            }

            loop {
                if unsafe { libc::sem_timedwait(self.sem.get(), &deadline) } == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::ETIMEDOUT) => return Ok(false),
                    _ => return Err(err),
                }
            }
        }

        /// Consumes any pending posts, so a capture that completed after its
        /// caller gave up cannot satisfy the next caller's wait.
        pub fn drain(&self) {
            while unsafe { libc::sem_trywait(self.sem.get()) } == 0 {}
        }
    }

    unsafe impl Sync for PosixSemaphore {}

    impl Drop for PosixSemaphore {
        fn drop(&mut self) {
            unsafe { libc::sem_destroy(self.sem.get()) };
        }
    }
}
