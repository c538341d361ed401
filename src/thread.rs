//! Thread identity for capture targets.

#[cfg(target_os = "linux")]
mod imp {
    use std::fs;
    use std::io;

    use libc::pid_t;

    /// Identifies one live thread of this process (a Linux task id).
    ///
    /// Not owned by this crate; the caller is responsible for the thread
    /// still being alive when it is used as a capture target.
    #[derive(Eq, PartialEq, Debug, Hash, Copy, Clone)]
    pub struct Thread(pid_t);

    impl Thread {
        /// Sentinel for "the calling thread". A raw id of zero never names a
        /// real task.
        pub const SELF: Thread = Thread(0);

        pub fn from_raw(tid: pid_t) -> Thread {
            Thread(tid)
        }

        pub fn raw(self) -> pid_t {
            self.0
        }

        pub fn is_current(self) -> bool {
            self.0 == 0 || self == current_thread()
        }

        /// Queues `signal` for this specific task.
        ///
        /// Fails with `ESRCH` when the task has already exited.
        pub(crate) fn signal(self, signal: libc::c_int) -> io::Result<()> {
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_tgkill,
                    std::process::id() as libc::c_long,
                    libc::c_long::from(self.0),
                    libc::c_long::from(signal),
                )
            };
            if rc == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }

    /// Returns the identity of the calling thread.
    ///
    /// This is a raw `gettid` syscall and is safe to use inside a signal
    /// handler.
    pub fn current_thread() -> Thread {
        Thread(unsafe { libc::syscall(libc::SYS_gettid) as pid_t })
    }

    /// Returns an iterator over the current process' threads.
    ///
    /// No liveness guarantee: threads may appear after the snapshot or exit
    /// before the iterator reaches them.
    pub fn thread_iterator() -> io::Result<impl Iterator<Item = io::Result<Thread>>> {
        fs::read_dir("/proc/self/task").map(|entries| {
            entries.map(|entry| {
                entry.map(|dir_entry| {
                    let file = dir_entry.file_name().into_string().expect("valid utf8");
                    Thread(file.parse::<pid_t>().expect("tid should be pid_t"))
                })
            })
        })
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    /// Opaque thread identity on platforms without capture support.
    #[derive(Eq, PartialEq, Debug, Hash, Copy, Clone)]
    pub struct Thread(i64);

    impl Thread {
        /// Sentinel for "the calling thread".
        pub const SELF: Thread = Thread(0);

        pub fn from_raw(tid: i64) -> Thread {
            Thread(tid)
        }

        pub fn raw(self) -> i64 {
            self.0
        }

        pub fn is_current(self) -> bool {
            self.0 == 0
        }
    }

    pub fn current_thread() -> Thread {
        Thread::SELF
    }
}

pub use self::imp::*;
