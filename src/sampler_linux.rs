//! Signal-driven capture of another thread's call stack.
//!
//! A transient `SIGPROF` handler is installed for the duration of one
//! capture, the target thread is signalled directly via `tgkill`, and the
//! handler walks the interrupted stack into a buffer shared through
//! [`CaptureShared`]. The kernel hands the handler no per-call context, so
//! the in-flight request lives in one process-wide object; the gate
//! guarantees there is a single writer at a time, and nothing outside this
//! module touches it.

use std::io;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::{debug, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::sync::{PosixSemaphore, SpinGate};
use crate::thread::{current_thread, Thread};
use crate::CAPTURE_TIMEOUT;

/// Signal used to interrupt the target thread.
const CAPTURE_SIGNAL: Signal = Signal::SIGPROF;

/// The one in-flight capture request.
///
/// `buffer`/`capacity` are published before `target` is armed; the handler
/// acquires `target` first, which orders its reads after those stores. `used`
/// is written only by the armed handler and read by the caller after the wait.
struct CaptureShared {
    gate: SpinGate,
    /// Task id the in-flight request is aimed at; -1 when disarmed.
    target: AtomicI32,
    buffer: AtomicPtr<usize>,
    capacity: AtomicUsize,
    used: AtomicUsize,
    /// How many times the transient handler sampled a stack. Diagnostic only.
    handler_runs: AtomicUsize,
    /// Posted by the handler once the buffer is filled. Process lifetime, so
    /// a post that arrives after the caller timed out cannot dangle.
    completed: OnceLock<PosixSemaphore>,
}

static SHARED: CaptureShared = CaptureShared {
    gate: SpinGate::new(),
    target: AtomicI32::new(-1),
    buffer: AtomicPtr::new(ptr::null_mut()),
    capacity: AtomicUsize::new(0),
    used: AtomicUsize::new(0),
    handler_runs: AtomicUsize::new(0),
    completed: OnceLock::new(),
};

/// Walks the calling thread in place. No gate, no signal.
pub(crate) fn capture_own_thread(frames: &mut [usize]) -> usize {
    if frames.is_empty() {
        return 0;
    }
    let walked = unsafe {
        libc::backtrace(frames.as_mut_ptr() as *mut *mut c_void, frames.len() as c_int)
    };
    walked.max(0) as usize
}

/// Interrupts `target` and collects whatever its handler invocation writes.
///
/// Serialized process-wide; blocks the caller for at most [`CAPTURE_TIMEOUT`].
pub(crate) fn capture_other_thread(target: Thread, frames: &mut [usize]) -> usize {
    if frames.is_empty() {
        return 0;
    }

    let _guard = SHARED.gate.lock();

    let completed = match completion_semaphore() {
        Some(sem) => sem,
        None => {
            warn!(
                "capture semaphore init failed: {}",
                io::Error::last_os_error()
            );
            return 0;
        }
    };
    completed.drain();

    SHARED.buffer.store(frames.as_mut_ptr(), Ordering::Release);
    SHARED.capacity.store(frames.len(), Ordering::Release);
    SHARED.used.store(0, Ordering::Release);
    SHARED.target.store(target.raw(), Ordering::Release);

    let transient = SigAction::new(
        SigHandler::SigAction(capture_signal_handler),
        SaFlags::SA_SIGINFO,
        SigSet::all(),
    );
    let original = match unsafe { sigaction(CAPTURE_SIGNAL, &transient) } {
        Ok(previous) => previous,
        Err(err) => {
            SHARED.target.store(-1, Ordering::Release);
            warn!("installing capture signal handler failed: {}", err);
            return 0;
        }
    };

    match target.signal(CAPTURE_SIGNAL as c_int) {
        Ok(()) => match completed.wait_timeout(CAPTURE_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => debug!("capture of thread {:?} timed out", target),
            Err(err) => warn!("waiting for capture completion failed: {}", err),
        },
        // Target exited between lookup and delivery; nothing to wait for.
        Err(err) => debug!("signalling thread {:?} failed: {}", target, err),
    }

    // Restore the original disposition whether or not the handler ran.
    if let Err(err) = unsafe { sigaction(CAPTURE_SIGNAL, &original) } {
        warn!("restoring original signal handler failed: {}", err);
    }
    SHARED.target.store(-1, Ordering::Release);

    SHARED.used.load(Ordering::Acquire).min(frames.len())
}

fn completion_semaphore() -> Option<&'static PosixSemaphore> {
    if let Some(sem) = SHARED.completed.get() {
        return Some(sem);
    }
    let sem = PosixSemaphore::new(0)?;
    Some(SHARED.completed.get_or_init(|| sem))
}

extern "C" fn capture_signal_handler(
    _signal: c_int,
    _info: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    // Some delivery models fan the signal out to threads that never asked for
    // it; only the armed target may touch the shared buffer.
    if current_thread().raw() != SHARED.target.load(Ordering::Acquire) {
        return;
    }

    SHARED.handler_runs.fetch_add(1, Ordering::Relaxed);

    let buffer = SHARED.buffer.load(Ordering::Acquire);
    let capacity = SHARED.capacity.load(Ordering::Acquire);
    if buffer.is_null() || capacity == 0 {
        return;
    }

    unsafe { ptr::write_bytes(buffer, 0, capacity) };
    let walked = unsafe { libc::backtrace(buffer as *mut *mut c_void, capacity as c_int) };
    let mut used = walked.max(0) as usize;
    used = prepend_interrupted_pc(buffer, capacity, used, context);
    SHARED.used.store(used, Ordering::Release);

    if let Some(sem) = SHARED.completed.get() {
        let _ = sem.post();
    }
}

/// Puts the interrupted program counter in the first slot, shifting the
/// walked frames right and dropping the last one when the buffer is full.
///
/// `backtrace` starts from the handler's own frames; the program counter from
/// the machine context is the one address that names what the target was
/// actually executing.
fn prepend_interrupted_pc(
    buffer: *mut usize,
    capacity: usize,
    used: usize,
    context: *mut c_void,
) -> usize {
    let pc = match program_counter(context) {
        Some(pc) => pc,
        None => return used,
    };
    let moved = used.min(capacity - 1);
    unsafe {
        ptr::copy(buffer, buffer.add(1), moved);
        *buffer = pc;
    }
    moved + 1
}

#[cfg(target_arch = "x86_64")]
fn program_counter(context: *mut c_void) -> Option<usize> {
    if context.is_null() {
        return None;
    }
    let ucontext = context as *const libc::ucontext_t;
    Some(unsafe { (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] } as usize)
}

#[cfg(target_arch = "aarch64")]
fn program_counter(context: *mut c_void) -> Option<usize> {
    if context.is_null() {
        return None;
    }
    let ucontext = context as *const libc::ucontext_t;
    Some(unsafe { (*ucontext).uc_mcontext.pc } as usize)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn program_counter(_context: *mut c_void) -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::mem;
    use std::sync::mpsc::{channel, Sender};
    use std::sync::{Mutex, MutexGuard};
    use std::thread::{spawn, JoinHandle};

    // The process has a single SIGPROF disposition; tests that install or
    // exercise handlers must not interleave.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn serialize() -> MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_parked() -> (Thread, Sender<()>, JoinHandle<()>) {
        let (tid_tx, tid_rx) = channel();
        let (release_tx, release_rx) = channel();
        let handle = spawn(move || {
            tid_tx.send(current_thread()).expect("send tid");
            release_rx.recv().expect("parked until released");
        });
        (tid_rx.recv().expect("tid"), release_tx, handle)
    }

    fn current_disposition() -> usize {
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        let rc = unsafe { libc::sigaction(libc::SIGPROF, ptr::null(), &mut action) };
        assert_eq!(rc, 0);
        action.sa_sigaction
    }

    #[test]
    fn test_capture_other_thread() {
        let _lock = serialize();
        let (target, release, handle) = spawn_parked();

        let mut frames = [0usize; 32];
        let count = capture_other_thread(target, &mut frames);
        assert!(count > 0);
        assert!(count <= frames.len());
        // The interrupted program counter leads the capture.
        assert_ne!(frames[0], 0);

        release.send(()).expect("release");
        handle.join().expect("successful join");
    }

    #[test]
    fn test_own_thread_capture_never_arms_handler() {
        let _lock = serialize();
        let runs_before = SHARED.handler_runs.load(Ordering::Relaxed);

        for capacity in &[0usize, 1, 4, 64] {
            let mut frames = vec![0usize; *capacity];
            let count = capture_own_thread(&mut frames);
            assert!(count <= *capacity);
        }

        assert_eq!(SHARED.handler_runs.load(Ordering::Relaxed), runs_before);
    }

    #[test]
    fn test_dead_thread_yields_zero_and_restores_disposition() {
        let _lock = serialize();

        extern "C" fn baseline_handler(_: c_int) {}
        let baseline = SigAction::new(
            SigHandler::Handler(baseline_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { sigaction(CAPTURE_SIGNAL, &baseline) }.expect("baseline handler set");
        let before = current_disposition();

        let (target, release, handle) = spawn_parked();
        release.send(()).expect("release");
        handle.join().expect("successful join");

        let mut frames = [0usize; 16];
        let count = capture_other_thread(target, &mut frames);
        assert_eq!(count, 0);
        assert_eq!(current_disposition(), before);
    }

    #[test]
    fn test_timeout_leaves_mechanism_usable() {
        let _lock = serialize();

        // A target that blocks the capture signal never runs the handler, so
        // the caller has to time out. The pending signal dies with the thread.
        let (tid_tx, tid_rx) = channel();
        let (release_tx, release_rx) = channel();
        let blocked = spawn(move || {
            let mut mask = SigSet::empty();
            mask.add(CAPTURE_SIGNAL);
            mask.thread_block().expect("signal blocked");
            tid_tx.send(current_thread()).expect("send tid");
            release_rx.recv().expect("parked until released");
        });
        let target = tid_rx.recv().expect("tid");

        let mut frames = [0usize; 16];
        let count = capture_other_thread(target, &mut frames);
        assert_eq!(count, 0);

        release_tx.send(()).expect("release");
        blocked.join().expect("successful join");

        // Gate and disposition must be fully restored for the next capture.
        let (target, release, handle) = spawn_parked();
        let count = capture_other_thread(target, &mut frames);
        assert!(count > 0);
        release.send(()).expect("release");
        handle.join().expect("successful join");
    }

    #[test]
    fn test_concurrent_captures_serialize() {
        let _lock = serialize();

        let (target_a, release_a, handle_a) = spawn_parked();
        let (target_b, release_b, handle_b) = spawn_parked();

        let sampler_a = spawn(move || {
            let mut frames = [0usize; 24];
            for _ in 0..10 {
                let count = capture_other_thread(target_a, &mut frames);
                assert!(count > 0);
                assert!(count <= frames.len());
            }
        });
        let sampler_b = spawn(move || {
            let mut frames = [0usize; 24];
            for _ in 0..10 {
                let count = capture_other_thread(target_b, &mut frames);
                assert!(count > 0);
                assert!(count <= frames.len());
            }
        });

        sampler_a.join().expect("successful join");
        sampler_b.join().expect("successful join");

        release_a.send(()).expect("release");
        release_b.send(()).expect("release");
        handle_a.join().expect("successful join");
        handle_b.join().expect("successful join");
    }
}
