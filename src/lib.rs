//! Capture the call stack of any thread in the running process.
//!
//! The calling thread is walked directly. Any other thread is interrupted
//! with a transient signal handler that walks the interrupted stack into the
//! caller's buffer, bounded by a 200 ms wait; see [`capture_stack`]. Raw
//! addresses can then be resolved against the dynamic linker's symbol tables
//! ([`SymbolResolver`]) and rendered as text ([`dump_stack`]).
//!
//! Every failure mode degrades to an empty or partial result. A diagnostic
//! facility must never crash or hang the process it is diagnosing, so nothing
//! here returns an error to the caller.

mod render;
mod symbols;
mod sync;
mod thread;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod sampler_linux;

pub use crate::render::format_frames;
pub use crate::symbols::{demangle_name, Demangler, ResolvedFrame, SymbolResolver};
pub use crate::thread::{current_thread, Thread};

#[cfg(target_os = "linux")]
pub use crate::thread::thread_iterator;

use std::time::Duration;

/// How long a cross-thread capture waits for the interrupted thread to fill
/// the buffer before giving up and reporting whatever is there.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_millis(200);

/// Number of frames collected by [`dump_stack`].
pub const DUMP_FRAMES: usize = 32;

/// Platform capture capability, selected once per target rather than branched
/// on at every call site.
#[allow(dead_code)]
#[derive(Clone, Copy)]
enum Capability {
    Available {
        own: fn(&mut [usize]) -> usize,
        other: fn(Thread, &mut [usize]) -> usize,
    },
    Unavailable,
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
const CAPABILITY: Capability = Capability::Available {
    own: sampler_linux::capture_own_thread,
    other: sampler_linux::capture_other_thread,
};

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
const CAPABILITY: Capability = Capability::Unavailable;

/// Writes the active call stack of `target` into `frames`, innermost first,
/// and returns how many entries were written. Never more than `frames.len()`.
///
/// Capturing the calling thread (or [`Thread::SELF`]) walks the stack
/// directly. Capturing another thread interrupts it; when that capture ends
/// in the bounded wait expiring, the target may still write into `frames` for
/// a short window after this returns, so a buffer whose contents matter
/// afterwards should not be reused immediately. When the target has already
/// exited, or on a platform without capture support, this returns 0. It never
/// returns an error.
pub fn capture_stack(target: Thread, frames: &mut [usize]) -> usize {
    let count = match CAPABILITY {
        Capability::Available { own, other } => {
            if target.is_current() {
                own(frames)
            } else {
                other(target, frames)
            }
        }
        Capability::Unavailable => 0,
    };
    debug_assert!(count <= frames.len());
    count
}

/// Captures, resolves and renders the call stack of `target`, one text line
/// per frame.
///
/// Diagnostic builds only: release builds return an empty vector, avoiding
/// both the runtime cost and leaking internal addresses into logs.
pub fn dump_stack(target: Thread) -> Vec<String> {
    if !cfg!(debug_assertions) {
        return Vec::new();
    }
    let mut addresses = [0usize; DUMP_FRAMES];
    let count = capture_stack(target, &mut addresses);
    let resolver = SymbolResolver::new();
    format_frames(&resolver.resolve_all(&addresses[..count]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_never_exceeds_capacity() {
        for capacity in &[0usize, 1, 2, 8, 64, 256] {
            let mut frames = vec![0usize; *capacity];
            let count = capture_stack(Thread::SELF, &mut frames);
            assert!(count <= *capacity);
        }
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_self_capture_returns_frames() {
        let mut frames = [0usize; 64];
        let count = capture_stack(current_thread(), &mut frames);
        assert!(count > 0);
        assert!(frames[..count].iter().all(|&address| address != 0));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_dump_stack_line_shape() {
        let lines = dump_stack(Thread::SELF);
        assert!(!lines.is_empty());
        assert!(lines.len() <= DUMP_FRAMES);
        for line in &lines {
            assert!(line.contains(" 0x"), "missing address column: {}", line);
        }
    }
}
