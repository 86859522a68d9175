//! Self-pipe plumbing for waking the manager's wait loop from a signal
//! handler or another thread.
//!
//! A signal handler may only call a short, documented list of
//! async-signal-safe functions; the canonical way to get a signal's
//! occurrence onto an event loop is the "self-pipe trick": the handler does
//! nothing but `write()` one byte to a pipe the loop also watches. Here that
//! registration goes through `signal-hook`'s low-level API rather than a
//! hand-rolled `sigaction`, so the async-signal-safety audit of the
//! registration mechanism itself is someone else's crate to maintain.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};

/// The reason the loop was woken via the self-pipe, recovered from the byte
/// written into it.
///
/// The original C implementation reused a signed `int8_t` pipe byte,
/// writing the real signal number for a `signal` wake and the sentinel `-2`
/// for a generic (non-signal) wake from `tube_manager_stop`. A `u8` pipe
/// can't carry `-2` directly; real signal numbers on Linux top out well
/// under 64, so the high end of the `u8` range is free for sentinels
/// instead of trying to smuggle a negative number through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Signal(i32),
    /// Generic wake requested via `TubeManager::interrupt`, not tied to any
    /// signal (the original's `-2` sentinel).
    Interrupt,
    /// `TubeManager::stop` was called.
    Stop,
}

const SENTINEL_INTERRUPT: u8 = 0xFE;
const SENTINEL_STOP: u8 = 0xFF;

impl WakeReason {
    fn to_byte(self) -> u8 {
        match self {
            WakeReason::Signal(sig) => {
                debug_assert!((0..SENTINEL_INTERRUPT as i32).contains(&sig));
                sig as u8
            }
            WakeReason::Interrupt => SENTINEL_INTERRUPT,
            WakeReason::Stop => SENTINEL_STOP,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            SENTINEL_STOP => WakeReason::Stop,
            SENTINEL_INTERRUPT => WakeReason::Interrupt,
            sig => WakeReason::Signal(sig as i32),
        }
    }
}

/// The read/write ends of a self-pipe, the write end shared with whatever
/// signal handlers get registered against it.
pub struct SelfPipe {
    read_fd: OwnedFd,
    write_fd: RawFd,
}

impl SelfPipe {
    pub fn new() -> Result<Self> {
        let mut fds = [0i32; 2];
        // SAFETY: `fds` is a valid two-element buffer for pipe2(2).
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let read_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        Ok(Self {
            read_fd,
            write_fd: fds[1],
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// The write end shared with signal-handler registrations, used to key
    /// this manager's entries in the process-global registry.
    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Write a wake reason into the pipe. Safe to call from a signal
    /// handler: this is a single `write()` of one byte, nothing else.
    pub fn wake(&self, reason: WakeReason) {
        let byte = reason.to_byte();
        unsafe {
            libc::write(self.write_fd, std::ptr::addr_of!(byte) as *const libc::c_void, 1);
        }
    }

    /// Drain every pending byte from the pipe, returning the wake reasons in
    /// the order they were written.
    pub fn drain(&self) -> Vec<WakeReason> {
        let mut reasons = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            reasons.extend(buf[..n as usize].iter().map(|&b| WakeReason::from_byte(b)));
        }
        reasons
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.write_fd);
        }
    }
}

/// One registered signal handler: the signal number, the pipe it wakes, and
/// the user callback the loop thread runs once it observes the wake,
/// matching the original's process-global "(signal, manager, callback)"
/// triples.
struct Registration {
    signal: i32,
    write_fd: RawFd,
    callback: Box<dyn FnMut() + Send>,
}

/// Process-global registry of (signal, pipe, callback) triples, needed
/// because POSIX signal delivery itself is process-wide; a manager's
/// `signal()` call adds an entry here rather than trying to own the signal
/// disposition outright.
static REGISTRY: std::sync::OnceLock<std::sync::Mutex<Vec<Registration>>> =
    std::sync::OnceLock::new();

fn registry() -> &'static std::sync::Mutex<Vec<Registration>> {
    REGISTRY.get_or_init(|| std::sync::Mutex::new(Vec::new()))
}

/// Counts deliveries for diagnostics; not required for correctness.
static DELIVERY_COUNT: AtomicI32 = AtomicI32::new(0);

/// Register `signal` so that when it's delivered, `pipe` is woken with
/// `WakeReason::Signal(signal)` and, once the loop thread drains that wake,
/// `callback` is run there — never inside the OS signal handler itself.
///
/// # Safety note
///
/// The registered closure runs as a signal handler: it must only perform
/// async-signal-safe operations. It writes one byte to the pipe's raw fd
/// and nothing else, matching that constraint. `callback` is ordinary Rust
/// code and only ever runs from [`dispatch`], called from the loop thread.
pub fn register(
    signal: i32,
    pipe: &SelfPipe,
    callback: impl FnMut() + Send + 'static,
) -> Result<signal_hook::SigId> {
    {
        let mut guard = registry().lock().expect("signal registry lock poisoned");
        guard.push(Registration {
            signal,
            write_fd: pipe.write_fd,
            callback: Box::new(callback),
        });
    }

    let write_fd = pipe.write_fd;
    // SAFETY: the registered action only calls `write()`, which is on
    // POSIX's async-signal-safe function list.
    unsafe {
        signal_hook::low_level::register(signal, move || {
            DELIVERY_COUNT.fetch_add(1, Ordering::Relaxed);
            let byte = signal as u8;
            libc::write(write_fd, std::ptr::addr_of!(byte) as *const libc::c_void, 1);
        })
        .map_err(Error::Io)
    }
}

pub fn unregister(id: signal_hook::SigId) {
    signal_hook::low_level::unregister(id);
}

/// Invoke every callback registered for `signal` on `write_fd`'s pipe,
/// called from the loop thread once it observes that signal's wake byte.
/// Matches step (d) of the wait loop: "invoke that signal's user callback
/// synchronously from the loop thread."
pub fn dispatch(signal: i32, write_fd: RawFd) {
    let mut guard = registry().lock().expect("signal registry lock poisoned");
    for registration in guard.iter_mut() {
        if registration.signal == signal && registration.write_fd == write_fd {
            (registration.callback)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_reason_byte_round_trip() {
        assert_eq!(WakeReason::from_byte(WakeReason::Stop.to_byte()), WakeReason::Stop);
        assert_eq!(
            WakeReason::from_byte(WakeReason::Interrupt.to_byte()),
            WakeReason::Interrupt
        );
        assert_eq!(
            WakeReason::from_byte(WakeReason::Signal(2).to_byte()),
            WakeReason::Signal(2)
        );
    }

    #[test]
    fn pipe_delivers_generic_interrupt() {
        let pipe = SelfPipe::new().unwrap();
        pipe.wake(WakeReason::Interrupt);
        let reasons = pipe.drain();
        assert_eq!(reasons, vec![WakeReason::Interrupt]);
    }

    #[test]
    fn pipe_drains_multiple_wakes_in_order() {
        let pipe = SelfPipe::new().unwrap();
        pipe.wake(WakeReason::Signal(2));
        pipe.wake(WakeReason::Stop);
        assert_eq!(pipe.drain(), vec![WakeReason::Signal(2), WakeReason::Stop]);
    }

    /// `dispatch` must invoke the callback registered for a given
    /// (signal, pipe) pair, and must not invoke it for a different pipe
    /// registered against the same signal number.
    #[test]
    fn dispatch_invokes_only_the_matching_registration() {
        let pipe_a = SelfPipe::new().unwrap();
        let pipe_b = SelfPipe::new().unwrap();

        let calls_a = std::sync::Arc::new(AtomicI32::new(0));
        let counted_a = std::sync::Arc::clone(&calls_a);
        let id_a = register(libc::SIGUSR1, &pipe_a, move || {
            counted_a.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let calls_b = std::sync::Arc::new(AtomicI32::new(0));
        let counted_b = std::sync::Arc::clone(&calls_b);
        let id_b = register(libc::SIGUSR1, &pipe_b, move || {
            counted_b.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        dispatch(libc::SIGUSR1, pipe_a.write_fd());
        assert_eq!(calls_a.load(Ordering::SeqCst), 1);
        assert_eq!(calls_b.load(Ordering::SeqCst), 0);

        unregister(id_a);
        unregister(id_b);
    }
}
