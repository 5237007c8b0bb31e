//! Blocked signal sets and the signalfd bridge.
//!
//! Signals in a [`SignalMask`] are blocked from asynchronous delivery and read
//! back through a [`SignalFd`], which turns delivery into an ordinary readable
//! fd for the poller.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use thiserror::Error;

/// Errors reading from the signal bridge.
#[derive(Debug, Error)]
pub enum SignalFdError {
    #[error("signalfd read size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("signalfd I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A fixed set of signals.
#[derive(Debug, Clone, Copy)]
pub struct SignalMask {
    set: SigSet,
}

impl SignalMask {
    /// Build a mask containing exactly `signals`.
    pub fn new(signals: &[Signal]) -> Self {
        let mut set = SigSet::empty();
        for &signal in signals {
            set.add(signal);
        }
        Self { set }
    }

    /// The calling thread's current mask.
    pub fn current() -> nix::Result<Self> {
        let mut set = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, None, Some(&mut set))?;
        Ok(Self { set })
    }

    /// Block exactly these signals (replaces whatever was blocked before).
    pub fn set_as_mask(&self) -> nix::Result<()> {
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.set), None)
    }

    pub fn contains(&self, signal: Signal) -> bool {
        self.set.contains(signal)
    }

    pub fn as_sigset(&self) -> &SigSet {
        &self.set
    }
}

/// Compares membership signal by signal; raw `sigset_t` bytes are not
/// comparable.
impl PartialEq for SignalMask {
    fn eq(&self, other: &Self) -> bool {
        Signal::iterator().all(|signal| self.set.contains(signal) == other.set.contains(signal))
    }
}

impl Eq for SignalMask {}

/// One delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveredSignal {
    pub signo: i32,
    pub code: i32,
    pub pid: u32,
    pub uid: u32,
    pub status: i32,
}

impl DeliveredSignal {
    /// The signal as a typed value, if it is a known signal number.
    pub fn signal(&self) -> Option<Signal> {
        Signal::try_from(self.signo).ok()
    }
}

const SIGINFO_SIZE: usize = std::mem::size_of::<libc::signalfd_siginfo>();

/// Readable handle yielding one [`DeliveredSignal`] per read.
#[derive(Debug)]
pub struct SignalFd {
    file: File,
}

impl SignalFd {
    /// Create a signalfd for `mask`. The signals must already be blocked.
    pub fn new(mask: &SignalMask) -> io::Result<Self> {
        let sigset: &libc::sigset_t = mask.as_sigset().as_ref();

        // SAFETY: `sigset` points to a valid sigset_t for the duration of the call.
        let fd = unsafe { libc::signalfd(-1, sigset, libc::SFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: signalfd just returned this descriptor and nothing else owns it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            file: File::from(owned),
        })
    }

    /// Read exactly one delivered signal.
    pub fn read_signal(&mut self) -> Result<DeliveredSignal, SignalFdError> {
        let mut buf = [0u8; SIGINFO_SIZE];
        let n = self.file.read(&mut buf)?;
        if n != SIGINFO_SIZE {
            return Err(SignalFdError::SizeMismatch {
                expected: SIGINFO_SIZE,
                actual: n,
            });
        }

        // SAFETY: the buffer holds a full signalfd_siginfo written by the kernel.
        let info: libc::signalfd_siginfo =
            unsafe { std::ptr::read_unaligned(buf.as_ptr().cast()) };

        Ok(DeliveredSignal {
            signo: info.ssi_signo as i32,
            code: info.ssi_code,
            pid: info.ssi_pid,
            uid: info.ssi_uid,
            status: info.ssi_status,
        })
    }
}

impl AsRawFd for SignalFd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
