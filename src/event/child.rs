//! Supervised child processes.
//!
//! # Responsibilities
//! - Spawn a command with a clean signal mask
//! - Track running / stopped / terminated state through `waitid(2)`
//! - Reap and hang up on drop if still alive

use std::fmt;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::errno::Errno;
use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use thiserror::Error;

/// Errors from child process management.
#[derive(Debug, Error)]
pub enum ChildError {
    #[error("failed to spawn {name}: {source}")]
    Spawn { name: String, source: io::Error },

    #[error("waitid on {name} failed: {source}")]
    Wait { name: String, source: Errno },

    #[error("{name}: no state change available")]
    NoStateChange { name: String },

    #[error("failed to signal {name}: {source}")]
    Signal { name: String, source: Errno },

    #[error("{name} {exit}")]
    Failed { name: String, exit: ChildExit },
}

/// How a terminated child finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Status(i32),
    Signal(i32),
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildExit::Status(code) => write!(f, "exited with failure status {}", code),
            ChildExit::Signal(sig) => write!(f, "died on signal {}", sig),
        }
    }
}

/// A child process owned by the supervisor.
#[derive(Debug)]
pub struct ChildProcess {
    name: String,
    pid: Pid,
    running: bool,
    terminated: bool,
    exit_status: i32,
    died_on_signal: bool,
}

impl ChildProcess {
    /// Spawn `command`. The child starts with nothing blocked.
    pub fn spawn(name: impl Into<String>, mut command: Command) -> Result<Self, ChildError> {
        let name = name.into();

        // SAFETY: sigprocmask is async-signal-safe and touches no shared state.
        unsafe {
            command.pre_exec(|| {
                sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
                    .map_err(io::Error::from)
            });
        }

        let child = command.spawn().map_err(|source| ChildError::Spawn {
            name: name.clone(),
            source,
        })?;

        let pid = Pid::from_raw(child.id() as i32);
        tracing::debug!(name = %name, pid = %pid, "Child process started");

        Ok(Self {
            name,
            pid,
            running: true,
            terminated: false,
            exit_status: 0,
            died_on_signal: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Exit code, or the signal number if the child died on a signal.
    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    pub fn died_on_signal(&self) -> bool {
        self.died_on_signal
    }

    /// Whether a state change is waiting to be collected. Does not consume it.
    pub fn waitable(&self) -> Result<bool, ChildError> {
        let flags = WaitPidFlag::WEXITED
            | WaitPidFlag::WSTOPPED
            | WaitPidFlag::WCONTINUED
            | WaitPidFlag::WNOHANG
            | WaitPidFlag::WNOWAIT;

        match waitid(Id::Pid(self.pid), flags) {
            Ok(WaitStatus::StillAlive) => Ok(false),
            Ok(_) => Ok(true),
            Err(source) => Err(ChildError::Wait {
                name: self.name.clone(),
                source,
            }),
        }
    }

    /// Collect one state change.
    ///
    /// With `nonblocking`, the change must already be available.
    pub fn wait(&mut self, nonblocking: bool) -> Result<(), ChildError> {
        let mut flags = WaitPidFlag::WEXITED | WaitPidFlag::WSTOPPED | WaitPidFlag::WCONTINUED;
        if nonblocking {
            flags |= WaitPidFlag::WNOHANG;
        }

        let status = waitid(Id::Pid(self.pid), flags).map_err(|source| ChildError::Wait {
            name: self.name.clone(),
            source,
        })?;

        match status {
            WaitStatus::Exited(_, code) => {
                self.terminated = true;
                self.running = false;
                self.exit_status = code;
            }
            WaitStatus::Signaled(_, signal, _) => {
                self.terminated = true;
                self.running = false;
                self.died_on_signal = true;
                self.exit_status = signal as i32;
            }
            WaitStatus::Stopped(_, _) => self.running = false,
            WaitStatus::Continued(_) => self.running = true,
            WaitStatus::StillAlive => {
                return Err(ChildError::NoStateChange {
                    name: self.name.clone(),
                })
            }
            #[allow(unreachable_patterns)]
            other => {
                tracing::debug!(name = %self.name, status = ?other, "Ignoring child state");
            }
        }

        Ok(())
    }

    pub fn signal(&self, signal: Signal) -> Result<(), ChildError> {
        kill(self.pid, signal).map_err(|source| ChildError::Signal {
            name: self.name.clone(),
            source,
        })
    }

    /// Send SIGCONT unless the child is already gone.
    pub fn resume(&self) -> Result<(), ChildError> {
        if self.terminated {
            return Ok(());
        }
        self.signal(Signal::SIGCONT)
    }

    /// Describe how this terminated child failed.
    pub fn failure(&self) -> ChildError {
        let exit = if self.died_on_signal {
            ChildExit::Signal(self.exit_status)
        } else {
            ChildExit::Status(self.exit_status)
        };
        ChildError::Failed {
            name: self.name.clone(),
            exit,
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        while !self.terminated {
            if let Err(e) = self.resume().and_then(|_| self.signal(Signal::SIGHUP)) {
                tracing::warn!(name = %self.name, error = %e, "Failed to hang up child");
                return;
            }
            if let Err(e) = self.wait(false) {
                tracing::warn!(name = %self.name, error = %e, "Failed to reap child");
                return;
            }
        }
    }
}
