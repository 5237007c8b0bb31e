//! Signal-aware event loop supervising child processes.
//!
//! # Responsibilities
//! - Block the lifecycle signals and read them through a signalfd
//! - Supervise children: propagate SIGCONT, reap on SIGCHLD, decide exit
//! - Drive user fds through the same poller
//!
//! # Data Flow
//! ```text
//! EventLoop::new  → block SIGCHLD, SIGCONT, SIGHUP, SIGTERM, SIGQUIT, SIGINT
//!                 → signalfd registered as an input action
//! internal_loop   → drop privileges → verify mask → poll(wait_time())
//!                 → callbacks (user fds, handle_signal) → Exit(status)
//! ```

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;
use std::time::Duration;

use nix::sys::signal::{raise, Signal};
use thiserror::Error;

use crate::event::child::{ChildError, ChildProcess};
use crate::event::poller::{Action, Direction, Outcome, PollResult, Poller};
use crate::event::privilege::TemporarilyUnprivileged;
use crate::event::signal::{DeliveredSignal, SignalFd, SignalFdError, SignalMask};

/// Signals the loop takes over from asynchronous delivery.
pub const LOOP_SIGNALS: [Signal; 6] = [
    Signal::SIGCHLD,
    Signal::SIGCONT,
    Signal::SIGHUP,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGINT,
];

/// Internal-consistency failures. All of them are fatal to the supervisor.
#[derive(Debug, Error)]
pub enum EventLoopError {
    #[error("EventLoop: signal mask has been altered")]
    SignalMaskAltered,

    #[error("received SIGCHLD without any managed children")]
    ChildSignalWithoutChildren,

    #[error("EventLoop: unknown signal {0}")]
    UnknownSignal(i32),

    #[error(transparent)]
    Child(#[from] ChildError),

    #[error(transparent)]
    SignalFd(#[from] SignalFdError),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What a child's termination means for the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicy {
    /// Any termination of this child ends the loop.
    Ordinary,
    /// Exiting with exactly this status is expected; the loop carries on.
    Tolerated(i32),
}

impl ExitPolicy {
    pub fn tolerates(&self, status: i32) -> bool {
        matches!(self, ExitPolicy::Tolerated(s) if *s == status)
    }
}

#[derive(Debug)]
struct SupervisedChild {
    policy: ExitPolicy,
    process: ChildProcess,
}

/// State the signal handler works on.
struct Supervisor {
    signal_fd: SignalFd,
    children: Vec<SupervisedChild>,
}

impl Supervisor {
    fn handle_signal(&mut self, sig: &DeliveredSignal) -> Result<Outcome, EventLoopError> {
        let signal = sig
            .signal()
            .ok_or(EventLoopError::UnknownSignal(sig.signo))?;

        match signal {
            Signal::SIGCONT => {
                for child in &self.children {
                    child.process.resume()?;
                }
            }

            Signal::SIGCHLD => {
                if self.children.is_empty() {
                    return Err(EventLoopError::ChildSignalWithoutChildren);
                }

                // One SIGCHLD may stand for several children (or none of ours),
                // so search for whoever is waitable.
                for i in 0..self.children.len() {
                    let child = &mut self.children[i];
                    if child.process.terminated() || !child.process.waitable()? {
                        continue;
                    }

                    child.process.wait(true)?;

                    if child.process.terminated() {
                        let status = child.process.exit_status();
                        let policy = child.policy;
                        if status != 0 && !policy.tolerates(status) {
                            return Err(child.process.failure().into());
                        }

                        tracing::info!(
                            name = child.process.name(),
                            status,
                            "Child process exited"
                        );

                        if !policy.tolerates(status) {
                            return Ok(Outcome::Exit(status));
                        }
                    } else if !child.process.running() {
                        tracing::info!(name = child.process.name(), "Child stopped, suspending");
                        raise(Signal::SIGSTOP)?;
                    }
                }

                if self.children.iter().all(|c| c.process.terminated()) {
                    return Ok(Outcome::Exit(0));
                }
            }

            Signal::SIGHUP | Signal::SIGTERM | Signal::SIGQUIT | Signal::SIGINT => {
                tracing::info!(signal = %signal, "Exit signal received");
                return Ok(Outcome::Exit(0));
            }

            _ => return Err(EventLoopError::UnknownSignal(sig.signo)),
        }

        Ok(Outcome::Continue)
    }
}

/// Single-threaded loop multiplexing fds and signals.
///
/// Build on it by composition: register actions, then call
/// [`EventLoop::internal_loop`] with whatever timeout schedule is needed.
pub struct EventLoop {
    signals: SignalMask,
    poller: Poller<Supervisor, EventLoopError>,
    supervisor: Supervisor,
}

impl EventLoop {
    /// Block the loop signals on the calling thread and open the bridge.
    ///
    /// Threads started afterwards inherit the mask.
    pub fn new() -> Result<Self, EventLoopError> {
        let signals = SignalMask::new(&LOOP_SIGNALS);
        signals.set_as_mask()?;

        let signal_fd = SignalFd::new(&signals)?;
        let signal_raw = signal_fd.as_raw_fd();

        let mut poller: Poller<Supervisor, EventLoopError> = Poller::new();
        poller.add_action(Action::always(signal_raw, Direction::In, |sup: &mut Supervisor| {
            let delivered = sup.signal_fd.read_signal()?;
            sup.handle_signal(&delivered)
        }));

        Ok(Self {
            signals,
            poller,
            supervisor: Supervisor {
                signal_fd,
                children: Vec::new(),
            },
        })
    }

    /// Register a readable fd whose callback is always active.
    ///
    /// The fd must outlive the loop.
    pub fn add_simple_input_handler<C>(&mut self, fd: RawFd, mut callback: C)
    where
        C: FnMut() -> Result<Outcome, EventLoopError> + 'static,
    {
        self.poller
            .add_action(Action::always(fd, Direction::In, move |_| callback()));
    }

    /// Register a raw action with its own direction and interest predicate.
    pub fn add_action<C, I>(&mut self, fd: RawFd, direction: Direction, mut callback: C, interested: I)
    where
        C: FnMut() -> Result<Outcome, EventLoopError> + 'static,
        I: Fn() -> bool + 'static,
    {
        self.poller.add_action(Action::new(
            fd,
            direction,
            move |_| callback(),
            move |_| interested(),
        ));
    }

    /// Spawn a child whose termination ends the loop.
    pub fn add_child_process(
        &mut self,
        name: impl Into<String>,
        command: Command,
    ) -> Result<(), EventLoopError> {
        self.add_supervised(ExitPolicy::Ordinary, name, command)
    }

    /// Spawn a child that may exit with `continue_status` without ending the loop.
    pub fn add_special_child_process(
        &mut self,
        continue_status: i32,
        name: impl Into<String>,
        command: Command,
    ) -> Result<(), EventLoopError> {
        self.add_supervised(ExitPolicy::Tolerated(continue_status), name, command)
    }

    fn add_supervised(
        &mut self,
        policy: ExitPolicy,
        name: impl Into<String>,
        command: Command,
    ) -> Result<(), EventLoopError> {
        let process = ChildProcess::spawn(name, command)?;
        self.supervisor
            .children
            .push(SupervisedChild { policy, process });
        Ok(())
    }

    pub fn child_count(&self) -> usize {
        self.supervisor.children.len()
    }

    /// Run with no timeout.
    pub fn run(&mut self) -> Result<i32, EventLoopError> {
        self.internal_loop(|| None)
    }

    /// Run until something requests exit.
    ///
    /// `wait_time` is asked for the timeout before every wait.
    pub fn internal_loop<W>(&mut self, mut wait_time: W) -> Result<i32, EventLoopError>
    where
        W: FnMut() -> Option<Duration>,
    {
        loop {
            let _unprivileged = TemporarilyUnprivileged::new()?;

            if SignalMask::current()? != self.signals {
                return Err(EventLoopError::SignalMaskAltered);
            }

            let timeout = wait_time();
            if let PollResult::Exit(status) = self.poller.poll(&mut self.supervisor, timeout)? {
                return Ok(status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    // Signals are raised per thread and every test gets its own thread, so
    // these never interfere with each other.

    #[test]
    fn interrupt_exits_cleanly() {
        let mut event_loop = EventLoop::new().unwrap();
        raise(Signal::SIGINT).unwrap();
        assert_eq!(event_loop.run().unwrap(), 0);
    }

    #[test]
    fn terminate_exits_cleanly() {
        let mut event_loop = EventLoop::new().unwrap();
        raise(Signal::SIGTERM).unwrap();
        assert_eq!(event_loop.run().unwrap(), 0);
    }

    #[test]
    fn hangup_exits_cleanly() {
        let mut event_loop = EventLoop::new().unwrap();
        raise(Signal::SIGHUP).unwrap();
        assert_eq!(event_loop.run().unwrap(), 0);
    }

    #[test]
    fn quit_exits_cleanly() {
        let mut event_loop = EventLoop::new().unwrap();
        raise(Signal::SIGQUIT).unwrap();
        assert_eq!(event_loop.run().unwrap(), 0);
    }

    #[test]
    fn sigchld_without_children_is_fatal() {
        let mut event_loop = EventLoop::new().unwrap();
        raise(Signal::SIGCHLD).unwrap();
        assert!(matches!(
            event_loop.run(),
            Err(EventLoopError::ChildSignalWithoutChildren)
        ));
    }

    #[test]
    fn altered_mask_is_detected() {
        let mut event_loop = EventLoop::new().unwrap();

        let mut unblock = SigSet::empty();
        unblock.add(Signal::SIGHUP);
        sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&unblock), None).unwrap();

        assert!(matches!(
            event_loop.run(),
            Err(EventLoopError::SignalMaskAltered)
        ));
    }

    #[test]
    fn input_handler_exit_status_propagates() {
        let mut event_loop = EventLoop::new().unwrap();
        let (reader, mut writer) = UnixStream::pair().unwrap();
        writer.write_all(b"q").unwrap();

        let fd = reader.as_raw_fd();
        let mut reader = reader;
        event_loop.add_simple_input_handler(fd, move || {
            let mut buf = [0u8; 1];
            reader.read_exact(&mut buf)?;
            Ok(Outcome::Exit(7))
        });

        assert_eq!(event_loop.run().unwrap(), 7);
    }

    #[test]
    fn wait_time_is_recomputed_each_cycle() {
        let mut event_loop = EventLoop::new().unwrap();
        let (reader, writer) = UnixStream::pair().unwrap();

        let fd = reader.as_raw_fd();
        let mut reader = reader;
        event_loop.add_simple_input_handler(fd, move || {
            let mut buf = [0u8; 1];
            reader.read_exact(&mut buf)?;
            Ok(Outcome::Exit(i32::from(buf[0])))
        });

        // Time out a few times, then wake the handler with the cycle count.
        let cycles = Rc::new(Cell::new(0u8));
        let seen = Rc::clone(&cycles);
        let mut writer = writer;
        let status = event_loop
            .internal_loop(move || {
                seen.set(seen.get() + 1);
                if seen.get() == 3 {
                    writer.write_all(&[seen.get()]).unwrap();
                }
                Some(Duration::from_millis(5))
            })
            .unwrap();

        assert_eq!(status, 3);
        assert_eq!(cycles.get(), 3);
    }

    #[test]
    fn tolerated_policy_matches_exact_status() {
        assert!(ExitPolicy::Tolerated(3).tolerates(3));
        assert!(!ExitPolicy::Tolerated(3).tolerates(0));
        assert!(!ExitPolicy::Ordinary.tolerates(0));
        assert!(!ExitPolicy::Ordinary.tolerates(-1));
    }
}
