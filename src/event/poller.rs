//! Readiness multiplexer over `poll(2)`.
//!
//! # Responsibilities
//! - Hold a list of actions (fd + direction + callback + interest predicate)
//! - Wait until at least one interested fd is ready, then run its callback
//! - Report `Exit` once nothing is interested any more
//!
//! # Design Decisions
//! - Callbacks receive the shared state by `&mut` at poll time; actions never
//!   capture references to each other
//! - Callbacks run to completion in registration order

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Direction of interest for an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn events(self) -> libc::c_short {
        match self {
            Direction::In => libc::POLLIN,
            Direction::Out => libc::POLLOUT,
        }
    }
}

/// What a callback wants the poller to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep polling.
    Continue,
    /// Stop polling and report this exit status.
    Exit(i32),
    /// Deactivate this action for good.
    Cancel,
}

/// Result of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// At least one callback ran.
    Success,
    /// The timeout expired with nothing ready.
    Timeout,
    /// A callback requested exit, an fd failed, or nothing is interested.
    Exit(i32),
}

type Callback<S, E> = Box<dyn FnMut(&mut S) -> Result<Outcome, E>>;
type Interest<S> = Box<dyn Fn(&S) -> bool>;

/// A registered interest in one fd.
pub struct Action<S, E> {
    fd: RawFd,
    direction: Direction,
    callback: Callback<S, E>,
    interested: Interest<S>,
    active: bool,
}

impl<S, E> Action<S, E> {
    /// Create an action that is interested whenever `interested` returns true.
    ///
    /// The fd must stay open for as long as the action is registered.
    pub fn new<C, I>(fd: RawFd, direction: Direction, callback: C, interested: I) -> Self
    where
        C: FnMut(&mut S) -> Result<Outcome, E> + 'static,
        I: Fn(&S) -> bool + 'static,
    {
        Self {
            fd,
            direction,
            callback: Box::new(callback),
            interested: Box::new(interested),
            active: true,
        }
    }

    /// Create an action that is always interested.
    pub fn always<C>(fd: RawFd, direction: Direction, callback: C) -> Self
    where
        C: FnMut(&mut S) -> Result<Outcome, E> + 'static,
    {
        Self::new(fd, direction, callback, |_| true)
    }

    fn wants(&self, state: &S) -> bool {
        self.active && (self.interested)(state)
    }
}

/// Multiplexer owning a set of actions over shared state `S`.
pub struct Poller<S, E> {
    actions: Vec<Action<S, E>>,
}

impl<S, E> Default for Poller<S, E> {
    fn default() -> Self {
        Self { actions: Vec::new() }
    }
}

impl<S, E> Poller<S, E>
where
    E: From<io::Error>,
{
    pub fn new() -> Self {
        Self { actions: Vec::new() }
    }

    pub fn add_action(&mut self, action: Action<S, E>) {
        self.actions.push(action);
    }

    /// Number of registered actions (active or not).
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run one wait cycle.
    ///
    /// `None` blocks until something is ready.
    pub fn poll(&mut self, state: &mut S, timeout: Option<Duration>) -> Result<PollResult, E> {
        // Uninterested actions get fd -1 so the kernel skips them entirely.
        let mut pollfds: Vec<libc::pollfd> = self
            .actions
            .iter()
            .map(|action| {
                if action.wants(state) {
                    libc::pollfd {
                        fd: action.fd,
                        events: action.direction.events(),
                        revents: 0,
                    }
                } else {
                    libc::pollfd {
                        fd: -1,
                        events: 0,
                        revents: 0,
                    }
                }
            })
            .collect();

        if pollfds.iter().all(|p| p.events == 0) {
            return Ok(PollResult::Exit(0));
        }

        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
        };

        // SAFETY: `pollfds` is a live, correctly sized buffer of pollfd structs.
        let ready = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(PollResult::Success);
            }
            return Err(err.into());
        }

        if ready == 0 {
            return Ok(PollResult::Timeout);
        }

        for (action, pollfd) in self.actions.iter_mut().zip(pollfds.iter()) {
            if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                tracing::trace!(fd = pollfd.fd, revents = pollfd.revents, "fd error or hangup");
                return Ok(PollResult::Exit(0));
            }

            // Only call back when the event we asked for is present.
            if pollfd.revents & pollfd.events == 0 {
                continue;
            }

            match (action.callback)(state)? {
                Outcome::Continue => {}
                Outcome::Exit(status) => return Ok(PollResult::Exit(status)),
                Outcome::Cancel => action.active = false,
            }
        }

        Ok(PollResult::Success)
    }
}
