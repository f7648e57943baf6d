// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Timeouts, behaviour flags and the shared sleep primitive for blocking IPC calls
//! OWNERS: @kernel-team
//! PUBLIC API: Wait, IpcFlags, Interrupter
//! INVARIANTS: A failed sleep never changes the state protected by the caller's lock

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, MutexGuard};

use crate::status::{Result, Status};

/// Behaviour of a blocking call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation completes.
    Blocking,
    /// Return [`Status::WouldBlock`] if no progress can be made.
    NonBlocking,
    /// Block until the operation completes or the timeout expires.
    Timeout(Duration),
}

impl Wait {
    /// Maps the syscall convention: negative blocks forever, zero polls, positive is relative.
    pub fn from_nanos(nanos: i64) -> Self {
        match nanos {
            n if n < 0 => Self::Blocking,
            0 => Self::NonBlocking,
            n => Self::Timeout(Duration::from_nanos(n as u64)),
        }
    }

    /// Returns `true` when the caller requested a non-blocking attempt.
    pub const fn is_non_blocking(self) -> bool {
        matches!(self, Self::NonBlocking)
    }

    /// Converts a [`Wait::Timeout`] variant into its [`Duration`].
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Timeout(duration) => Some(duration),
            Self::Blocking | Self::NonBlocking => None,
        }
    }

    fn deadline(self) -> Deadline {
        match self {
            Self::Blocking => Deadline::Never,
            Self::NonBlocking => Deadline::Now,
            Self::Timeout(d) if d.is_zero() => Deadline::Now,
            Self::Timeout(d) => Instant::now().checked_add(d).map_or(Deadline::Never, Deadline::At),
        }
    }
}

bitflags! {
    /// Per-call behaviour flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct IpcFlags: u32 {
        /// The call may be interrupted.
        const INTERRUPTIBLE = 1 << 0;
        /// Ignore the queue size limit when sending.
        const FORCE = 1 << 1;
        /// Keep the sender's handle when transferring it.
        const COPY_HANDLE = 1 << 2;
    }
}

/// Delivers interrupts to one thread. Clones share the same pending flag.
#[derive(Clone, Debug, Default)]
pub struct Interrupter {
    pending: Arc<AtomicBool>,
}

impl Interrupter {
    /// Marks an interrupt pending. The next interruptible sleep observes and consumes it.
    pub fn interrupt(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Returns whether an interrupt is waiting to be consumed.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

#[derive(Clone, Copy, Debug)]
enum Deadline {
    Never,
    Now,
    At(Instant),
}

/// One blocking call's sleep policy.
///
/// Callers loop `while !ready { sleeper.sleep(&cv, &mut guard)?; }`. A sleep returns `Ok` on any
/// wakeup (including spurious ones and tick expiry) so the condition is always re-evaluated under
/// the lock; it fails only before sleeping, so state is never modified by a failed wait.
pub(crate) struct Sleeper<'a> {
    deadline: Deadline,
    interrupter: Option<&'a Interrupter>,
    tick: Duration,
}

impl<'a> Sleeper<'a> {
    pub(crate) fn new(wait: Wait, flags: IpcFlags, interrupter: &'a Interrupter, tick: Duration) -> Self {
        let interrupter = flags.contains(IpcFlags::INTERRUPTIBLE).then_some(interrupter);
        Self { deadline: wait.deadline(), interrupter, tick }
    }

    pub(crate) fn sleep<T>(&self, cv: &Condvar, guard: &mut MutexGuard<'_, T>) -> Result<()> {
        if self.interrupter.is_some_and(Interrupter::take) {
            return Err(Status::Interrupted);
        }
        let now = Instant::now();
        let tick_end = now.checked_add(self.tick).unwrap_or(now);
        let wake_at = match self.deadline {
            Deadline::Now => return Err(Status::WouldBlock),
            Deadline::Never => tick_end,
            Deadline::At(at) if now >= at => return Err(Status::TimedOut),
            Deadline::At(at) => at.min(tick_end),
        };
        cv.wait_until(guard, wake_at);
        Ok(())
    }
}
