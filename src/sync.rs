use core::{
    future::{poll_fn, Future},
    task::Poll,
};

use portable_atomic::{AtomicBool, AtomicU8, Ordering};

use atomic_waker::AtomicWaker;

use crate::RestartOutcome;

/// A synchronization primitive, which coalesces any number of raised requests into one pending
/// request, that can be awaited.
pub struct WorkSignal {
    waker: AtomicWaker,
    pending: AtomicBool,
}
impl WorkSignal {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            pending: AtomicBool::new(false),
        }
    }
    /// Mark work as pending and wake the waiting task.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
        self.waker.wake();
    }
    /// Consume the pending request, returning whether there was one.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
    /// Asynchronously wait for work to become pending.
    pub async fn wait(&self) {
        poll_fn(|cx| {
            if self.take() {
                Poll::Ready(())
            } else {
                self.waker.register(cx.waker());
                // A request may have been raised between the check and the registration.
                if self.take() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        })
        .await
    }
}
impl Default for WorkSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the guard of a pending restart.
///
/// Exactly one of the completion and the timeout wins the race for an armed guard.
pub struct RestartSignal {
    state: AtomicU8,
    waker: AtomicWaker,
}
impl RestartSignal {
    const IDLE: u8 = 0;
    const ARMED: u8 = 1;
    const COMPLETED: u8 = 2;
    const TIMED_OUT: u8 = 3;
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::IDLE),
            waker: AtomicWaker::new(),
        }
    }
    pub fn arm(&self) {
        self.state.store(Self::ARMED, Ordering::Release);
    }
    pub fn reset(&self) {
        self.state.store(Self::IDLE, Ordering::Release);
    }
    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) == Self::ARMED
    }
    /// Check if there is neither an armed guard nor an unconsumed outcome.
    pub fn is_idle(&self) -> bool {
        self.state.load(Ordering::Acquire) == Self::IDLE
    }
    /// Settle an armed guard with the specified outcome.
    ///
    /// Returns `false`, if the guard wasn't armed, i.e. the other side already settled it.
    pub fn finish(&self, outcome: RestartOutcome) -> bool {
        let new = match outcome {
            RestartOutcome::Completed => Self::COMPLETED,
            RestartOutcome::TimedOut => Self::TIMED_OUT,
        };
        let won = self
            .state
            .compare_exchange(Self::ARMED, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.waker.wake();
        }
        won
    }
    /// Wait for the guard to be settled and consume the outcome.
    pub fn wait(&self) -> impl Future<Output = RestartOutcome> + use<'_> {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            match self.state.load(Ordering::Acquire) {
                Self::COMPLETED => {
                    self.reset();
                    Poll::Ready(RestartOutcome::Completed)
                }
                Self::TIMED_OUT => {
                    self.reset();
                    Poll::Ready(RestartOutcome::TimedOut)
                }
                _ => Poll::Pending,
            }
        })
    }
}
impl Default for RestartSignal {
    fn default() -> Self {
        Self::new()
    }
}
