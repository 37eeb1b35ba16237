// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Bounded, cancellable waits for the handshake and blocking RPC.
//!
//! Nothing in the transport blocks without a budget. Waits go through a
//! [`Clock`] so tests can drive time deterministically with [`ManualClock`].
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal (crate public, but intended for in-tree use)
//! TEST_COVERAGE: Unit tests (host)

use core::time::Duration;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Clock source used for bounded loops.
pub trait Clock: Send + Sync {
    /// Monotonic time in nanoseconds.
    fn now_ns(&self) -> u64;
    /// Sleeps (or pretends to) for `dur`.
    fn sleep(&self, dur: Duration);
}

/// Clock backed by `std::time::Instant`.
pub struct HostClock {
    start: Instant,
}

impl HostClock {
    /// Creates a new host clock.
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// Clock that only moves when slept on or advanced explicitly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
    sleeps: AtomicU64,
}

impl ManualClock {
    /// Creates a clock at t=0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward.
    pub fn advance(&self, dur: Duration) {
        let ns = u64::try_from(dur.as_nanos()).unwrap_or(u64::MAX);
        self.now.fetch_add(ns, Ordering::SeqCst);
    }

    /// Number of `sleep` calls observed.
    pub fn sleeps(&self) -> u64 {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, dur: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        self.advance(dur);
    }
}

/// Shared shutdown signal.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every wait holding a clone of this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once [`CancelToken::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of [`poll_bounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The probe returned true.
    Ready,
    /// Every attempt was spent.
    Exhausted,
    /// The token fired first.
    Cancelled,
}

/// Calls `probe` up to `attempts + 1` times, sleeping `interval` in between.
pub fn poll_bounded(
    clock: &dyn Clock,
    cancel: &CancelToken,
    attempts: u32,
    interval: Duration,
    mut probe: impl FnMut() -> bool,
) -> PollOutcome {
    let mut left = attempts;
    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        if probe() {
            return PollOutcome::Ready;
        }
        if left == 0 {
            return PollOutcome::Exhausted;
        }
        left -= 1;
        clock.sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_stops_after_budget() {
        let clock = ManualClock::new();
        let out = poll_bounded(&clock, &CancelToken::new(), 3, Duration::from_millis(1), || false);
        assert_eq!(out, PollOutcome::Exhausted);
        assert_eq!(clock.sleeps(), 3);
        assert_eq!(clock.now_ns(), 3_000_000);
    }

    #[test]
    fn poll_reports_ready_probe() {
        let clock = ManualClock::new();
        let mut n = 0;
        let out = poll_bounded(&clock, &CancelToken::new(), 10, Duration::from_millis(1), || {
            n += 1;
            n == 4
        });
        assert_eq!(out, PollOutcome::Ready);
        assert_eq!(clock.sleeps(), 3);
    }

    #[test]
    fn cancellation_wins_over_probe() {
        let token = CancelToken::new();
        token.cancel();
        let out = poll_bounded(&ManualClock::new(), &token, 10, Duration::from_millis(1), || true);
        assert_eq!(out, PollOutcome::Cancelled);
    }
}
