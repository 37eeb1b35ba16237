// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Spin-based stand-in for the SoC hardware spinlock block.
//!
//! Real hardware exposes a register per lock that reads 0 when the caller
//! acquired it. Hosts and tests use [`HwSpinLock`], which gives the same
//! acquire/release contract through an atomic flag.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

use core::sync::atomic::{AtomicBool, Ordering};

use rpmsg_hal::HwLock;

/// A hardware-spinlock emulation shared by both sides of a link.
#[derive(Debug, Default)]
pub struct HwSpinLock {
    held: AtomicBool,
}

impl HwSpinLock {
    /// Creates an unlocked instance.
    pub const fn new() -> Self {
        Self { held: AtomicBool::new(false) }
    }

    /// Acquires the lock, returning a guard that releases it on drop.
    pub fn guard(&self) -> HwSpinLockGuard<'_> {
        self.acquire();
        HwSpinLockGuard { lock: self }
    }

    /// Returns true while some side holds the lock.
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    fn acquire(&self) {
        while self
            .held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

impl HwLock for HwSpinLock {
    fn lock(&self) {
        self.acquire();
    }

    fn try_lock(&self) -> bool {
        self.held.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok()
    }

    fn unlock(&self) {
        self.release();
    }
}

/// RAII guard returned by [`HwSpinLock::guard`].
pub struct HwSpinLockGuard<'a> {
    lock: &'a HwSpinLock,
}

impl Drop for HwSpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
