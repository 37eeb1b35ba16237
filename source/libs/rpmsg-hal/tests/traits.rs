// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trait-object usage of the rpmsg hardware seams
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 2 integration tests
//!
//! TEST_SCENARIOS:
//!   - lock_is_usable_as_trait_object(): HwLock behind Arc<dyn _>
//!   - shared_mem_reports_len(): default is_empty() derives from len()

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rpmsg_hal::{HwLock, OutOfBounds, SharedMem};

struct FlagLock(AtomicBool);

impl HwLock for FlagLock {
    fn lock(&self) {
        while !self.try_lock() {
            std::hint::spin_loop();
        }
    }

    fn try_lock(&self) -> bool {
        self.0.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok()
    }

    fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ZeroMem;

impl SharedMem for ZeroMem {
    fn len(&self) -> usize {
        0
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds> {
        rpmsg_hal::check_bounds(0, offset, dst.len())
    }

    fn write(&self, offset: usize, src: &[u8]) -> Result<(), OutOfBounds> {
        rpmsg_hal::check_bounds(0, offset, src.len())
    }
}

#[test]
fn lock_is_usable_as_trait_object() {
    let lock: Arc<dyn HwLock> = Arc::new(FlagLock(AtomicBool::new(false)));
    lock.lock();
    assert!(!lock.try_lock());
    lock.unlock();
    assert!(lock.try_lock());
}

#[test]
fn shared_mem_reports_len() {
    let mem = ZeroMem;
    assert!(mem.is_empty());
    assert!(mem.read_word(0).is_err());
}
