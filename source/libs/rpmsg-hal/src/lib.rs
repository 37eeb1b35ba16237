// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware seams consumed by the rpmsg transport
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/traits.rs
//!
//! Three narrow traits separate the transport from the platform: a 32-bit
//! register window used for interrupt trigger/status/enable registers, a
//! byte-addressable window onto DRAM shared with the co-processors, and an
//! optional hardware mutex guarding words both sides mutate.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use core::fmt;

/// 32-bit register window (regmap-style, offsets in bytes).
pub trait Regmap: Send + Sync {
    /// Reads the register at byte offset `reg`.
    fn read(&self, reg: u32) -> u32;
    /// Writes `value` to the register at byte offset `reg`.
    fn write(&self, reg: u32, value: u32);
}

/// Access outside the bounds of a [`SharedMem`] window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfBounds {
    /// First byte of the rejected access.
    pub offset: usize,
    /// Length of the rejected access.
    pub len: usize,
}

impl fmt::Display for OutOfBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shared memory access {:#x}+{} out of bounds", self.offset, self.len)
    }
}

/// Memory shared with a remote core.
///
/// Implementations must make each aligned 4-byte access observable as a
/// whole; nothing wider is guaranteed.
pub trait SharedMem: Send + Sync {
    /// Size of the window in bytes.
    fn len(&self) -> usize;

    /// Returns true when the window is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds>;

    /// Copies `src` into the window starting at `offset`.
    fn write(&self, offset: usize, src: &[u8]) -> Result<(), OutOfBounds>;

    /// Reads one raw 32-bit word (bytes in memory order).
    fn read_word(&self, offset: usize) -> Result<[u8; 4], OutOfBounds> {
        let mut word = [0u8; 4];
        self.read(offset, &mut word)?;
        Ok(word)
    }

    /// Writes one raw 32-bit word (bytes in memory order).
    fn write_word(&self, offset: usize, word: [u8; 4]) -> Result<(), OutOfBounds> {
        self.write(offset, &word)
    }
}

/// Hardware mutex shared between cores.
pub trait HwLock: Send + Sync {
    /// Spins until the lock is held by the caller.
    fn lock(&self);
    /// Attempts to take the lock without spinning.
    fn try_lock(&self) -> bool;
    /// Releases a lock previously taken by this side.
    fn unlock(&self);
}

/// Checks that `offset + len` fits a window of `size` bytes.
pub fn check_bounds(size: usize, offset: usize, len: usize) -> Result<(), OutOfBounds> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(OutOfBounds { offset, len }),
    }
}

#[cfg(test)]
mod tests {
    use super::{check_bounds, OutOfBounds, Regmap, SharedMem};
    use std::sync::Mutex;

    struct MockRegs(Mutex<u32>);

    impl Regmap for MockRegs {
        fn read(&self, _reg: u32) -> u32 {
            *self.0.lock().unwrap()
        }

        fn write(&self, _reg: u32, value: u32) {
            *self.0.lock().unwrap() = value;
        }
    }

    struct MockMem(Mutex<[u8; 8]>);

    impl SharedMem for MockMem {
        fn len(&self) -> usize {
            8
        }

        fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds> {
            check_bounds(8, offset, dst.len())?;
            let guard = self.0.lock().unwrap();
            dst.copy_from_slice(&guard[offset..offset + dst.len()]);
            Ok(())
        }

        fn write(&self, offset: usize, src: &[u8]) -> Result<(), OutOfBounds> {
            check_bounds(8, offset, src.len())?;
            let mut guard = self.0.lock().unwrap();
            guard[offset..offset + src.len()].copy_from_slice(src);
            Ok(())
        }
    }

    #[test]
    fn regmap_write_then_read() {
        let regs = MockRegs(Mutex::new(0));
        regs.write(0xa80, 0x3);
        assert_eq!(regs.read(0xa80), 0x3);
    }

    #[test]
    fn word_helpers_use_byte_access() {
        let mem = MockMem(Mutex::new([0; 8]));
        mem.write_word(4, [1, 2, 3, 4]).unwrap();
        assert_eq!(mem.read_word(4).unwrap(), [1, 2, 3, 4]);
        assert_eq!(mem.read_word(6), Err(OutOfBounds { offset: 6, len: 4 }));
    }

    #[test]
    fn bounds_reject_overflowing_offsets() {
        assert!(check_bounds(16, usize::MAX, 2).is_err());
        assert!(check_bounds(16, 12, 4).is_ok());
    }
}
