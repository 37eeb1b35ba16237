// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared-memory ring buffers between the application CPU and a co-processor
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (no overwrite, wrap)
//!
//! A ring is a fifo in shared DRAM plus a header of physical addresses:
//! `buf`, `start`, `end`, `in` (write cursor) and `out` (read cursor). The
//! producer only ever stores `in`; the consumer only ever stores `out`.
//! [`TxRing`] and [`RxRing`] encode that split: each owns one cursor
//! ([`OwnedCursor`]) and can merely observe the other ([`PeerCursor`]).
//!
//! Cursors always advance in 4-byte steps and one byte of slack is kept
//! free, so `in == out` unambiguously means empty.

use std::sync::Arc;

use rpmsg_hal::{OutOfBounds, SharedMem};
use serde::Deserialize;
use thiserror::Error;

use crate::wire::ByteOrder;

const OFF_BUF: u32 = 0;
const OFF_START: u32 = 4;
const OFF_END: u32 = 8;
const OFF_IN: u32 = 12;

/// Errors raised by ring accesses.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RingError {
    /// Not enough free space for the write.
    #[error("ring overflow: {requested} bytes requested, {available} available")]
    Overflow {
        /// Bytes the caller tried to write.
        requested: usize,
        /// Bytes writable at the time of the call.
        available: usize,
    },
    /// Not enough queued data for the read.
    #[error("ring underflow: {requested} bytes requested, {available} available")]
    Underflow {
        /// Bytes the caller tried to read.
        requested: usize,
        /// Bytes queued at the time of the call.
        available: usize,
    },
    /// A cursor points outside `[start, end)`.
    #[error("{cursor} cursor {value:#x} outside ring [{start:#x}, {end:#x})")]
    CursorOutOfRange {
        /// Which cursor.
        cursor: &'static str,
        /// Observed value.
        value: u32,
        /// Ring start.
        start: u32,
        /// Ring end.
        end: u32,
    },
    /// A physical address does not fall inside the shared window.
    #[error("physical range {phys:#x}+{len} outside shared window")]
    OutOfWindow {
        /// Physical address.
        phys: u32,
        /// Access length.
        len: usize,
    },
    /// Header values do not describe a usable ring.
    #[error("invalid ring geometry: {0}")]
    Geometry(&'static str),
}

/// Rounds `len` up to the next multiple of four.
pub const fn round4(len: usize) -> usize {
    (len + 3) & !3
}

/// Shared DRAM seen through its physical base address.
#[derive(Clone)]
pub struct ShmWindow {
    mem: Arc<dyn SharedMem>,
    phys_base: u32,
}

impl ShmWindow {
    /// Maps `mem` at physical address `phys_base`.
    pub fn new(mem: Arc<dyn SharedMem>, phys_base: u32) -> Self {
        Self { mem, phys_base }
    }

    /// Physical address of the first byte.
    pub fn phys_base(&self) -> u32 {
        self.phys_base
    }

    /// Window size in bytes.
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    /// Returns true for an empty window.
    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// Checks that `[phys, phys + len)` lies inside the window.
    pub fn contains(&self, phys: u32, len: usize) -> bool {
        self.offset_of(phys, len).is_ok()
    }

    fn offset_of(&self, phys: u32, len: usize) -> Result<usize, RingError> {
        let outside = RingError::OutOfWindow { phys, len };
        let off = phys.checked_sub(self.phys_base).ok_or(outside)? as usize;
        rpmsg_hal::check_bounds(self.mem.len(), off, len).map_err(|_| outside)?;
        Ok(off)
    }

    fn map_err(phys: u32) -> impl Fn(OutOfBounds) -> RingError {
        move |e| RingError::OutOfWindow { phys, len: e.len }
    }

    /// Reads the word at `phys` in `order`.
    pub fn read_word(&self, phys: u32, order: ByteOrder) -> Result<u32, RingError> {
        let off = self.offset_of(phys, 4)?;
        let raw = self.mem.read_word(off).map_err(Self::map_err(phys))?;
        Ok(order.read_u32(raw))
    }

    /// Writes the word at `phys` in `order`.
    pub fn write_word(&self, phys: u32, value: u32, order: ByteOrder) -> Result<(), RingError> {
        let off = self.offset_of(phys, 4)?;
        self.mem.write_word(off, order.write_u32(value)).map_err(Self::map_err(phys))
    }

    /// Copies bytes at `phys` into `dst`.
    pub fn read_bytes(&self, phys: u32, dst: &mut [u8]) -> Result<(), RingError> {
        let off = self.offset_of(phys, dst.len())?;
        self.mem.read(off, dst).map_err(Self::map_err(phys))
    }

    /// Copies `src` to `phys`.
    pub fn write_bytes(&self, phys: u32, src: &[u8]) -> Result<(), RingError> {
        let off = self.offset_of(phys, src.len())?;
        self.mem.write(off, src).map_err(Self::map_err(phys))
    }
}

/// Ring header layout; the cores reserve different scratch space after
/// the write cursor, which moves the read cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RingLayout {
    /// Audio, video and video-encode cores.
    Av,
    /// DSP cores.
    Hifi,
    /// Auxiliary control core.
    Kr4,
}

impl RingLayout {
    /// Byte offset of the read cursor within the header.
    pub const fn out_offset(self) -> u32 {
        match self {
            Self::Av => 16,
            Self::Hifi => 128,
            Self::Kr4 => 32,
        }
    }

    /// Bytes occupied by the header.
    pub const fn stride(self) -> u32 {
        match self {
            Self::Av => 20,
            Self::Hifi => 256,
            Self::Kr4 => 64,
        }
    }
}

/// Raw header words, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    /// `buf` word.
    pub buf: u32,
    /// `start` word.
    pub start: u32,
    /// `end` word.
    pub end: u32,
    /// Write cursor.
    pub write: u32,
    /// Read cursor.
    pub read: u32,
}

/// Geometry of one ring. Header words are little-endian.
#[derive(Clone)]
pub struct RingBuffer {
    window: ShmWindow,
    header: u32,
    layout: RingLayout,
    start: u32,
    end: u32,
}

impl RingBuffer {
    /// Initialises the header at `header` for a `size`-byte fifo at `fifo`
    /// and returns the ring.
    pub fn format(
        window: ShmWindow,
        header: u32,
        fifo: u32,
        size: u32,
        layout: RingLayout,
    ) -> Result<Self, RingError> {
        if size == 0 || size % 4 != 0 || fifo % 4 != 0 {
            return Err(RingError::Geometry("fifo must be non-empty and word aligned"));
        }
        let end =
            fifo.checked_add(size).ok_or(RingError::Geometry("fifo wraps the address space"))?;
        if !window.contains(fifo, size as usize) {
            return Err(RingError::OutOfWindow { phys: fifo, len: size as usize });
        }
        if !window.contains(header, layout.stride() as usize) {
            return Err(RingError::OutOfWindow { phys: header, len: layout.stride() as usize });
        }
        let ring = Self { window, header, layout, start: fifo, end };
        ring.reset()?;
        Ok(ring)
    }

    /// Rewrites every header word, leaving the ring empty.
    pub fn reset(&self) -> Result<(), RingError> {
        for off in [OFF_BUF, OFF_START, OFF_IN, self.layout.out_offset()] {
            self.window.write_word(self.header + off, self.start, ByteOrder::Little)?;
        }
        self.window.write_word(self.header + OFF_END, self.end, ByteOrder::Little)
    }

    /// Binds to a header someone else formatted.
    pub fn attach(window: ShmWindow, header: u32, layout: RingLayout) -> Result<Self, RingError> {
        let start = window.read_word(header + OFF_START, ByteOrder::Little)?;
        let end = window.read_word(header + OFF_END, ByteOrder::Little)?;
        if end <= start || (end - start) % 4 != 0 {
            return Err(RingError::Geometry("end must follow start by a multiple of 4"));
        }
        if !window.contains(start, (end - start) as usize) {
            return Err(RingError::OutOfWindow { phys: start, len: (end - start) as usize });
        }
        Ok(Self { window, header, layout, start, end })
    }

    /// Fifo size in bytes.
    pub fn capacity(&self) -> usize {
        (self.end - self.start) as usize
    }

    /// Physical address of the header.
    pub fn header(&self) -> u32 {
        self.header
    }

    /// Header layout.
    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    /// First fifo byte (`base`).
    pub fn start(&self) -> u32 {
        self.start
    }

    /// One past the last fifo byte.
    pub fn end(&self) -> u32 {
        self.end
    }

    /// Reads the raw header words without validating them.
    pub fn snapshot(&self) -> Result<RingSnapshot, RingError> {
        let word = |off: u32| self.window.read_word(self.header + off, ByteOrder::Little);
        Ok(RingSnapshot {
            buf: word(OFF_BUF)?,
            start: word(OFF_START)?,
            end: word(OFF_END)?,
            write: word(OFF_IN)?,
            read: word(self.layout.out_offset())?,
        })
    }

    /// Copies the whole fifo, for diagnostics.
    pub fn contents(&self) -> Result<Vec<u8>, RingError> {
        let mut out = vec![0u8; self.capacity()];
        self.window.read_bytes(self.start, &mut out)?;
        Ok(out)
    }

    /// Producer view: owns `in`, observes `out`.
    pub fn producer(self) -> TxRing {
        let write = OwnedCursor::new(&self, "write", OFF_IN);
        let read = PeerCursor::new(&self, "read", self.layout.out_offset());
        TxRing { ring: self, write, read }
    }

    /// Consumer view: owns `out`, observes `in`.
    pub fn consumer(self) -> RxRing {
        let read = OwnedCursor::new(&self, "read", self.layout.out_offset());
        let write = PeerCursor::new(&self, "write", OFF_IN);
        RxRing { ring: self, read, write }
    }

    fn check(&self, cursor: &'static str, value: u32) -> Result<u32, RingError> {
        if value < self.start || value >= self.end {
            let (start, end) = (self.start, self.end);
            return Err(RingError::CursorOutOfRange { cursor, value, start, end });
        }
        Ok(value)
    }

    fn advance(&self, cursor: u32, by: usize) -> u32 {
        let offset = (cursor - self.start) as usize + by;
        self.start + (offset % self.capacity()) as u32
    }

    fn copy_in(&self, at: u32, bytes: &[u8]) -> Result<(), RingError> {
        let first = bytes.len().min((self.end - at) as usize);
        self.window.write_bytes(at, &bytes[..first])?;
        if first < bytes.len() {
            self.window.write_bytes(self.start, &bytes[first..])?;
        }
        Ok(())
    }

    fn copy_out(&self, at: u32, dst: &mut [u8]) -> Result<(), RingError> {
        let first = dst.len().min((self.end - at) as usize);
        let (head, tail) = dst.split_at_mut(first);
        self.window.read_bytes(at, head)?;
        if !tail.is_empty() {
            self.window.read_bytes(self.start, tail)?;
        }
        Ok(())
    }
}

/// Cursor this side is allowed to store.
pub struct OwnedCursor {
    window: ShmWindow,
    phys: u32,
    name: &'static str,
}

impl OwnedCursor {
    fn new(ring: &RingBuffer, name: &'static str, off: u32) -> Self {
        Self { window: ring.window.clone(), phys: ring.header + off, name }
    }

    /// Current value.
    pub fn load(&self) -> Result<u32, RingError> {
        self.window.read_word(self.phys, ByteOrder::Little)
    }

    /// Publishes a new value.
    pub fn store(&self, value: u32) -> Result<(), RingError> {
        self.window.write_word(self.phys, value, ByteOrder::Little)
    }
}

/// Cursor owned by the other core; it may change between any two reads.
pub struct PeerCursor {
    window: ShmWindow,
    phys: u32,
    name: &'static str,
}

impl PeerCursor {
    fn new(ring: &RingBuffer, name: &'static str, off: u32) -> Self {
        Self { window: ring.window.clone(), phys: ring.header + off, name }
    }

    /// Best-effort observation of the peer's last published value.
    pub fn observe(&self) -> Result<u32, RingError> {
        self.window.read_word(self.phys, ByteOrder::Little)
    }
}

fn free_bytes(write: u32, read: u32, capacity: usize) -> usize {
    match write.cmp(&read) {
        std::cmp::Ordering::Equal => capacity,
        std::cmp::Ordering::Greater => capacity - (write - read) as usize,
        std::cmp::Ordering::Less => (read - write) as usize,
    }
}

/// Producer side of a ring.
pub struct TxRing {
    ring: RingBuffer,
    write: OwnedCursor,
    read: PeerCursor,
}

impl TxRing {
    /// Underlying geometry.
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    fn cursors(&self) -> Result<(u32, u32), RingError> {
        let write = self.ring.check(self.write.name, self.write.load()?)?;
        let read = self.ring.check(self.read.name, self.read.observe()?)?;
        Ok((write, read))
    }

    /// Bytes that may be written now.
    pub fn available_to_write(&self) -> Result<usize, RingError> {
        let (write, read) = self.cursors()?;
        Ok(free_bytes(write, read, self.ring.capacity()) - 1)
    }

    /// Appends `bytes`, splitting at the end of the fifo if needed, then
    /// publishes the write cursor advanced by `round4(bytes.len())`.
    pub fn write(&self, bytes: &[u8]) -> Result<(), RingError> {
        let (write, read) = self.cursors()?;
        let free = free_bytes(write, read, self.ring.capacity());
        let available = free - 1;
        let step = round4(bytes.len());
        // The rounded step must stay short of the read cursor.
        if bytes.len() > available || step >= free {
            return Err(RingError::Overflow { requested: bytes.len(), available });
        }
        self.ring.copy_in(write, bytes)?;
        self.write.store(self.ring.advance(write, step))
    }
}

/// Consumer side of a ring.
pub struct RxRing {
    ring: RingBuffer,
    read: OwnedCursor,
    write: PeerCursor,
}

impl RxRing {
    /// Underlying geometry.
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    fn cursors(&self) -> Result<(u32, u32), RingError> {
        let write = self.ring.check(self.write.name, self.write.observe()?)?;
        let read = self.ring.check(self.read.name, self.read.load()?)?;
        Ok((write, read))
    }

    /// Bytes queued by the peer.
    pub fn available_to_read(&self) -> Result<usize, RingError> {
        let (write, read) = self.cursors()?;
        let cap = self.ring.capacity();
        Ok((cap + write as usize - read as usize) % cap)
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> Result<bool, RingError> {
        let (write, read) = self.cursors()?;
        Ok(write == read)
    }

    /// Copies `len` queued bytes without consuming them.
    pub fn peek(&self, len: usize) -> Result<Vec<u8>, RingError> {
        let (write, read) = self.cursors()?;
        let cap = self.ring.capacity();
        let available = (cap + write as usize - read as usize) % cap;
        if len > available {
            return Err(RingError::Underflow { requested: len, available });
        }
        let mut out = vec![0u8; len];
        self.ring.copy_out(read, &mut out)?;
        Ok(out)
    }

    /// Consumes `len` bytes; the read cursor moves by `round4(len)`,
    /// clamped to what the peer published.
    pub fn read(&self, len: usize) -> Result<Vec<u8>, RingError> {
        let (write, read) = self.cursors()?;
        let cap = self.ring.capacity();
        let available = (cap + write as usize - read as usize) % cap;
        if len > available {
            return Err(RingError::Underflow { requested: len, available });
        }
        let mut out = vec![0u8; len];
        self.ring.copy_out(read, &mut out)?;
        self.read.store(self.ring.advance(read, round4(len).min(available)))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostShm;
    use proptest::prelude::*;

    const BASE: u32 = 0x040f_f000;
    const HEADER: u32 = BASE;
    const FIFO: u32 = BASE + 0x100;

    fn pair(size: u32) -> (TxRing, RxRing) {
        let window = ShmWindow::new(Arc::new(HostShm::new(0x1000)), BASE);
        let ring = RingBuffer::format(window.clone(), HEADER, FIFO, size, RingLayout::Av).unwrap();
        let peer = RingBuffer::attach(window, HEADER, RingLayout::Av).unwrap();
        (ring.producer(), peer.consumer())
    }

    #[test]
    fn format_initialises_every_cursor() {
        let (tx, _) = pair(64);
        let snap = tx.ring().snapshot().unwrap();
        let expected =
            RingSnapshot { buf: FIFO, start: FIFO, end: FIFO + 64, write: FIFO, read: FIFO };
        assert_eq!(snap, expected);
        assert_eq!(tx.available_to_write().unwrap(), 63);
    }

    #[test]
    fn layouts_place_read_cursor_apart() {
        let window = ShmWindow::new(Arc::new(HostShm::new(0x1000)), BASE);
        for layout in [RingLayout::Av, RingLayout::Hifi, RingLayout::Kr4] {
            let ring =
                RingBuffer::format(window.clone(), HEADER, FIFO + 0x100, 128, layout).unwrap();
            let out = window.read_word(HEADER + layout.out_offset(), ByteOrder::Little).unwrap();
            assert_eq!(out, FIFO + 0x100);
            assert!(ring.layout().stride() > ring.layout().out_offset());
        }
    }

    #[test]
    fn two_writes_leave_rounded_slack() {
        let (tx, _) = pair(64);
        tx.write(&[1; 20]).unwrap();
        assert_eq!(tx.available_to_write().unwrap(), 64 - 1 - 20);
        tx.write(&[2; 30]).unwrap();
        // 30 bytes occupy a 32-byte step.
        assert_eq!(tx.available_to_write().unwrap(), 64 - 1 - 52);
    }

    #[test]
    fn wrapped_write_reads_back_in_order() {
        let (tx, rx) = pair(64);
        tx.write(&[0; 48]).unwrap();
        rx.read(48).unwrap();
        let old = tx.ring().snapshot().unwrap().write;
        let payload: Vec<u8> = (0..40).collect();
        tx.write(&payload).unwrap();
        assert_eq!(rx.read(40).unwrap(), payload);
        let expect = FIFO + round4(40 - (FIFO + 64 - old) as usize) as u32;
        assert_eq!(tx.ring().snapshot().unwrap().write, expect);
        assert!(rx.is_empty().unwrap());
    }

    #[test]
    fn cursor_wraps_to_base_exactly_at_end() {
        let (tx, rx) = pair(64);
        tx.write(&[7; 32]).unwrap();
        rx.read(32).unwrap();
        tx.write(&[8; 32]).unwrap();
        assert_eq!(tx.ring().snapshot().unwrap().write, FIFO);
    }

    #[test]
    fn overflow_and_underflow_leave_state_untouched() {
        let (tx, rx) = pair(64);
        assert_eq!(rx.read(4), Err(RingError::Underflow { requested: 4, available: 0 }));
        assert_eq!(tx.write(&[0; 64]), Err(RingError::Overflow { requested: 64, available: 63 }));
        // 61 fits the byte count but its 64-byte step would land on the reader.
        assert!(tx.write(&[0; 61]).is_err());
        assert_eq!(tx.ring().snapshot().unwrap().write, FIFO);
        tx.write(&[0; 60]).unwrap();
    }

    #[test]
    fn corrupted_cursor_is_reported() {
        let (tx, rx) = pair(64);
        tx.ring().window.write_word(HEADER + OFF_IN, FIFO + 64, ByteOrder::Little).unwrap();
        let err = rx.available_to_read().unwrap_err();
        assert!(matches!(err, RingError::CursorOutOfRange { cursor: "write", .. }));
    }

    #[test]
    fn attach_rejects_bad_geometry() {
        let window = ShmWindow::new(Arc::new(HostShm::new(0x1000)), BASE);
        assert!(RingBuffer::attach(window.clone(), HEADER, RingLayout::Av).is_err());
        assert!(RingBuffer::format(window.clone(), HEADER, FIFO, 30, RingLayout::Av).is_err());
        assert!(RingBuffer::format(window, HEADER, BASE + 0xff0, 64, RingLayout::Av).is_err());
    }

    proptest! {
        #[test]
        fn accepted_writes_never_clobber_unread_bytes(
            ops in proptest::collection::vec((1usize..40, any::<bool>()), 1..64),
        ) {
            let (tx, rx) = pair(128);
            let mut pending: std::collections::VecDeque<Vec<u8>> = Default::default();
            let mut tag = 0u8;
            for (len, consume) in ops {
                tag = tag.wrapping_add(1);
                let chunk = vec![tag; len];
                if len <= tx.available_to_write().unwrap() && tx.write(&chunk).is_ok() {
                    pending.push_back(chunk);
                }
                if consume {
                    if let Some(front) = pending.pop_front() {
                        prop_assert_eq!(rx.read(front.len()).unwrap(), front);
                    }
                }
            }
            while let Some(front) = pending.pop_front() {
                prop_assert_eq!(rx.read(front.len()).unwrap(), front);
            }
            prop_assert!(rx.is_empty().unwrap());
        }
    }
}
