// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-side backends: heap-backed shared memory, a register file that
//! models the SB2 set/clear convention, and [`PeerSim`], which plays the
//! firmware side of a link so the transport can be exercised without a
//! co-processor.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rpmsg_hal::{check_bounds, OutOfBounds, Regmap, SharedMem};
use thiserror::Error;

use crate::channel::Channel;
use crate::link::{
    IrqStyle, NotifyBits, NotifyProfile, RemoteCore, SB2_INT, SB2_INT_EN, SB2_INT_ST, VE3_INT_EN,
    VE3_INT_ST, VE3_INT_TRIGGER,
};
use crate::ring::{RingBuffer, RingError, RxRing, ShmWindow, TxRing};
use crate::wire::{self, ByteOrder, RpcHeader, WireError, WireMessage, HEADER_LEN, KERNEL_ID};

/// Shared memory backed by a heap buffer.
pub struct HostShm {
    bytes: Mutex<Vec<u8>>,
}

impl HostShm {
    /// Zero-filled window of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self { bytes: Mutex::new(vec![0; len]) }
    }
}

impl SharedMem for HostShm {
    fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds> {
        let bytes = self.bytes.lock();
        check_bounds(bytes.len(), offset, dst.len())?;
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
        Ok(())
    }

    fn write(&self, offset: usize, src: &[u8]) -> Result<(), OutOfBounds> {
        let mut bytes = self.bytes.lock();
        check_bounds(bytes.len(), offset, src.len())?;
        bytes[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

const SET_CLEAR_REGS: [u32; 3] = [SB2_INT, SB2_INT_EN, SB2_INT_ST];

/// In-memory register file. SB2 registers follow the set/clear
/// convention; all other registers store written values verbatim.
#[derive(Default)]
pub struct HostRegmap {
    regs: Mutex<HashMap<u32, u32>>,
    log: Mutex<Vec<(u32, u32)>>,
}

impl HostRegmap {
    /// Empty register file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets bits directly, as the hardware does when a core raises a line.
    pub fn raise(&self, reg: u32, bits: u32) {
        *self.regs.lock().entry(reg).or_default() |= bits;
    }

    /// Every write performed through [`Regmap::write`], oldest first.
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.log.lock().clone()
    }
}

impl Regmap for HostRegmap {
    fn read(&self, reg: u32) -> u32 {
        self.regs.lock().get(&reg).copied().unwrap_or(0)
    }

    fn write(&self, reg: u32, value: u32) {
        self.log.lock().push((reg, value));
        let mut regs = self.regs.lock();
        let slot = regs.entry(reg).or_default();
        if SET_CLEAR_REGS.contains(&reg) {
            let bits = value & !1;
            if value & 1 != 0 {
                *slot |= bits;
            } else {
                *slot &= !bits;
            }
        } else {
            *slot = value;
        }
    }
}

/// Errors raised by the simulator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SimError {
    /// No channel of that name was attached.
    #[error("unknown channel {0}")]
    UnknownChannel(String),
    /// Ring access failed.
    #[error(transparent)]
    Ring(#[from] RingError),
    /// A queued message did not decode.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// An IPC word offset runs past the end of the address space.
    #[error("IPC word +{0:#x} exceeds the address space")]
    IpcOutOfRange(u32),
}

struct PeerRings {
    /// Our TX ring, consumed by the peer.
    inbound: RxRing,
    /// Our RX ring, produced by the peer.
    outbound: TxRing,
}

/// Firmware-side stand-in for one remote core.
pub struct PeerSim {
    core: RemoteCore,
    window: ShmWindow,
    ipc_base: u32,
    regs: Arc<HostRegmap>,
    rings: HashMap<String, PeerRings>,
}

impl PeerSim {
    /// Simulator sharing `window` and `regs` with the local link.
    pub fn new(core: RemoteCore, window: ShmWindow, ipc_base: u32, regs: Arc<HostRegmap>) -> Self {
        Self { core, window, ipc_base, regs, rings: HashMap::new() }
    }

    /// Attaches to both rings of `channel`, with the roles reversed.
    pub fn attach(&mut self, channel: &Channel) -> Result<(), SimError> {
        let layout = self.core.profile().layout;
        let tx_header = channel.tx().ring().header();
        let rx_header = channel.rx().ring().header();
        let inbound = RingBuffer::attach(self.window.clone(), tx_header, layout)?.consumer();
        let outbound = RingBuffer::attach(self.window.clone(), rx_header, layout)?.producer();
        self.rings.insert(channel.name().to_string(), PeerRings { inbound, outbound });
        Ok(())
    }

    fn rings(&self, channel: &str) -> Result<&PeerRings, SimError> {
        self.rings.get(channel).ok_or_else(|| SimError::UnknownChannel(channel.to_string()))
    }

    fn ipc_word(&self, offset: u32) -> Result<u32, SimError> {
        self.ipc_base.checked_add(offset).ok_or(SimError::IpcOutOfRange(offset))
    }

    fn order(&self) -> ByteOrder {
        self.core.profile().order
    }

    /// Completes the handshake by overwriting the sentinel.
    pub fn ack_handshake(&self, value: u32) -> Result<(), SimError> {
        let addr = self.ipc_word(self.core.profile().sync_flag)?;
        Ok(self.window.write_word(addr, value, ByteOrder::Big)?)
    }

    /// Queues raw bytes on `channel` and raises our interrupt line.
    pub fn post_raw(&self, channel: &str, bytes: &[u8]) -> Result<(), SimError> {
        self.rings(channel)?.outbound.write(bytes)?;
        self.set_notify(|p| p.from_notify)?;
        self.raise_interrupt();
        Ok(())
    }

    /// Encodes `msg` in the link's order and posts it.
    pub fn post(&self, channel: &str, msg: &WireMessage) -> Result<(), SimError> {
        self.post_raw(channel, &wire::encode(msg, self.order()))
    }

    /// Raises the status bit the local interrupt handler checks.
    pub fn raise_interrupt(&self) {
        let profile = self.core.profile();
        match profile.irq {
            IrqStyle::SetClear => self.regs.raise(SB2_INT_ST, profile.from_bit.bits()),
            IrqStyle::Direct => self.regs.raise(VE3_INT_ST, profile.from_bit.bits()),
        }
    }

    /// Sets the feedback bit acknowledging our last notification.
    pub fn feedback(&self) -> Result<(), SimError> {
        self.set_notify(|p| p.to_feedback)
    }

    fn set_notify(&self, pick: impl FnOnce(&NotifyProfile) -> NotifyBits) -> Result<(), SimError> {
        if let Some(p) = self.core.profile().notify {
            let addr = self.ipc_word(p.word)?;
            let bits = self.window.read_word(addr, ByteOrder::Big)? | pick(&p).bits();
            self.window.write_word(addr, bits, ByteOrder::Big)?;
        }
        Ok(())
    }

    /// True if the local side wrote its trigger for this core.
    pub fn interrupt_pending(&self) -> bool {
        let profile = self.core.profile();
        match profile.irq {
            IrqStyle::SetClear => self.regs.read(SB2_INT) & profile.to_bit.bits() != 0,
            IrqStyle::Direct => self.regs.read(VE3_INT_TRIGGER) & profile.to_bit.bits() != 0,
        }
    }

    /// True if the local side unmasked this core's line.
    pub fn interrupts_enabled(&self) -> bool {
        let profile = self.core.profile();
        let reg = match profile.irq {
            IrqStyle::SetClear => SB2_INT_EN,
            IrqStyle::Direct => VE3_INT_EN,
        };
        self.regs.read(reg) & profile.enable.bits() != 0
    }

    /// Consumes every message the local side queued on `channel`.
    pub fn take_sent(&self, channel: &str) -> Result<Vec<WireMessage>, SimError> {
        let rx = &self.rings(channel)?.inbound;
        let mut out = Vec::new();
        while !rx.is_empty()? {
            let header = RpcHeader::from_bytes(&rx.peek(HEADER_LEN)?, self.order())?;
            let bytes = rx.read(header.message_len())?;
            out.push(wire::decode(&bytes, self.order())?);
        }
        Ok(out)
    }

    /// Answers every pending kernel request on `channel` with `retval`,
    /// returning how many replies were posted.
    pub fn answer_kernel_requests(&self, channel: &str, retval: u32) -> Result<usize, SimError> {
        let mut answered = 0;
        for request in self.take_sent(channel)? {
            if request.header.program_id == KERNEL_ID {
                self.post(channel, &WireMessage::reply(&request.header, retval, self.order()))?;
                answered += 1;
            }
        }
        Ok(answered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_rejects_out_of_range_access() {
        let shm = HostShm::new(8);
        assert!(shm.write(6, &[0; 4]).is_err());
        shm.write(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(shm.read_word(4).unwrap(), [1, 2, 3, 4]);
    }

    #[test]
    fn set_clear_registers_honour_write_data_bit() {
        let regs = HostRegmap::new();
        regs.write(SB2_INT_EN, 0x2 | 1);
        regs.write(SB2_INT_EN, 0x4 | 1);
        assert_eq!(regs.read(SB2_INT_EN), 0x6);
        regs.write(SB2_INT_EN, 0x2);
        assert_eq!(regs.read(SB2_INT_EN), 0x4);
        regs.write(0x7c, 0x13);
        assert_eq!(regs.read(0x7c), 0x13);
        assert_eq!(regs.writes().len(), 4);
    }
}
