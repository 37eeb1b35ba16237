// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Receive-side drain loop
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/dispatch.rs
//!
//! A channel is either `Idle` or `Draining`. A drain decodes messages
//! until the RX ring is empty and hands each one to its endpoint. A second
//! notification arriving mid-drain does not start a parallel drain; it
//! re-arms the running one, which loops once more before going idle.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error};
use thiserror::Error;

use crate::channel::{Channel, Delivery};
use crate::ring::RingError;
use crate::wire::{self, ByteOrder, RpcHeader, WireError, HEADER_LEN};

/// Per-channel dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// No drain running.
    Idle,
    /// A drain is consuming the RX ring.
    Draining,
}

/// Counts from one drain request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages handed to an endpoint.
    pub delivered: usize,
    /// Messages with no matching endpoint.
    pub dropped: usize,
    /// True if another drain was already running and was re-armed instead.
    pub deferred: bool,
}

/// Fatal receive-side errors; the channel is marked faulted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// A header claims more bytes than the ring holds.
    #[error("channel {channel}: ring desync")]
    Truncated {
        /// Channel name.
        channel: String,
        /// Codec detail.
        #[source]
        source: WireError,
    },
    /// Cursor state is unusable.
    #[error("channel {channel}: ring access failed")]
    Ring {
        /// Channel name.
        channel: String,
        /// Ring detail.
        #[source]
        source: RingError,
    },
    /// The channel faulted earlier and awaits a re-handshake.
    #[error("channel {0} is faulted")]
    Faulted(String),
}

#[derive(Debug, Default)]
pub(crate) struct DrainGate {
    active: AtomicBool,
    rearm: AtomicBool,
}

impl DrainGate {
    fn try_enter(&self) -> bool {
        self.active.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Leaves the drain; true if a notification arrived meanwhile and this
    /// caller took the gate again.
    fn leave(&self) -> bool {
        self.active.store(false, Ordering::Release);
        self.rearm.load(Ordering::Acquire) && self.try_enter()
    }
}

/// Current state of `channel`'s dispatcher.
pub fn state(channel: &Channel) -> DispatchState {
    if channel.gate.active.load(Ordering::Acquire) {
        DispatchState::Draining
    } else {
        DispatchState::Idle
    }
}

/// Drains `channel`'s RX ring, delivering every complete message.
pub fn drain(channel: &Channel, order: ByteOrder) -> Result<DrainReport, DispatchError> {
    if channel.is_faulted() {
        return Err(DispatchError::Faulted(channel.name().to_string()));
    }
    let gate = &channel.gate;
    if !gate.try_enter() {
        gate.rearm.store(true, Ordering::Release);
        // The runner may have left before seeing the flag.
        if !gate.try_enter() {
            return Ok(DrainReport { deferred: true, ..DrainReport::default() });
        }
    }
    let mut report = DrainReport::default();
    loop {
        gate.rearm.store(false, Ordering::Release);
        if let Err(err) = drain_ring(channel, order, &mut report) {
            gate.active.store(false, Ordering::Release);
            channel.mark_faulted();
            error!("rpmsg: {err}; channel disabled until re-handshake");
            return Err(err);
        }
        if !gate.leave() {
            return Ok(report);
        }
    }
}

fn drain_ring(
    channel: &Channel,
    order: ByteOrder,
    report: &mut DrainReport,
) -> Result<(), DispatchError> {
    let ring_err = |source| DispatchError::Ring { channel: channel.name().to_string(), source };
    let truncated =
        |source| DispatchError::Truncated { channel: channel.name().to_string(), source };
    let rx = channel.rx();
    while !rx.is_empty().map_err(ring_err)? {
        let available = rx.available_to_read().map_err(ring_err)?;
        if available < HEADER_LEN {
            return Err(truncated(WireError::Truncated { needed: HEADER_LEN, available }));
        }
        let head = rx.peek(HEADER_LEN).map_err(ring_err)?;
        let header = RpcHeader::from_bytes(&head, order).map_err(truncated)?;
        let needed = header.message_len();
        if available < needed {
            return Err(truncated(WireError::Truncated { needed, available }));
        }
        let bytes = rx.read(needed).map_err(ring_err)?;
        let message = wire::decode(&bytes, order).map_err(truncated)?;
        // The frame is consumed, so an unroutable message leaves the ring in sync.
        let key = match wire::dispatch_key(&message, order) {
            Ok(key) => key,
            Err(err) => {
                error!(
                    "rpmsg: {} unroutable message (program {}): {err}; dropped",
                    channel.name(),
                    message.header.program_id
                );
                report.dropped += 1;
                continue;
            }
        };
        match channel.lookup(key) {
            Some(endpoint) => {
                debug!(
                    "rpmsg: {} program {} -> endpoint {:#x}",
                    channel.name(),
                    message.header.program_id,
                    endpoint.addr()
                );
                endpoint.deliver(&Delivery { message, order });
                report.delivered += 1;
            }
            None => {
                error!(
                    "rpmsg: {} no endpoint for {:?} (program {}, {} bytes); dropped",
                    channel.name(),
                    key,
                    message.header.program_id,
                    needed
                );
                report.dropped += 1;
            }
        }
    }
    Ok(())
}
