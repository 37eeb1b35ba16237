// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Transmit path: serialize a payload into the TX ring, then kick the peer.

use thiserror::Error;

use crate::channel::Channel;
use crate::link::{LinkError, LinkStatus, RemoteLink};
use crate::ring::RingError;
use crate::wire::{self, WireMessage};

/// Errors returned by senders.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The TX ring is temporarily full; back off and retry.
    #[error("tx ring busy: {requested} bytes requested, {available} available")]
    Busy {
        /// Bytes the caller tried to send.
        requested: usize,
        /// Bytes writable at the time of the call.
        available: usize,
    },
    /// The handshake never completed (or failed); do not retry blindly.
    #[error("remote link is {0}")]
    LinkDown(LinkStatus),
    /// The channel detected ring desync earlier.
    #[error("channel {0} is faulted")]
    Faulted(String),
    /// The sending endpoint was destroyed.
    #[error("endpoint {0:#x} is closed")]
    EndpointClosed(u32),
    /// No matching reply arrived in time (blocking RPC callers only).
    #[error("timed out waiting for reply")]
    Timeout,
    /// Cursor state is unusable.
    #[error("tx ring access failed")]
    Ring(#[source] RingError),
    /// The message was queued but the peer could not be signalled.
    #[error("failed to signal remote core")]
    Signal(#[from] LinkError),
}

impl From<RingError> for SendError {
    fn from(err: RingError) -> Self {
        match err {
            RingError::Overflow { requested, available } => Self::Busy { requested, available },
            other => Self::Ring(other),
        }
    }
}

/// Writes `payload` into `channel`'s TX ring and signals the remote core.
/// Returns the number of payload bytes queued.
pub fn send(link: &RemoteLink, channel: &Channel, payload: &[u8]) -> Result<usize, SendError> {
    let status = link.status();
    if status != LinkStatus::Connected {
        log::warn!("rpmsg: {} cannot send on {}, link {status}", link.name(), channel.name());
        return Err(SendError::LinkDown(status));
    }
    if channel.is_faulted() {
        return Err(SendError::Faulted(channel.name().to_string()));
    }
    {
        let _serial = channel.tx_lock();
        channel.tx().write(payload)?;
    }
    link.signal_remote()?;
    Ok(payload.len())
}

/// Encodes `msg` in the link's byte order and sends it.
pub fn send_message(
    link: &RemoteLink,
    channel: &Channel,
    msg: &WireMessage,
) -> Result<usize, SendError> {
    send(link, channel, &wire::encode(msg, link.order()))
}
