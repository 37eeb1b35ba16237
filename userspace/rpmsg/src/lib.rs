// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Ring-buffer message transport between the application CPU and its
//! co-processors (audio, video, ve3, hifi, hifi1, kr4).
//!
//! Each co-processor is reached through a [`link::RemoteLink`]: a boot
//! handshake on a sync flag, a doorbell interrupt in each direction and an
//! optional notify word. A link carries named [`channel::Channel`]s, each a
//! pair of single-producer single-consumer rings in shared DRAM. Messages on
//! the rings are RPC envelopes ([`wire`]) routed to endpoints by task id or
//! process id.
//!
//! Platform access goes through the traits in `rpmsg-hal`; [`host`] provides
//! in-memory backends and a firmware-side simulator for tests and tooling.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod budget;
pub mod channel;
pub mod cli;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod host;
pub mod krpc;
pub mod link;
pub mod ring;
pub mod transmit;
pub mod wire;

pub use channel::{Channel, ChannelError, Delivery, DispatchMode, EndpointHandle, EndpointRequest};
pub use cli::{execute, help, run};
pub use config::{Config, ConfigError};
pub use control::{
    ControlDevice, ControlError, ControlPlane, FirmwareProbe, LinkHandle, LinkResources,
};
pub use krpc::{KrpcAgent, KrpcError};
pub use link::{LinkStatus, RemoteCore, RemoteLink};
pub use ring::{RingBuffer, RingError, RingLayout};
pub use transmit::SendError;
pub use wire::{ByteOrder, RpcHeader, WireMessage};
