// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Link registration, client messaging API and diagnostic device
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/transport.rs, tests/krpc.rs
//!
//! The control plane owns every registered link in an arena of slots.
//! Callers hold [`LinkHandle`]s carrying the slot's generation; a handle
//! from before an unregister is rejected with [`ControlError::StaleHandle`].

use std::fmt::Write as _;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use rpmsg_hal::{HwLock, Regmap, SharedMem};
use thiserror::Error;

use crate::budget::{CancelToken, Clock};
use crate::channel::{
    Callback, Channel, ChannelError, EndpointHandle, EndpointRequest, IdentityResolver,
    ProcessResolver,
};
use crate::config::{LinkConfig, RegionConfig};
use crate::link::{InterruptOutcome, LinkError, LinkStatus, RemoteCore, RemoteLink};
use crate::ring::{RingBuffer, RingError, RingSnapshot, ShmWindow};
use crate::transmit::SendError;
use crate::wire::WireMessage;

/// Errors produced by the control plane.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
    /// The handle refers to an unregistered link.
    #[error("stale link handle")]
    StaleHandle,
    /// The core's firmware is not running yet; retry later.
    #[error("{0} firmware not running yet")]
    ProbeDeferred(RemoteCore),
    /// The core is disabled or its handshake failed.
    #[error("{0} unavailable")]
    NoDevice(RemoteCore),
    /// The core already has a registered link.
    #[error("{0} already registered")]
    Duplicate(RemoteCore),
    /// The layout asks for a hardware lock the platform did not provide.
    #[error("{0} requires a hardware lock")]
    MissingHwLock(RemoteCore),
    /// No channel by that name on the link.
    #[error("unknown channel {0}")]
    UnknownChannel(String),
    /// Ring setup or access failed.
    #[error(transparent)]
    Ring(#[from] RingError),
    /// Endpoint management failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Handshake or signaling failed.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// Sending failed.
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Firmware state reported by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareState {
    /// The core executes firmware.
    Running,
    /// The loader has not started the core yet.
    Offline,
    /// The core is disabled on this board.
    Disabled,
}

/// Boundary with the firmware loader.
pub trait FirmwareProbe: Send + Sync {
    /// Current state of `core`.
    fn state(&self, core: RemoteCore) -> FirmwareState;
}

/// Probe for platforms where firmware is started before this layer loads.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeRunning;

impl FirmwareProbe for AssumeRunning {
    fn state(&self, _core: RemoteCore) -> FirmwareState {
        FirmwareState::Running
    }
}

/// Platform resources backing one link.
#[derive(Clone)]
pub struct LinkResources {
    /// Shared DRAM region.
    pub shm: Arc<dyn SharedMem>,
    /// Interrupt register window.
    pub regmap: Arc<dyn Regmap>,
    /// Hardware lock, if the SoC has one.
    pub hwlock: Option<Arc<dyn HwLock>>,
    /// Thread-to-process mapping for process-id channels.
    pub resolver: Arc<dyn ProcessResolver>,
}

impl LinkResources {
    /// Resources without a hardware lock, with identity process mapping.
    pub fn new(shm: Arc<dyn SharedMem>, regmap: Arc<dyn Regmap>) -> Self {
        Self { shm, regmap, hwlock: None, resolver: Arc::new(IdentityResolver) }
    }

    /// Adds a hardware lock.
    pub fn with_hwlock(mut self, lock: Arc<dyn HwLock>) -> Self {
        self.hwlock = Some(lock);
        self
    }

    /// Replaces the process resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn ProcessResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// Monotonic slot generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    const fn first() -> Self {
        Self(1)
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Raw value.
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Stable reference to a registered link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle {
    index: usize,
    generation: Generation,
}

impl LinkHandle {
    /// Slot generation the handle was issued for.
    pub fn generation(&self) -> Generation {
        self.generation
    }
}

/// A registered link and its channels.
pub struct LinkInstance {
    link: RemoteLink,
    channels: Vec<Arc<Channel>>,
}

impl std::fmt::Debug for LinkInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkInstance").finish_non_exhaustive()
    }
}

impl LinkInstance {
    /// The link.
    pub fn link(&self) -> &RemoteLink {
        &self.link
    }

    /// Channels in configuration order.
    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    /// Channel by name.
    pub fn channel(&self, name: &str) -> Result<&Arc<Channel>, ControlError> {
        self.channels
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| ControlError::UnknownChannel(name.to_string()))
    }
}

struct Slot {
    generation: Generation,
    instance: Option<Arc<LinkInstance>>,
}

/// Owner of every registered link.
#[derive(Default)]
pub struct ControlPlane {
    slots: Mutex<Vec<Slot>>,
}

impl ControlPlane {
    /// Empty control plane.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the link and formats both rings of each channel.
    pub fn register(
        &self,
        region: &RegionConfig,
        config: &LinkConfig,
        resources: LinkResources,
        probe: &dyn FirmwareProbe,
    ) -> Result<LinkHandle, ControlError> {
        let core = config.core;
        match probe.state(core) {
            FirmwareState::Running => {}
            FirmwareState::Offline => return Err(ControlError::ProbeDeferred(core)),
            FirmwareState::Disabled => return Err(ControlError::NoDevice(core)),
        }
        let hwlock = match (config.hwlock, resources.hwlock) {
            (true, None) => return Err(ControlError::MissingHwLock(core)),
            (true, lock) => lock,
            (false, _) => None,
        };
        let layout = core.profile().layout;
        let window = ShmWindow::new(resources.shm, region.phys_base);
        let mut channels = Vec::with_capacity(config.channels.len());
        for ch in &config.channels {
            let tx = RingBuffer::format(window.clone(), ch.tx_header, ch.tx_fifo, ch.size, layout)?;
            let rx = RingBuffer::format(window.clone(), ch.rx_header, ch.rx_fifo, ch.size, layout)?;
            channels.push(Arc::new(Channel::new(
                ch.spec(),
                tx.producer(),
                rx.consumer(),
                Arc::clone(&resources.resolver),
            )));
        }
        let link = RemoteLink::new(
            core,
            window,
            region.ipc_base(),
            resources.regmap,
            hwlock,
            config.params(),
        );
        let instance = Arc::new(LinkInstance { link, channels });

        let mut slots = self.slots.lock();
        if slots.iter().filter_map(|s| s.instance.as_ref()).any(|i| i.link.profile().core == core) {
            return Err(ControlError::Duplicate(core));
        }
        let index = match slots.iter().position(|s| s.instance.is_none()) {
            Some(index) => index,
            None => {
                slots.push(Slot { generation: Generation::first(), instance: None });
                slots.len() - 1
            }
        };
        let slot = &mut slots[index];
        slot.instance = Some(instance);
        info!("rpmsg: registered {core} with {} channel(s)", config.channels.len());
        Ok(LinkHandle { index, generation: slot.generation })
    }

    /// Masks the link's interrupt and releases its slot.
    pub fn unregister(&self, handle: LinkHandle) -> Result<(), ControlError> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(handle.index).ok_or(ControlError::StaleHandle)?;
        if slot.generation != handle.generation {
            return Err(ControlError::StaleHandle);
        }
        let instance = slot.instance.take().ok_or(ControlError::StaleHandle)?;
        slot.generation = slot.generation.next();
        instance.link.shutdown();
        info!("rpmsg: unregistered {}", instance.link.name());
        Ok(())
    }

    /// Resolves `handle`.
    pub fn instance(&self, handle: LinkHandle) -> Result<Arc<LinkInstance>, ControlError> {
        let slots = self.slots.lock();
        slots
            .get(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.instance.clone())
            .ok_or(ControlError::StaleHandle)
    }

    /// Runs the boot handshake.
    pub fn connect(
        &self,
        handle: LinkHandle,
        clock: &dyn Clock,
        cancel: &CancelToken,
    ) -> Result<LinkStatus, ControlError> {
        Ok(self.instance(handle)?.link.connect(clock, cancel)?)
    }

    /// Empties every ring, clears channel faults and re-runs the handshake,
    /// as after a firmware restart.
    pub fn reconnect(
        &self,
        handle: LinkHandle,
        clock: &dyn Clock,
        cancel: &CancelToken,
    ) -> Result<LinkStatus, ControlError> {
        let instance = self.instance(handle)?;
        instance.link.reset();
        for ch in &instance.channels {
            ch.tx().ring().reset()?;
            ch.rx().ring().reset()?;
            ch.reset_fault();
        }
        Ok(instance.link.connect(clock, cancel)?)
    }

    /// Link status.
    pub fn status(&self, handle: LinkHandle) -> Result<LinkStatus, ControlError> {
        Ok(self.instance(handle)?.link.status())
    }

    /// Interrupt entry point for the link.
    pub fn interrupt(&self, handle: LinkHandle) -> Result<InterruptOutcome, ControlError> {
        let instance = self.instance(handle)?;
        Ok(instance.link.on_interrupt(&instance.channels)?)
    }

    /// Masks the link's interrupt for system suspend.
    pub fn suspend(&self, handle: LinkHandle) -> Result<(), ControlError> {
        self.instance(handle)?.link.suspend();
        Ok(())
    }

    /// Unmasks the link's interrupt after resume.
    pub fn resume(&self, handle: LinkHandle) -> Result<(), ControlError> {
        self.instance(handle)?.link.resume();
        Ok(())
    }

    /// Resolves `handle` for a messaging client: not yet connected defers,
    /// a failed handshake means no device.
    pub fn link_for_client(&self, handle: LinkHandle) -> Result<Arc<LinkInstance>, ControlError> {
        let instance = self.instance(handle)?;
        let core = instance.link.profile().core;
        match instance.link.status() {
            LinkStatus::Connected => Ok(instance),
            LinkStatus::Uninitialized => Err(ControlError::ProbeDeferred(core)),
            LinkStatus::Disconnected => Err(ControlError::NoDevice(core)),
        }
    }

    /// Opens an endpoint on `channel`.
    pub fn open(
        &self,
        handle: LinkHandle,
        channel: &str,
        request: EndpointRequest,
        callback: Callback,
    ) -> Result<EndpointHandle, ControlError> {
        let instance = self.instance(handle)?;
        let ch = instance.channel(channel)?;
        Ok(ch.create_endpoint(ch.mode(), request, callback)?)
    }

    /// Sends pre-encoded bytes from `endpoint`.
    pub fn send(
        &self,
        handle: LinkHandle,
        channel: &str,
        endpoint: &EndpointHandle,
        payload: &[u8],
    ) -> Result<usize, ControlError> {
        let instance = self.instance(handle)?;
        Ok(instance.channel(channel)?.send(&instance.link, endpoint, payload)?)
    }

    /// Encodes and sends `msg` from `endpoint`.
    pub fn send_message(
        &self,
        handle: LinkHandle,
        channel: &str,
        endpoint: &EndpointHandle,
        msg: &WireMessage,
    ) -> Result<usize, ControlError> {
        let instance = self.instance(handle)?;
        Ok(instance.channel(channel)?.send_message(&instance.link, endpoint, msg)?)
    }

    /// Closes `endpoint`.
    pub fn close(
        &self,
        handle: LinkHandle,
        channel: &str,
        endpoint: EndpointHandle,
    ) -> Result<(), ControlError> {
        let instance = self.instance(handle)?;
        Ok(instance.channel(channel)?.destroy_endpoint(endpoint)?)
    }

    /// Header words of both rings of `channel`.
    pub fn ring_info(
        &self,
        handle: LinkHandle,
        channel: &str,
    ) -> Result<(RingSnapshot, RingSnapshot), ControlError> {
        let instance = self.instance(handle)?;
        let ch = instance.channel(channel)?;
        Ok((ch.tx().ring().snapshot()?, ch.rx().ring().snapshot()?))
    }

    /// Text dump of every ring of the link: header words, then the fifo as
    /// rows of four words in the link's byte order.
    pub fn dump(&self, handle: LinkHandle) -> Result<String, ControlError> {
        let instance = self.instance(handle)?;
        let order = instance.link.order();
        let mut out = String::new();
        let _ = writeln!(out, "{} ({})", instance.link.name(), instance.link.status());
        for ch in &instance.channels {
            let faulted = if ch.is_faulted() { ", faulted" } else { "" };
            let _ = writeln!(out, "channel {} ({}{faulted})", ch.name(), ch.mode());
            for (dir, ring) in [("TX", ch.tx().ring()), ("RX", ch.rx().ring())] {
                let s = ring.snapshot()?;
                let _ = writeln!(
                    out,
                    "  {dir} RingBuf {:#010x} RingStart {:#010x} RingIn {:#010x} RingOut {:#010x} \
                     RingEnd {:#010x}",
                    s.buf, s.start, s.write, s.read, s.end
                );
            }
            for (dir, ring) in [("TX", ch.tx().ring()), ("RX", ch.rx().ring())] {
                let _ = writeln!(out, "  {dir} data:");
                let bytes = ring.contents()?;
                for (row, chunk) in bytes.chunks(16).enumerate() {
                    let _ = write!(out, "    {:#010x}:", ring.start() as usize + row * 16);
                    for word in chunk.chunks_exact(4) {
                        let value = order.read_u32([word[0], word[1], word[2], word[3]]);
                        let _ = write!(out, " {value:08x}");
                    }
                    out.push('\n');
                }
            }
        }
        Ok(out)
    }
}

/// Commands accepted by [`ControlDevice::ioctl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Query the link status.
    Status,
    /// Query ring header words of a channel.
    RingInfo {
        /// Channel name.
        channel: String,
    },
}

/// Replies from [`ControlDevice::ioctl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceReply {
    /// Link status.
    Status(LinkStatus),
    /// TX and RX ring headers.
    RingInfo {
        /// TX ring.
        tx: RingSnapshot,
        /// RX ring.
        rx: RingSnapshot,
    },
}

/// Per-link character-device surface, used for debugging only.
pub struct ControlDevice {
    plane: Arc<ControlPlane>,
    handle: LinkHandle,
    text: Option<Vec<u8>>,
    offset: usize,
}

impl ControlDevice {
    /// Opens the device for `handle`.
    pub fn open(plane: Arc<ControlPlane>, handle: LinkHandle) -> Result<Self, ControlError> {
        plane.instance(handle)?;
        Ok(Self { plane, handle, text: None, offset: 0 })
    }

    /// Executes an ioctl.
    pub fn ioctl(&self, cmd: DeviceCommand) -> Result<DeviceReply, ControlError> {
        match cmd {
            DeviceCommand::Status => Ok(DeviceReply::Status(self.plane.status(self.handle)?)),
            DeviceCommand::RingInfo { channel } => {
                let (tx, rx) = self.plane.ring_info(self.handle, &channel)?;
                Ok(DeviceReply::RingInfo { tx, rx })
            }
        }
    }

    /// Reads the dump text; the text is captured on the first read after
    /// open or [`ControlDevice::rewind`]. Returns 0 at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ControlError> {
        if self.text.is_none() {
            self.text = Some(self.plane.dump(self.handle)?.into_bytes());
        }
        let text = self.text.as_deref().unwrap_or_default();
        let rest = &text[self.offset.min(text.len())..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.offset += n;
        Ok(n)
    }

    /// Drops the captured text so the next read takes a fresh dump.
    pub fn rewind(&mut self) {
        self.text = None;
        self.offset = 0;
    }
}
