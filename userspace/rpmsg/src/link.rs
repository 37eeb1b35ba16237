// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-co-processor link state: handshake, signaling and interrupt entry
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/transport.rs
//!
//! Each remote core has a static [`CoreProfile`]: its byte order, ring
//! header layout, where its sync flag and notify word live in the shared
//! IPC block, and which interrupt register bits belong to it.
//!
//! The sync flag and notify word are big-endian in shared memory. The
//! notify word is mutated by both cores; when a hardware lock is configured
//! every read-modify-write of it happens under that lock. Without one the
//! two cores can race on it and a notify or feedback bit may be lost; the
//! next interrupt recovers the ring state, only the bit is stale.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, info, warn};
use rpmsg_hal::{HwLock, Regmap};
use serde::Deserialize;
use thiserror::Error;

use crate::budget::{self, CancelToken, Clock, PollOutcome};
use crate::channel::Channel;
use crate::dispatch::{self, DispatchError, DrainReport};
use crate::ring::{RingError, RingLayout, ShmWindow};
use crate::wire::ByteOrder;

/// Value written to the sync flag before the handshake.
pub const SYNC_SENTINEL: u32 = 0xffff_ffff;

/// Interrupt trigger register (set/clear style).
pub const SB2_INT: u32 = 0xa80;
/// Interrupt enable register (set/clear style).
pub const SB2_INT_EN: u32 = 0xa84;
/// Interrupt status register (set/clear style).
pub const SB2_INT_ST: u32 = 0xa88;
/// Video-encode core trigger register.
pub const VE3_INT_TRIGGER: u32 = 0x78;
/// Video-encode core interrupt enable register.
pub const VE3_INT_EN: u32 = 0x7c;
/// Video-encode core interrupt status register.
pub const VE3_INT_ST: u32 = 0x88;
/// Video-encode core end-of-interrupt register.
pub const VE3_INT_EOI: u32 = 0xe0;

bitflags! {
    /// Bits of set/clear style interrupt registers. Bit 0 selects whether
    /// the other written bits are set (1) or cleared (0).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct IntrBits: u32 {
        /// Write-data bit.
        const WRITE_DATA = 1 << 0;
        /// Audio core line.
        const ACPU = 1 << 1;
        /// Video core line.
        const VCPU = 1 << 2;
        /// First DSP line.
        const HIFI = 1 << 4;
        /// Second DSP line.
        const HIFI1 = 1 << 5;
    }
}

bitflags! {
    /// Bits of a notify word, after big-endian decoding.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct NotifyBits: u32 {
        /// Video/encode core announces data.
        const VIDEO_NOTIFY = 1 << 0;
        /// Video/encode core acknowledges ours.
        const VIDEO_FEEDBACK = 1 << 1;
        /// We announce data to the video/encode core.
        const HOST_VIDEO_NOTIFY = 1 << 2;
        /// We acknowledge the video/encode core.
        const HOST_VIDEO_FEEDBACK = 1 << 3;
        /// We announce data to the audio core.
        const HOST_AUDIO_NOTIFY = 1 << 8;
        /// We acknowledge the audio core.
        const HOST_AUDIO_FEEDBACK = 1 << 9;
        /// Audio core announces data.
        const AUDIO_NOTIFY = 1 << 24;
        /// Audio core acknowledges ours.
        const AUDIO_FEEDBACK = 1 << 25;
    }
}

/// Co-processors reachable over rpmsg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteCore {
    /// Audio firmware core.
    Audio,
    /// Video firmware core.
    Video,
    /// Video-encode core.
    Ve3,
    /// First DSP.
    Hifi,
    /// Second DSP.
    Hifi1,
    /// Auxiliary control core.
    Kr4,
}

impl RemoteCore {
    /// Every core, in profile order.
    pub const ALL: [RemoteCore; 6] =
        [Self::Audio, Self::Video, Self::Ve3, Self::Hifi, Self::Hifi1, Self::Kr4];

    /// Static hardware profile.
    pub fn profile(self) -> &'static CoreProfile {
        match self {
            Self::Audio => &AUDIO,
            Self::Video => &VIDEO,
            Self::Ve3 => &VE3,
            Self::Hifi => &HIFI,
            Self::Hifi1 => &HIFI1,
            Self::Kr4 => &KR4,
        }
    }
}

impl fmt::Display for RemoteCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.profile().name)
    }
}

/// How the interrupt registers of a core are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqStyle {
    /// Shared SB2 block with set/clear writes.
    SetClear,
    /// Video-encode private block with plain writes.
    Direct,
}

/// Location and meaning of a core's notify word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyProfile {
    /// Offset in the IPC block.
    pub word: u32,
    /// Set by the peer when it queued data for us.
    pub from_notify: NotifyBits,
    /// Set by us to acknowledge the peer.
    pub from_feedback: NotifyBits,
    /// Set by us when we queued data.
    pub to_notify: NotifyBits,
    /// Set by the peer to acknowledge us.
    pub to_feedback: NotifyBits,
}

/// Static description of one co-processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreProfile {
    /// Which core.
    pub core: RemoteCore,
    /// Name used in logs and dumps.
    pub name: &'static str,
    /// Byte order of RPC header words.
    pub order: ByteOrder,
    /// Ring header layout.
    pub layout: RingLayout,
    /// Offset of the sync flag in the IPC block.
    pub sync_flag: u32,
    /// Notify word, if the core has one.
    pub notify: Option<NotifyProfile>,
    /// Register style.
    pub irq: IrqStyle,
    /// Bit written to interrupt the core.
    pub to_bit: IntrBits,
    /// Status bit raised by the core.
    pub from_bit: IntrBits,
    /// Enable bit for the core's line.
    pub enable: IntrBits,
}

const VIDEO_NOTIFY_BITS: (NotifyBits, NotifyBits, NotifyBits, NotifyBits) = (
    NotifyBits::VIDEO_NOTIFY,
    NotifyBits::HOST_VIDEO_FEEDBACK,
    NotifyBits::HOST_VIDEO_NOTIFY,
    NotifyBits::VIDEO_FEEDBACK,
);

static AUDIO: CoreProfile = CoreProfile {
    core: RemoteCore::Audio,
    name: "acpu-rpc",
    order: ByteOrder::Big,
    layout: RingLayout::Av,
    sync_flag: 12,
    notify: Some(NotifyProfile {
        word: 64,
        from_notify: NotifyBits::AUDIO_NOTIFY,
        from_feedback: NotifyBits::HOST_AUDIO_FEEDBACK,
        to_notify: NotifyBits::HOST_AUDIO_NOTIFY,
        to_feedback: NotifyBits::AUDIO_FEEDBACK,
    }),
    irq: IrqStyle::SetClear,
    to_bit: IntrBits::ACPU,
    from_bit: IntrBits::ACPU,
    enable: IntrBits::ACPU,
};

static VIDEO: CoreProfile = CoreProfile {
    core: RemoteCore::Video,
    name: "vcpu-rpc",
    order: ByteOrder::Big,
    layout: RingLayout::Av,
    sync_flag: 148,
    notify: Some(NotifyProfile {
        word: 152,
        from_notify: VIDEO_NOTIFY_BITS.0,
        from_feedback: VIDEO_NOTIFY_BITS.1,
        to_notify: VIDEO_NOTIFY_BITS.2,
        to_feedback: VIDEO_NOTIFY_BITS.3,
    }),
    irq: IrqStyle::SetClear,
    to_bit: IntrBits::VCPU,
    from_bit: IntrBits::VCPU,
    enable: IntrBits::VCPU,
};

static VE3: CoreProfile = CoreProfile {
    core: RemoteCore::Ve3,
    name: "ve3-rpc",
    order: ByteOrder::Big,
    layout: RingLayout::Av,
    sync_flag: 188,
    notify: Some(NotifyProfile {
        word: 192,
        from_notify: VIDEO_NOTIFY_BITS.0,
        from_feedback: VIDEO_NOTIFY_BITS.1,
        to_notify: VIDEO_NOTIFY_BITS.2,
        to_feedback: VIDEO_NOTIFY_BITS.3,
    }),
    irq: IrqStyle::Direct,
    to_bit: IntrBits::from_bits_retain(1 << 0),
    from_bit: IntrBits::from_bits_retain(1 << 4),
    enable: IntrBits::from_bits_retain(1 << 4),
};

static HIFI: CoreProfile = CoreProfile {
    core: RemoteCore::Hifi,
    name: "hifi-rpc",
    order: ByteOrder::Little,
    layout: RingLayout::Hifi,
    sync_flag: 316,
    notify: None,
    irq: IrqStyle::SetClear,
    to_bit: IntrBits::HIFI,
    from_bit: IntrBits::HIFI,
    enable: IntrBits::HIFI,
};

static HIFI1: CoreProfile = CoreProfile {
    core: RemoteCore::Hifi1,
    name: "hifi1-rpc",
    order: ByteOrder::Little,
    layout: RingLayout::Hifi,
    sync_flag: 828,
    notify: None,
    irq: IrqStyle::SetClear,
    to_bit: IntrBits::HIFI1,
    from_bit: IntrBits::HIFI1,
    enable: IntrBits::HIFI1,
};

static KR4: CoreProfile = CoreProfile {
    core: RemoteCore::Kr4,
    name: "kr4-rpc",
    order: ByteOrder::Little,
    layout: RingLayout::Kr4,
    sync_flag: 956,
    notify: None,
    irq: IrqStyle::SetClear,
    to_bit: IntrBits::ACPU,
    from_bit: IntrBits::ACPU,
    enable: IntrBits::ACPU,
};

/// Handshake state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkStatus {
    /// No handshake attempted yet.
    Uninitialized = 0,
    /// The remote firmware answered.
    Connected = 1,
    /// The handshake timed out.
    Disconnected = 2,
}

impl LinkStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connected,
            2 => Self::Disconnected,
            _ => Self::Uninitialized,
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Connected => f.write_str("connected"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Errors raised by link operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// Shutdown was requested during the handshake.
    #[error("handshake cancelled")]
    Cancelled,
    /// Status may only leave `uninitialized`.
    #[error("link cannot move from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: LinkStatus,
        /// Requested status.
        to: LinkStatus,
    },
    /// Sync flag or notify word is outside the shared window.
    #[error("shared flag access failed")]
    Shm(#[from] RingError),
    /// An IPC word offset runs past the end of the address space.
    #[error("IPC word {base:#x}+{offset:#x} exceeds the address space")]
    IpcOutOfRange {
        /// IPC block base.
        base: u32,
        /// Word offset.
        offset: u32,
    },
}

/// Tunables of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkParams {
    /// Declare the link connected without waiting for the peer.
    pub skip_handshake: bool,
    /// Number of sync-flag polls.
    pub handshake_polls: u32,
    /// Sleep between polls.
    pub handshake_interval: Duration,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            skip_handshake: false,
            handshake_polls: 3000,
            handshake_interval: Duration::from_millis(1),
        }
    }
}

/// Result of one drain performed from the interrupt entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDrain {
    /// Channel name.
    pub channel: String,
    /// Drain outcome.
    pub result: Result<DrainReport, DispatchError>,
}

/// What [`RemoteLink::on_interrupt`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Neither a feedback bit nor our status bit was set.
    Spurious,
    /// Every channel was drained.
    Handled(Vec<ChannelDrain>),
}

struct NotifyGuard<'a> {
    lock: Option<&'a dyn HwLock>,
}

impl Drop for NotifyGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            lock.unlock();
        }
    }
}

/// Link to one co-processor.
pub struct RemoteLink {
    profile: &'static CoreProfile,
    window: ShmWindow,
    ipc_base: u32,
    regmap: Arc<dyn Regmap>,
    hwlock: Option<Arc<dyn HwLock>>,
    params: LinkParams,
    status: AtomicU8,
}

impl RemoteLink {
    /// Creates an uninitialized link. `ipc_base` is the physical address of
    /// the shared IPC block holding sync flags and notify words.
    pub fn new(
        core: RemoteCore,
        window: ShmWindow,
        ipc_base: u32,
        regmap: Arc<dyn Regmap>,
        hwlock: Option<Arc<dyn HwLock>>,
        params: LinkParams,
    ) -> Self {
        Self {
            profile: core.profile(),
            window,
            ipc_base,
            regmap,
            hwlock,
            params,
            status: AtomicU8::new(LinkStatus::Uninitialized as u8),
        }
    }

    /// Core profile.
    pub fn profile(&self) -> &'static CoreProfile {
        self.profile
    }

    /// Core name.
    pub fn name(&self) -> &'static str {
        self.profile.name
    }

    /// Byte order of the link.
    pub fn order(&self) -> ByteOrder {
        self.profile.order
    }

    /// Handshake tunables.
    pub fn params(&self) -> LinkParams {
        self.params
    }

    /// Shared window the link's rings live in.
    pub fn window(&self) -> &ShmWindow {
        &self.window
    }

    /// Current status.
    pub fn status(&self) -> LinkStatus {
        LinkStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn transition(&self, to: LinkStatus) -> Result<(), LinkError> {
        let from = LinkStatus::Uninitialized as u8;
        self.status
            .compare_exchange(from, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|raw| LinkError::InvalidTransition { from: LinkStatus::from_u8(raw), to })
    }

    /// Returns the link to `Uninitialized` ahead of a new handshake.
    pub fn reset(&self) {
        self.status.store(LinkStatus::Uninitialized as u8, Ordering::Release);
    }

    fn ipc_word(&self, offset: u32) -> Result<u32, LinkError> {
        let base = self.ipc_base;
        base.checked_add(offset).ok_or(LinkError::IpcOutOfRange { base, offset })
    }

    /// Physical address of the sync flag.
    pub fn sync_flag_addr(&self) -> Result<u32, LinkError> {
        self.ipc_word(self.profile.sync_flag)
    }

    /// Current sync flag value.
    pub fn sync_flag(&self) -> Result<u32, LinkError> {
        Ok(self.window.read_word(self.sync_flag_addr()?, ByteOrder::Big)?)
    }

    /// Physical address of the notify word, if the core has one.
    pub fn notify_addr(&self) -> Result<Option<u32>, LinkError> {
        self.profile.notify.map(|n| self.ipc_word(n.word)).transpose()
    }

    /// Current notify bits, if the core has a notify word.
    pub fn notify_bits(&self) -> Result<Option<NotifyBits>, LinkError> {
        match self.notify_addr()? {
            Some(addr) => {
                let raw = self.window.read_word(addr, ByteOrder::Big)?;
                Ok(Some(NotifyBits::from_bits_retain(raw)))
            }
            None => Ok(None),
        }
    }

    fn lock_notify(&self) -> NotifyGuard<'_> {
        let lock = self.hwlock.as_deref();
        if let Some(lock) = lock {
            lock.lock();
        }
        NotifyGuard { lock }
    }

    /// Read-modify-write of the notify word under the hardware lock.
    /// Returns the bits seen before the update.
    fn update_notify(
        &self,
        f: impl FnOnce(&NotifyProfile, NotifyBits) -> NotifyBits,
    ) -> Result<Option<NotifyBits>, LinkError> {
        let (Some(profile), Some(addr)) = (self.profile.notify.as_ref(), self.notify_addr()?) else {
            return Ok(None);
        };
        let _guard = self.lock_notify();
        let before = NotifyBits::from_bits_retain(self.window.read_word(addr, ByteOrder::Big)?);
        let after = f(profile, before);
        if after != before {
            self.window.write_word(addr, after.bits(), ByteOrder::Big)?;
        }
        Ok(Some(before))
    }

    fn trigger(&self) {
        match self.profile.irq {
            IrqStyle::SetClear => {
                self.regmap.write(SB2_INT, (self.profile.to_bit | IntrBits::WRITE_DATA).bits())
            }
            IrqStyle::Direct => self.regmap.write(VE3_INT_TRIGGER, self.profile.to_bit.bits()),
        }
    }

    fn interrupt_status(&self) -> IntrBits {
        let reg = match self.profile.irq {
            IrqStyle::SetClear => SB2_INT_ST,
            IrqStyle::Direct => VE3_INT_ST,
        };
        IntrBits::from_bits_retain(self.regmap.read(reg))
    }

    fn clear_status(&self, status: IntrBits) {
        match self.profile.irq {
            IrqStyle::SetClear => self.regmap.write(SB2_INT_ST, self.profile.from_bit.bits()),
            IrqStyle::Direct => {
                self.regmap.write(VE3_INT_ST, (status - self.profile.from_bit).bits());
                self.regmap.write(VE3_INT_EOI, 0);
            }
        }
    }

    /// Unmasks the core's interrupt line.
    pub fn enable_interrupts(&self) {
        match self.profile.irq {
            IrqStyle::SetClear => {
                self.regmap.write(SB2_INT_EN, (self.profile.enable | IntrBits::WRITE_DATA).bits())
            }
            IrqStyle::Direct => {
                let current = self.regmap.read(VE3_INT_EN);
                self.regmap.write(VE3_INT_EN, current | self.profile.enable.bits());
            }
        }
    }

    /// Masks the core's interrupt line.
    pub fn disable_interrupts(&self) {
        match self.profile.irq {
            IrqStyle::SetClear => self.regmap.write(SB2_INT_EN, self.profile.enable.bits()),
            IrqStyle::Direct => {
                let current = self.regmap.read(VE3_INT_EN);
                self.regmap.write(VE3_INT_EN, current & !self.profile.enable.bits());
            }
        }
    }

    /// Masks the line across system suspend.
    pub fn suspend(&self) {
        debug!("rpmsg: {} suspend", self.name());
        self.disable_interrupts();
    }

    /// Unmasks the line after resume.
    pub fn resume(&self) {
        debug!("rpmsg: {} resume", self.name());
        self.enable_interrupts();
    }

    /// Masks the line for good; used on unregister.
    pub fn shutdown(&self) {
        self.disable_interrupts();
    }

    /// Boot handshake: announce readiness, then wait (bounded, cancellable)
    /// for the firmware to overwrite the sentinel.
    pub fn connect(
        &self,
        clock: &dyn Clock,
        cancel: &CancelToken,
    ) -> Result<LinkStatus, LinkError> {
        let current = self.status();
        if current != LinkStatus::Uninitialized {
            return Err(LinkError::InvalidTransition { from: current, to: LinkStatus::Connected });
        }
        self.enable_interrupts();
        self.update_notify(|p, bits| bits | p.to_notify)?;
        self.window.write_word(self.sync_flag_addr()?, SYNC_SENTINEL, ByteOrder::Big)?;
        self.trigger();

        if self.params.skip_handshake {
            debug!("rpmsg: {} skips the handshake check", self.name());
            self.transition(LinkStatus::Connected)?;
            return Ok(LinkStatus::Connected);
        }

        let mut fault = None;
        let outcome = budget::poll_bounded(
            clock,
            cancel,
            self.params.handshake_polls,
            self.params.handshake_interval,
            || match self.sync_flag() {
                Ok(flag) => flag != SYNC_SENTINEL,
                Err(err) => {
                    fault = Some(err);
                    true
                }
            },
        );
        if let Some(err) = fault {
            return Err(err);
        }
        let status = match outcome {
            PollOutcome::Ready => LinkStatus::Connected,
            PollOutcome::Exhausted => LinkStatus::Disconnected,
            PollOutcome::Cancelled => return Err(LinkError::Cancelled),
        };
        self.transition(status)?;
        let flag = self.sync_flag()?;
        match status {
            LinkStatus::Connected => info!("rpmsg: {} OK (SYNC_FLAG = {flag:#010x})", self.name()),
            _ => warn!("rpmsg: {} timeout (SYNC_FLAG = {flag:#010x})", self.name()),
        }
        Ok(status)
    }

    /// Tells the peer new data is queued: acknowledge its last feedback,
    /// raise our notify bit, then write the trigger register.
    pub fn signal_remote(&self) -> Result<(), LinkError> {
        self.update_notify(|p, bits| (bits - p.to_feedback) | p.to_notify)?;
        self.trigger();
        Ok(())
    }

    /// Interrupt entry point: filters spurious interrupts, acknowledges the
    /// status bit and drains every channel of the link.
    pub fn on_interrupt(&self, channels: &[Arc<Channel>]) -> Result<InterruptOutcome, LinkError> {
        let status = self.interrupt_status();
        let feedback = self.update_notify(|p, bits| bits - p.to_feedback)?;
        let ours = match (feedback, self.profile.notify) {
            (None, _) | (_, None) => true,
            (Some(bits), Some(p)) => bits.intersects(p.to_feedback),
        };
        let raised = status.intersects(self.profile.from_bit);
        self.clear_status(status);
        if !ours && !raised {
            debug!("rpmsg: {} spurious interrupt (status {:#x})", self.name(), status.bits());
            return Ok(InterruptOutcome::Spurious);
        }

        let order = self.order();
        let drains = channels
            .iter()
            .map(|ch| ChannelDrain {
                channel: ch.name().to_string(),
                result: dispatch::drain(ch, order),
            })
            .collect();
        self.update_notify(|p, bits| {
            if bits.intersects(p.from_notify) {
                bits | p.from_feedback
            } else {
                bits
            }
        })?;
        Ok(InterruptOutcome::Handled(drains))
    }
}

impl fmt::Debug for RemoteLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteLink")
            .field("core", &self.profile.core)
            .field("status", &self.status())
            .field("hwlock", &self.hwlock.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::ManualClock;
    use crate::host::{HostRegmap, HostShm};
    use rpmsg_sync::HwSpinLock;

    const IPC: u32 = 0x1000;

    fn link(core: RemoteCore, params: LinkParams, lock: bool) -> (RemoteLink, Arc<HostRegmap>) {
        let regs = Arc::new(HostRegmap::new());
        let window = ShmWindow::new(Arc::new(HostShm::new(0x1000)), IPC);
        let hwlock: Option<Arc<dyn HwLock>> =
            if lock { Some(Arc::new(HwSpinLock::new())) } else { None };
        (RemoteLink::new(core, window, IPC, regs.clone(), hwlock, params), regs)
    }

    #[test]
    fn profiles_match_core_conventions() {
        for core in RemoteCore::ALL {
            let p = core.profile();
            assert_eq!(p.core, core);
            let big = matches!(core, RemoteCore::Audio | RemoteCore::Video | RemoteCore::Ve3);
            assert_eq!(p.order == ByteOrder::Big, big);
            assert_eq!(p.notify.is_some(), big);
        }
        assert_eq!(RemoteCore::Kr4.profile().layout, RingLayout::Kr4);
        assert_eq!(RemoteCore::Hifi1.to_string(), "hifi1-rpc");
    }

    #[test]
    fn skip_handshake_connects_immediately() {
        let params = LinkParams { skip_handshake: true, ..LinkParams::default() };
        let (link, regs) = link(RemoteCore::Hifi, params, false);
        let clock = ManualClock::new();
        assert_eq!(link.connect(&clock, &CancelToken::new()), Ok(LinkStatus::Connected));
        assert_eq!(clock.sleeps(), 0);
        assert_eq!(link.sync_flag().unwrap(), SYNC_SENTINEL);
        assert!(regs.writes().contains(&(SB2_INT, (IntrBits::HIFI | IntrBits::WRITE_DATA).bits())));
        assert!(regs.read(SB2_INT_EN) & IntrBits::HIFI.bits() != 0);
    }

    #[test]
    fn silent_peer_times_out() {
        let params = LinkParams { handshake_polls: 5, ..LinkParams::default() };
        let (link, _) = link(RemoteCore::Audio, params, true);
        let clock = ManualClock::new();
        assert_eq!(link.connect(&clock, &CancelToken::new()), Ok(LinkStatus::Disconnected));
        assert_eq!(clock.sleeps(), 5);
        assert!(link.connect(&clock, &CancelToken::new()).is_err());
        assert_eq!(link.status(), LinkStatus::Disconnected);
    }

    #[test]
    fn cancelled_handshake_stays_uninitialized() {
        let (link, _) = link(RemoteCore::Video, LinkParams::default(), false);
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(link.connect(&ManualClock::new(), &token), Err(LinkError::Cancelled));
        assert_eq!(link.status(), LinkStatus::Uninitialized);
    }

    #[test]
    fn signal_clears_feedback_and_sets_notify() {
        let (link, regs) = link(RemoteCore::Audio, LinkParams::default(), true);
        let addr = link.notify_addr().unwrap().unwrap();
        link.window().write_word(addr, NotifyBits::AUDIO_FEEDBACK.bits(), ByteOrder::Big).unwrap();
        link.signal_remote().unwrap();
        assert_eq!(link.notify_bits().unwrap(), Some(NotifyBits::HOST_AUDIO_NOTIFY));
        assert_eq!(regs.writes().last(), Some(&(SB2_INT, 0x3)));
    }

    #[test]
    fn ve3_uses_direct_registers() {
        let (link, regs) = link(RemoteCore::Ve3, LinkParams::default(), false);
        regs.write(VE3_INT_EN, 0x1);
        link.enable_interrupts();
        assert_eq!(regs.read(VE3_INT_EN), 0x11);
        link.signal_remote().unwrap();
        assert_eq!(regs.read(VE3_INT_TRIGGER), 0x1);
        link.suspend();
        assert_eq!(regs.read(VE3_INT_EN), 0x1);
    }

    #[test]
    fn ipc_words_past_address_space_are_rejected() {
        let base = 0xffff_fff0;
        let window = ShmWindow::new(Arc::new(HostShm::new(0x10)), base);
        let link = RemoteLink::new(
            RemoteCore::Audio,
            window,
            base,
            Arc::new(HostRegmap::new()),
            None,
            LinkParams::default(),
        );
        assert_eq!(link.sync_flag_addr(), Ok(0xffff_fffc));
        let overflow = LinkError::IpcOutOfRange { base, offset: 64 };
        assert_eq!(link.notify_addr(), Err(overflow.clone()));
        assert_eq!(link.connect(&ManualClock::new(), &CancelToken::new()), Err(overflow));
        assert_eq!(link.status(), LinkStatus::Uninitialized);
    }

    #[test]
    fn interrupt_without_cause_is_spurious() {
        let (link, _) = link(RemoteCore::Audio, LinkParams::default(), false);
        assert_eq!(link.on_interrupt(&[]), Ok(InterruptOutcome::Spurious));
    }

    #[test]
    fn raised_status_is_cleared_and_handled() {
        let (link, regs) = link(RemoteCore::Audio, LinkParams::default(), false);
        regs.raise(SB2_INT_ST, IntrBits::ACPU.bits());
        let addr = link.notify_addr().unwrap().unwrap();
        link.window().write_word(addr, NotifyBits::AUDIO_NOTIFY.bits(), ByteOrder::Big).unwrap();
        assert_eq!(link.on_interrupt(&[]), Ok(InterruptOutcome::Handled(Vec::new())));
        assert_eq!(regs.read(SB2_INT_ST) & IntrBits::ACPU.bits(), 0);
        assert_eq!(
            link.notify_bits().unwrap(),
            Some(NotifyBits::AUDIO_NOTIFY | NotifyBits::HOST_AUDIO_FEEDBACK)
        );
    }

    #[test]
    fn cores_without_notify_word_always_handle() {
        let (link, _) = link(RemoteCore::Kr4, LinkParams::default(), false);
        assert!(matches!(link.on_interrupt(&[]), Ok(InterruptOutcome::Handled(_))));
    }
}
