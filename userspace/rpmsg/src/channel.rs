// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Channels and the endpoint registry.
//!
//! A channel pairs one TX ring with one RX ring and keeps the local
//! endpoints addressable on it. Endpoints live behind `Arc`: the registry
//! holds one reference, every handle and every in-flight delivery hold
//! others, so removing an endpoint while a callback runs is safe and the
//! last reference frees it.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;

use crate::dispatch::DrainGate;
use crate::link::RemoteLink;
use crate::ring::{RxRing, TxRing};
use crate::transmit::{self, SendError};
use crate::wire::{ByteOrder, DispatchKey, WireMessage};

/// Address of the endpoint receiving remote-allocated requests.
pub const REMOTE_ALLOC_ADDR: u32 = 0xffff_ffff;

/// Task-id addresses handed out on kernel channels.
pub const TASK_ID_RANGE: Range<u32> = 0x0f00_0000..0x0fff_ffff;

/// Errors returned to endpoint-creation callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Every task id in the range is live.
    #[error("no free endpoint address on channel {0}")]
    AddressSpaceExhausted(String),
    /// The derived address already has a live endpoint.
    #[error("address {addr:#x} already in use on channel {channel}")]
    AddressInUse {
        /// Channel name.
        channel: String,
        /// Colliding address.
        addr: u32,
    },
    /// Requested dispatch mode differs from the channel's.
    #[error("channel {channel} dispatches {actual}, not {requested}")]
    ModeMismatch {
        /// Channel name.
        channel: String,
        /// Mode asked for.
        requested: DispatchMode,
        /// Mode configured.
        actual: DispatchMode,
    },
    /// The handle is not (or no longer) registered here.
    #[error("endpoint {addr:#x} not registered on channel {channel}")]
    NotRegistered {
        /// Channel name.
        channel: String,
        /// Endpoint address.
        addr: u32,
    },
}

/// How incoming messages find their endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// Addresses come from the task-id allocator (kernel clients).
    ByTaskId,
    /// Addresses are requester process ids.
    ByProcessId,
}

impl DispatchMode {
    /// Kernel channels dispatch by task id, everything else by process.
    pub fn for_channel_name(name: &str) -> Self {
        if name.contains("kernel") {
            Self::ByTaskId
        } else {
            Self::ByProcessId
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByTaskId => f.write_str("by-task-id"),
            Self::ByProcessId => f.write_str("by-process-id"),
        }
    }
}

/// Maps a thread id to the id of its owning process.
pub trait ProcessResolver: Send + Sync {
    /// Returns the process owning `tid`.
    fn owning_process(&self, tid: u32) -> u32;
}

/// Treats every id as its own process.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityResolver;

impl ProcessResolver for IdentityResolver {
    fn owning_process(&self, tid: u32) -> u32 {
        tid
    }
}

/// One received message as handed to a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Decoded message.
    pub message: WireMessage,
    /// Byte order of the link it arrived on.
    pub order: ByteOrder,
}

/// Receive callback.
pub type Callback = Box<dyn Fn(&Delivery) + Send + Sync>;

/// A local destination on a channel.
pub struct Endpoint {
    addr: u32,
    channel: String,
    callback: Callback,
}

impl Endpoint {
    /// Address peers use to reach this endpoint.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Name of the owning channel.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub(crate) fn deliver(&self, delivery: &Delivery) {
        (self.callback)(delivery);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("addr", &self.addr)
            .field("channel", &self.channel)
            .finish()
    }
}

/// Owned, reference-counted endpoint handle.
#[derive(Debug, Clone)]
pub struct EndpointHandle(Arc<Endpoint>);

impl EndpointHandle {
    /// Endpoint address.
    pub fn addr(&self) -> u32 {
        self.0.addr
    }

    /// Owning channel name.
    pub fn channel(&self) -> &str {
        &self.0.channel
    }

    /// Live references, registry included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Identity of the caller opening an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointRequest {
    /// Calling thread id (process-id channels resolve it to a process).
    pub tid: u32,
    /// Bind the channel's remote-alloc slot instead of an address.
    pub remote_alloc: bool,
}

impl EndpointRequest {
    /// Request from thread `tid`.
    pub fn from_thread(tid: u32) -> Self {
        Self { tid, remote_alloc: false }
    }

    /// Request for the remote-alloc slot.
    pub fn remote_alloc() -> Self {
        Self { tid: 0, remote_alloc: true }
    }
}

/// Cyclic allocator over a bounded address range.
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    range: Range<u32>,
    next: u32,
}

impl AddressAllocator {
    /// Allocates from `range`, starting at its first value.
    pub fn new(range: Range<u32>) -> Self {
        Self { next: range.start, range }
    }

    /// Returns the next address not present in `live`.
    fn allocate<V>(&mut self, live: &BTreeMap<u32, V>) -> Option<u32> {
        let span = self.range.end.checked_sub(self.range.start)?;
        for _ in 0..span {
            let candidate = self.next;
            self.next = if candidate + 1 >= self.range.end {
                self.range.start
            } else {
                candidate + 1
            };
            if !live.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

struct Registry {
    by_addr: BTreeMap<u32, Arc<Endpoint>>,
    remote_alloc: Option<Arc<Endpoint>>,
    allocator: AddressAllocator,
}

/// Static description of a channel.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    /// Unique name within the link.
    pub name: String,
    /// Dispatch mode; defaults from the name when `None`.
    pub mode: Option<DispatchMode>,
    /// Task-id range for [`DispatchMode::ByTaskId`].
    pub task_ids: Range<u32>,
}

impl ChannelSpec {
    /// Spec with defaults derived from `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), mode: None, task_ids: TASK_ID_RANGE }
    }
}

/// A named conversation with one remote core.
pub struct Channel {
    name: String,
    mode: DispatchMode,
    tx: TxRing,
    rx: RxRing,
    registry: Mutex<Registry>,
    tx_lock: Mutex<()>,
    pub(crate) gate: DrainGate,
    faulted: AtomicBool,
    resolver: Arc<dyn ProcessResolver>,
}

impl Channel {
    /// Builds a channel over already formatted rings.
    pub fn new(
        spec: ChannelSpec,
        tx: TxRing,
        rx: RxRing,
        resolver: Arc<dyn ProcessResolver>,
    ) -> Self {
        let mode = spec.mode.unwrap_or_else(|| DispatchMode::for_channel_name(&spec.name));
        Self {
            name: spec.name,
            mode,
            tx,
            rx,
            registry: Mutex::new(Registry {
                by_addr: BTreeMap::new(),
                remote_alloc: None,
                allocator: AddressAllocator::new(spec.task_ids),
            }),
            tx_lock: Mutex::new(()),
            gate: DrainGate::default(),
            faulted: AtomicBool::new(false),
            resolver,
        }
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dispatch mode.
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Producer view of the TX ring.
    pub fn tx(&self) -> &TxRing {
        &self.tx
    }

    /// Consumer view of the RX ring.
    pub fn rx(&self) -> &RxRing {
        &self.rx
    }

    pub(crate) fn tx_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.tx_lock.lock()
    }

    /// True once a desync was detected; cleared only by [`Channel::reset_fault`].
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_faulted(&self) {
        self.faulted.store(true, Ordering::Release);
    }

    /// Clears the fault after an external re-handshake.
    pub fn reset_fault(&self) {
        self.faulted.store(false, Ordering::Release);
    }

    /// Registers an endpoint.
    pub fn create_endpoint(
        &self,
        mode: DispatchMode,
        request: EndpointRequest,
        callback: Callback,
    ) -> Result<EndpointHandle, ChannelError> {
        if mode != self.mode {
            return Err(ChannelError::ModeMismatch {
                channel: self.name.clone(),
                requested: mode,
                actual: self.mode,
            });
        }
        let mut reg = self.registry.lock();
        let in_use = |addr| ChannelError::AddressInUse { channel: self.name.clone(), addr };
        if request.remote_alloc {
            if reg.remote_alloc.is_some() {
                return Err(in_use(REMOTE_ALLOC_ADDR));
            }
            let ept = self.endpoint(REMOTE_ALLOC_ADDR, callback);
            reg.remote_alloc = Some(Arc::clone(&ept));
            return Ok(EndpointHandle(ept));
        }
        let addr = match self.mode {
            DispatchMode::ByTaskId => {
                let Registry { by_addr, allocator, .. } = &mut *reg;
                allocator
                    .allocate(by_addr)
                    .ok_or_else(|| ChannelError::AddressSpaceExhausted(self.name.clone()))?
            }
            DispatchMode::ByProcessId => {
                let pid = self.resolver.owning_process(request.tid);
                if reg.by_addr.contains_key(&pid) {
                    return Err(in_use(pid));
                }
                pid
            }
        };
        let ept = self.endpoint(addr, callback);
        reg.by_addr.insert(addr, Arc::clone(&ept));
        log::debug!("rpmsg: {} endpoint {:#x} created", self.name, addr);
        Ok(EndpointHandle(ept))
    }

    fn endpoint(&self, addr: u32, callback: Callback) -> Arc<Endpoint> {
        Arc::new(Endpoint { addr, channel: self.name.clone(), callback })
    }

    /// Removes the endpoint; in-flight deliveries keep their own reference.
    pub fn destroy_endpoint(&self, handle: EndpointHandle) -> Result<(), ChannelError> {
        let mut reg = self.registry.lock();
        let not_registered =
            || ChannelError::NotRegistered { channel: self.name.clone(), addr: handle.addr() };
        if reg.remote_alloc.as_ref().is_some_and(|e| Arc::ptr_eq(e, &handle.0)) {
            reg.remote_alloc = None;
            return Ok(());
        }
        match reg.by_addr.get(&handle.addr()) {
            Some(e) if Arc::ptr_eq(e, &handle.0) => {
                reg.by_addr.remove(&handle.addr());
                log::debug!("rpmsg: {} endpoint {:#x} destroyed", self.name, handle.addr());
                Ok(())
            }
            _ => Err(not_registered()),
        }
    }

    /// True while `handle` is still registered.
    pub fn is_registered(&self, handle: &EndpointHandle) -> bool {
        let reg = self.registry.lock();
        if handle.addr() == REMOTE_ALLOC_ADDR {
            return reg.remote_alloc.as_ref().is_some_and(|e| Arc::ptr_eq(e, &handle.0));
        }
        reg.by_addr.get(&handle.addr()).is_some_and(|e| Arc::ptr_eq(e, &handle.0))
    }

    /// Addresses of the live endpoints, ascending.
    pub fn endpoint_addresses(&self) -> Vec<u32> {
        let reg = self.registry.lock();
        let mut out: Vec<u32> = reg.by_addr.keys().copied().collect();
        if reg.remote_alloc.is_some() {
            out.push(REMOTE_ALLOC_ADDR);
        }
        out
    }

    /// Resolves `key` to an endpoint reference, if one is live.
    pub fn lookup(&self, key: DispatchKey) -> Option<Arc<Endpoint>> {
        let reg = self.registry.lock();
        match key {
            DispatchKey::Address(addr) => reg.by_addr.get(&addr).cloned(),
            DispatchKey::Process(pid) => {
                let addr = match self.mode {
                    DispatchMode::ByProcessId => self.resolver.owning_process(pid),
                    DispatchMode::ByTaskId => pid,
                };
                reg.by_addr.get(&addr).cloned()
            }
            DispatchKey::RemoteAlloc => reg.remote_alloc.clone(),
        }
    }

    /// Sends pre-encoded `payload` on behalf of `handle`.
    pub fn send(
        &self,
        link: &RemoteLink,
        handle: &EndpointHandle,
        payload: &[u8],
    ) -> Result<usize, SendError> {
        if !self.is_registered(handle) {
            return Err(SendError::EndpointClosed(handle.addr()));
        }
        transmit::send(link, self, payload)
    }

    /// Encodes `msg` in the link's order and sends it on behalf of `handle`.
    pub fn send_message(
        &self,
        link: &RemoteLink,
        handle: &EndpointHandle,
        msg: &WireMessage,
    ) -> Result<usize, SendError> {
        if !self.is_registered(handle) {
            return Err(SendError::EndpointClosed(handle.addr()));
        }
        transmit::send_message(link, self, msg)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("faulted", &self.is_faulted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostShm;
    use crate::ring::{RingBuffer, RingLayout, ShmWindow};
    use proptest::prelude::*;

    struct Tgid;

    impl ProcessResolver for Tgid {
        fn owning_process(&self, tid: u32) -> u32 {
            tid & !0xff
        }
    }

    fn channel(spec: ChannelSpec, resolver: Arc<dyn ProcessResolver>) -> Channel {
        let window = ShmWindow::new(Arc::new(HostShm::new(0x400)), 0x1000);
        let tx = RingBuffer::format(window.clone(), 0x1000, 0x1100, 0x80, RingLayout::Av).unwrap();
        let rx = RingBuffer::format(window, 0x1020, 0x1200, 0x80, RingLayout::Av).unwrap();
        Channel::new(spec, tx.producer(), rx.consumer(), resolver)
    }

    fn noop() -> Callback {
        Box::new(|_: &Delivery| {})
    }

    #[test]
    fn mode_defaults_from_name() {
        let kernel = channel(ChannelSpec::named("audio-kernel"), Arc::new(IdentityResolver));
        assert_eq!(kernel.mode(), DispatchMode::ByTaskId);
        let intr = channel(ChannelSpec::named("audio-intr"), Arc::new(IdentityResolver));
        assert_eq!(intr.mode(), DispatchMode::ByProcessId);
    }

    #[test]
    fn task_ids_are_sequential_and_wrap() {
        let spec = ChannelSpec { task_ids: 10..13, ..ChannelSpec::named("kernel") };
        let ch = channel(spec, Arc::new(IdentityResolver));
        let req = EndpointRequest::default();
        let a = ch.create_endpoint(DispatchMode::ByTaskId, req, noop()).unwrap();
        let b = ch.create_endpoint(DispatchMode::ByTaskId, req, noop()).unwrap();
        let c = ch.create_endpoint(DispatchMode::ByTaskId, req, noop()).unwrap();
        assert_eq!([a.addr(), b.addr(), c.addr()], [10, 11, 12]);
        assert_eq!(
            ch.create_endpoint(DispatchMode::ByTaskId, req, noop()).unwrap_err(),
            ChannelError::AddressSpaceExhausted("kernel".into())
        );
        ch.destroy_endpoint(b).unwrap();
        assert_eq!(ch.create_endpoint(DispatchMode::ByTaskId, req, noop()).unwrap().addr(), 11);
    }

    #[test]
    fn process_addresses_collide_per_process() {
        let ch = channel(ChannelSpec::named("video-intr"), Arc::new(Tgid));
        let by_pid = DispatchMode::ByProcessId;
        let first =
            ch.create_endpoint(by_pid, EndpointRequest::from_thread(0x1203), noop()).unwrap();
        assert_eq!(first.addr(), 0x1200);
        let err =
            ch.create_endpoint(by_pid, EndpointRequest::from_thread(0x1207), noop()).unwrap_err();
        assert_eq!(err, ChannelError::AddressInUse { channel: "video-intr".into(), addr: 0x1200 });
        assert_eq!(ch.lookup(DispatchKey::Process(0x1299)).map(|e| e.addr()), Some(0x1200));
    }

    #[test]
    fn remote_alloc_slot_is_single() {
        let ch = channel(ChannelSpec::named("audio-intr"), Arc::new(IdentityResolver));
        let by_pid = DispatchMode::ByProcessId;
        let slot = ch.create_endpoint(by_pid, EndpointRequest::remote_alloc(), noop()).unwrap();
        assert!(ch.create_endpoint(by_pid, EndpointRequest::remote_alloc(), noop()).is_err());
        assert!(ch.lookup(DispatchKey::RemoteAlloc).is_some());
        ch.destroy_endpoint(slot).unwrap();
        assert!(ch.lookup(DispatchKey::RemoteAlloc).is_none());
    }

    #[test]
    fn mismatched_mode_is_rejected() {
        let ch = channel(ChannelSpec::named("kernel"), Arc::new(IdentityResolver));
        let err = ch.create_endpoint(DispatchMode::ByProcessId, EndpointRequest::default(), noop());
        assert!(matches!(err, Err(ChannelError::ModeMismatch { .. })));
    }

    #[test]
    fn destroy_keeps_in_flight_reference_alive() {
        let ch = channel(ChannelSpec::named("kernel"), Arc::new(IdentityResolver));
        let handle =
            ch.create_endpoint(DispatchMode::ByTaskId, EndpointRequest::default(), noop()).unwrap();
        let in_flight = ch.lookup(DispatchKey::Address(handle.addr())).unwrap();
        let stale = handle.clone();
        ch.destroy_endpoint(handle).unwrap();
        assert_eq!(in_flight.addr(), stale.addr());
        assert_eq!(stale.ref_count(), 2);
        assert!(ch.destroy_endpoint(stale).is_err());
    }

    proptest! {
        #[test]
        fn live_task_ids_are_distinct(
            ops in proptest::collection::vec(any::<Option<usize>>(), 1..200),
        ) {
            let spec = ChannelSpec { task_ids: 100..164, ..ChannelSpec::named("kernel") };
            let ch = channel(spec, Arc::new(IdentityResolver));
            let mut live: Vec<EndpointHandle> = Vec::new();
            for op in ops {
                match op {
                    Some(i) if !live.is_empty() => {
                        let h = live.swap_remove(i % live.len());
                        ch.destroy_endpoint(h).unwrap();
                    }
                    _ => {
                        let req = EndpointRequest::default();
                        if let Ok(h) = ch.create_endpoint(DispatchMode::ByTaskId, req, noop()) {
                            live.push(h);
                        }
                    }
                }
                let mut addrs: Vec<u32> = live.iter().map(|h| h.addr()).collect();
                addrs.sort_unstable();
                addrs.dedup();
                prop_assert_eq!(addrs.len(), live.len());
                prop_assert_eq!(ch.endpoint_addresses().len(), live.len());
            }
        }
    }
}
