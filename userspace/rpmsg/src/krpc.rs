// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Blocking kernel RPC over a task-id channel
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/krpc.rs
//!
//! A [`KrpcAgent`] owns one task-id endpoint. [`KrpcAgent::call`] sends a
//! `KERNEL_ID` request whose context word is a fresh nonce and blocks until
//! the reply carrying that context arrives. Replies with any other context
//! belong to calls that already timed out and are discarded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::channel::{Delivery, DispatchMode, EndpointHandle, EndpointRequest};
use crate::control::{ControlError, ControlPlane, LinkHandle};
use crate::transmit::SendError;
use crate::wire::{RpcHeader, WireMessage, KERNEL_ID, REPLY_ID};

/// Default reply timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors returned by [`KrpcAgent`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KrpcError {
    /// Link or channel lookup failed.
    #[error(transparent)]
    Control(#[from] ControlError),
    /// The request could not be sent or no reply arrived in time.
    #[error(transparent)]
    Send(#[from] SendError),
    /// Kernel RPC needs a task-id channel.
    #[error("channel {0} does not dispatch by task id")]
    NotKernelChannel(String),
    /// The matching reply lacks the return-value word.
    #[error("reply to context {0:#x} has no return value")]
    MalformedReply(u32),
}

/// Monotonic context generator.
#[derive(Debug, Clone)]
pub struct NonceGen {
    next: u32,
}

impl NonceGen {
    /// Generator whose first nonce is `start`.
    pub const fn new(start: u32) -> Self {
        Self { next: start }
    }

    /// Returns the next nonce and advances.
    pub fn next_nonce(&mut self) -> u32 {
        let out = self.next;
        self.next = self.next.wrapping_add(1);
        out
    }
}

#[derive(Default)]
struct Queues {
    replies: VecDeque<Delivery>,
    requests: VecDeque<Delivery>,
}

#[derive(Default)]
struct Inbox {
    queues: Mutex<Queues>,
    ready: Condvar,
}

impl Inbox {
    fn push(&self, delivery: &Delivery) {
        let mut q = self.queues.lock();
        if delivery.message.header.program_id == REPLY_ID {
            q.replies.push_back(delivery.clone());
        } else {
            q.requests.push_back(delivery.clone());
        }
        self.ready.notify_all();
    }
}

/// Kernel-side RPC client bound to one channel.
pub struct KrpcAgent {
    plane: Arc<ControlPlane>,
    link: LinkHandle,
    channel: String,
    endpoint: EndpointHandle,
    inbox: Arc<Inbox>,
    calls: Mutex<NonceGen>,
}

impl KrpcAgent {
    /// Opens a task-id endpoint on `channel`. The link must be connected.
    pub fn open(
        plane: Arc<ControlPlane>,
        link: LinkHandle,
        channel: &str,
    ) -> Result<Self, KrpcError> {
        let instance = plane.link_for_client(link)?;
        if instance.channel(channel)?.mode() != DispatchMode::ByTaskId {
            return Err(KrpcError::NotKernelChannel(channel.to_string()));
        }
        let inbox = Arc::new(Inbox::default());
        let sink = Arc::clone(&inbox);
        let callback = Box::new(move |d: &Delivery| sink.push(d));
        let endpoint = plane.open(link, channel, EndpointRequest::default(), callback)?;
        debug!("krpc: {} endpoint {:#x} opened", channel, endpoint.addr());
        Ok(Self {
            plane,
            link,
            channel: channel.to_string(),
            endpoint,
            inbox,
            calls: Mutex::new(NonceGen::new(1)),
        })
    }

    /// Task id the agent sends from.
    pub fn addr(&self) -> u32 {
        self.endpoint.addr()
    }

    /// Calls `procedure` with `params` and returns the remote return value.
    /// Calls from several threads are serialized.
    pub fn call(
        &self,
        procedure: u32,
        params: &[u32],
        timeout: Duration,
    ) -> Result<u32, KrpcError> {
        let mut nonces = self.calls.lock();
        let context = nonces.next_nonce();
        let order = self.plane.instance(self.link)?.link().order();
        let addr = self.addr();

        let mut payload: Vec<u8> = params.iter().flat_map(|w| w.to_le_bytes()).collect();
        order.swap_words(&mut payload);
        let header = RpcHeader {
            program_id: KERNEL_ID,
            version_id: KERNEL_ID,
            procedure_id: procedure,
            task_id: addr,
            sys_tid: addr,
            sys_pid: addr,
            parameter_size: 0,
            context,
        };
        let request = WireMessage::new(header, payload);
        self.plane.send_message(self.link, &self.channel, &self.endpoint, &request)?;

        let deadline = Instant::now() + timeout;
        let mut q = self.inbox.queues.lock();
        loop {
            while let Some(reply) = q.replies.pop_front() {
                if reply.message.header.context == context {
                    return reply
                        .message
                        .payload_word(1, reply.order)
                        .ok_or(KrpcError::MalformedReply(context));
                }
                let stale = reply.message.header.context;
                debug!("krpc: dropping stale reply for context {stale:#x}");
            }
            if self.inbox.ready.wait_until(&mut q, deadline).timed_out() && q.replies.is_empty() {
                break;
            }
        }
        drop(q);
        error!(
            "krpc: procedure {procedure} on {} timed out after {timeout:?}\n{}",
            self.channel,
            self.plane.dump(self.link).unwrap_or_default()
        );
        Err(SendError::Timeout.into())
    }

    /// Waits up to `timeout` for a request the remote side addressed to
    /// this task.
    pub fn next_request(&self, timeout: Duration) -> Option<WireMessage> {
        let deadline = Instant::now() + timeout;
        let mut q = self.inbox.queues.lock();
        loop {
            if let Some(request) = q.requests.pop_front() {
                return Some(request.message);
            }
            if self.inbox.ready.wait_until(&mut q, deadline).timed_out() {
                return q.requests.pop_front().map(|d| d.message);
            }
        }
    }

    /// Answers `request` with `retval`. Requests with a zero task id expect
    /// no answer and are ignored.
    pub fn reply(&self, request: &RpcHeader, retval: u32) -> Result<(), KrpcError> {
        if request.task_id == 0 {
            return Ok(());
        }
        let order = self.plane.instance(self.link)?.link().order();
        let msg = WireMessage::reply(request, retval, order);
        self.plane.send_message(self.link, &self.channel, &self.endpoint, &msg)?;
        Ok(())
    }
}

impl Drop for KrpcAgent {
    fn drop(&mut self) {
        if let Err(err) = self.plane.close(self.link, &self.channel, self.endpoint.clone()) {
            debug!("krpc: close on drop: {err}");
        }
    }
}
