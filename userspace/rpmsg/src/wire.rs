// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: RPC envelope carried through the rpmsg rings
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (wire format)
//! TEST_COVERAGE: Unit tests + golden vector (tests/wire_vectors.rs)
//!
//! Every message is a 32-byte header of eight 32-bit words followed by
//! `parameter_size` payload bytes. Header words use the byte order of the
//! link; payload bytes are never reordered by the codec.

use serde::Deserialize;
use thiserror::Error;

/// Size of the encoded [`RpcHeader`].
pub const HEADER_LEN: usize = 32;

/// Program id of a reply; the destination is the first payload word.
pub const REPLY_ID: u32 = 99;
/// Program id used by kernel clients and by remote-allocated requests.
pub const KERNEL_ID: u32 = 98;
/// Audio system program.
pub const AUDIO_SYSTEM: u32 = 201;
/// Audio agent program.
pub const AUDIO_AGENT: u32 = 202;
/// Video agent program.
pub const VIDEO_AGENT: u32 = 300;
/// Video encoder agent program.
pub const VENC_AGENT: u32 = 400;
/// DSP agent program.
pub const HIFI_AGENT: u32 = 500;
/// Auxiliary core agent program.
pub const KR4_AGENT: u32 = 600;

/// Programs routed by the requester process id.
pub const AGENT_PROGRAMS: [u32; 6] =
    [AUDIO_SYSTEM, AUDIO_AGENT, VIDEO_AGENT, VENC_AGENT, HIFI_AGENT, KR4_AGENT];

/// Status word returned by remote procedures on success.
pub const S_OK: u32 = 0x1000_0000;

/// Byte order of 32-bit words on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Most significant byte first.
    Big,
    /// Least significant byte first.
    Little,
}

impl ByteOrder {
    /// Decodes one word.
    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Big => u32::from_be_bytes(bytes),
            Self::Little => u32::from_le_bytes(bytes),
        }
    }

    /// Encodes one word.
    pub fn write_u32(self, value: u32) -> [u8; 4] {
        match self {
            Self::Big => value.to_be_bytes(),
            Self::Little => value.to_le_bytes(),
        }
    }

    /// Reads the word at `at`, or `None` if `buf` is too short.
    pub fn get(self, buf: &[u8], at: usize) -> Option<u32> {
        let end = at.checked_add(4)?;
        let bytes: [u8; 4] = buf.get(at..end)?.try_into().ok()?;
        Some(self.read_u32(bytes))
    }

    /// Converts every complete word of `buf` between little-endian and this
    /// order, in place. A trailing partial word is left untouched.
    pub fn swap_words(self, buf: &mut [u8]) {
        if self == Self::Little {
            return;
        }
        for word in buf.chunks_exact_mut(4) {
            word.reverse();
        }
    }
}

/// Errors produced by the codec.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than the header plus its declared payload.
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the header claims.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },
}

/// Fixed RPC header, in wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RpcHeader {
    /// Target program.
    pub program_id: u32,
    /// Program version.
    pub version_id: u32,
    /// Procedure within the program.
    pub procedure_id: u32,
    /// Requesting task; replies carry it back as payload word 0.
    pub task_id: u32,
    /// Requester thread id.
    pub sys_tid: u32,
    /// Requester process id.
    pub sys_pid: u32,
    /// Payload length in bytes.
    pub parameter_size: u32,
    /// Opaque value echoed by replies.
    pub context: u32,
}

impl RpcHeader {
    fn words(&self) -> [u32; 8] {
        [
            self.program_id,
            self.version_id,
            self.procedure_id,
            self.task_id,
            self.sys_tid,
            self.sys_pid,
            self.parameter_size,
            self.context,
        ]
    }

    /// Encodes the header in `order`.
    pub fn to_bytes(&self, order: ByteOrder) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.words()) {
            chunk.copy_from_slice(&order.write_u32(word));
        }
        out
    }

    /// Decodes a header from the first [`HEADER_LEN`] bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8], order: ByteOrder) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated { needed: HEADER_LEN, available: bytes.len() });
        }
        let mut w = [0u32; 8];
        for (slot, chunk) in w.iter_mut().zip(bytes[..HEADER_LEN].chunks_exact(4)) {
            *slot = order.read_u32([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Self {
            program_id: w[0],
            version_id: w[1],
            procedure_id: w[2],
            task_id: w[3],
            sys_tid: w[4],
            sys_pid: w[5],
            parameter_size: w[6],
            context: w[7],
        })
    }

    /// Bytes the whole message occupies, header included.
    pub fn message_len(&self) -> usize {
        HEADER_LEN.saturating_add(self.parameter_size as usize)
    }
}

/// A header plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Envelope.
    pub header: RpcHeader,
    /// Payload bytes, exactly `header.parameter_size` long.
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Builds a message, fixing `parameter_size` to the payload length.
    pub fn new(mut header: RpcHeader, payload: Vec<u8>) -> Self {
        header.parameter_size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        Self { header, payload }
    }

    /// Reply to `request` carrying `retval`, as produced by the agents.
    pub fn reply(request: &RpcHeader, retval: u32, order: ByteOrder) -> Self {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&order.write_u32(request.task_id));
        payload.extend_from_slice(&order.write_u32(retval));
        Self::new(
            RpcHeader {
                program_id: REPLY_ID,
                version_id: REPLY_ID,
                procedure_id: 0,
                task_id: 0,
                sys_tid: request.sys_tid,
                sys_pid: request.sys_pid,
                parameter_size: 0,
                context: request.context,
            },
            payload,
        )
    }

    /// Payload word `index` in `order`.
    pub fn payload_word(&self, index: usize, order: ByteOrder) -> Option<u32> {
        order.get(&self.payload, index.checked_mul(4)?)
    }
}

/// Encodes `msg`; header words in `order`, payload verbatim.
pub fn encode(msg: &WireMessage, order: ByteOrder) -> Vec<u8> {
    let mut header = msg.header;
    header.parameter_size = u32::try_from(msg.payload.len()).unwrap_or(u32::MAX);
    let mut out = Vec::with_capacity(HEADER_LEN + msg.payload.len());
    out.extend_from_slice(&header.to_bytes(order));
    out.extend_from_slice(&msg.payload);
    out
}

/// Decodes one message from the front of `bytes`. Trailing bytes are ignored.
pub fn decode(bytes: &[u8], order: ByteOrder) -> Result<WireMessage, WireError> {
    let header = RpcHeader::from_bytes(bytes, order)?;
    let needed = header.message_len();
    if bytes.len() < needed {
        return Err(WireError::Truncated { needed, available: bytes.len() });
    }
    Ok(WireMessage { header, payload: bytes[HEADER_LEN..needed].to_vec() })
}

/// Where the dispatcher looks for the destination endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKey {
    /// Endpoint address taken from a reply's first payload word.
    Address(u32),
    /// Requester process id of an agent program.
    Process(u32),
    /// The channel's remote-alloc endpoint.
    RemoteAlloc,
}

/// Derives the routing key for `msg`.
pub fn dispatch_key(msg: &WireMessage, order: ByteOrder) -> Result<DispatchKey, WireError> {
    match msg.header.program_id {
        REPLY_ID => {
            let short = WireError::Truncated {
                needed: HEADER_LEN + 4,
                available: HEADER_LEN + msg.payload.len(),
            };
            msg.payload_word(0, order).map(DispatchKey::Address).ok_or(short)
        }
        id if AGENT_PROGRAMS.contains(&id) => Ok(DispatchKey::Process(msg.header.sys_pid)),
        _ => Ok(DispatchKey::RemoteAlloc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn header(program_id: u32) -> RpcHeader {
        RpcHeader {
            program_id,
            version_id: 1,
            procedure_id: 7,
            task_id: 0x0f00_0001,
            sys_tid: 42,
            sys_pid: 40,
            parameter_size: 0,
            context: 0xdead_beef,
        }
    }

    #[test]
    fn header_words_follow_link_order() {
        let bytes = header(KERNEL_ID).to_bytes(ByteOrder::Big);
        assert_eq!(&bytes[..4], &[0, 0, 0, 98]);
        let bytes = header(KERNEL_ID).to_bytes(ByteOrder::Little);
        assert_eq!(&bytes[..4], &[98, 0, 0, 0]);
    }

    #[test]
    fn payload_is_not_reordered() {
        let msg = WireMessage::new(header(AUDIO_AGENT), vec![1, 2, 3, 4, 5]);
        let bytes = encode(&msg, ByteOrder::Big);
        assert_eq!(&bytes[HEADER_LEN..], &[1, 2, 3, 4, 5]);
        assert_eq!(ByteOrder::Big.get(&bytes, 24), Some(5));
    }

    #[test]
    fn short_payload_is_truncated() {
        let msg = WireMessage::new(header(VIDEO_AGENT), vec![0; 12]);
        let bytes = encode(&msg, ByteOrder::Little);
        let err = decode(&bytes[..HEADER_LEN + 8], ByteOrder::Little).unwrap_err();
        let expected = WireError::Truncated { needed: HEADER_LEN + 12, available: HEADER_LEN + 8 };
        assert_eq!(err, expected);
        assert!(decode(&bytes[..10], ByteOrder::Little).is_err());
    }

    #[test]
    fn reply_routes_by_first_payload_word() {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let mut request = header(KERNEL_ID);
            request.task_id = 0x1000;
            let reply = WireMessage::reply(&request, S_OK, order);
            assert_eq!(dispatch_key(&reply, order), Ok(DispatchKey::Address(0x1000)));
            assert_eq!(reply.payload_word(1, order), Some(S_OK));
            assert_eq!(reply.header.context, request.context);
        }
    }

    #[test]
    fn agents_route_by_process_and_others_to_remote_alloc() {
        let msg = WireMessage::new(header(HIFI_AGENT), Vec::new());
        assert_eq!(dispatch_key(&msg, ByteOrder::Little), Ok(DispatchKey::Process(40)));
        let msg = WireMessage::new(header(KERNEL_ID), Vec::new());
        assert_eq!(dispatch_key(&msg, ByteOrder::Little), Ok(DispatchKey::RemoteAlloc));
        let msg = WireMessage::new(header(REPLY_ID), vec![1, 2]);
        assert!(dispatch_key(&msg, ByteOrder::Little).is_err());
    }

    #[test]
    fn swap_words_only_touches_big_endian_links() {
        let mut buf = [1, 2, 3, 4, 5, 6];
        ByteOrder::Little.swap_words(&mut buf);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6]);
        ByteOrder::Big.swap_words(&mut buf);
        assert_eq!(buf, [4, 3, 2, 1, 5, 6]);
    }

    proptest! {
        #[test]
        fn encode_decode_preserves_message(
            program in any::<u32>(),
            context in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            big in any::<bool>(),
        ) {
            let order = if big { ByteOrder::Big } else { ByteOrder::Little };
            let mut h = header(program);
            h.context = context;
            let msg = WireMessage::new(h, payload);
            prop_assert_eq!(decode(&encode(&msg, order), order), Ok(msg));
        }
    }
}
