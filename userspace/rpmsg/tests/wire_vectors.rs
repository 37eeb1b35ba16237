// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Golden encoding of a big-endian kernel request
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 2 vector tests
//!
//! The vector is a 32-byte header followed by two parameter words, all
//! big-endian, as the audio and video firmware expect them.

use rpmsg::wire::{self, ByteOrder, DispatchKey, RpcHeader, WireMessage, KERNEL_ID};

const VECTOR: &[u8] = include_bytes!("vectors/rpc_header_be.bin");

fn request() -> WireMessage {
    let header = RpcHeader {
        program_id: KERNEL_ID,
        version_id: KERNEL_ID,
        procedure_id: 7,
        task_id: 0x0f00_0001,
        sys_tid: 0x0f00_0001,
        sys_pid: 0x0f00_0001,
        parameter_size: 0,
        context: 0x1234,
    };
    let mut payload = Vec::new();
    payload.extend_from_slice(&0xdead_beefu32.to_le_bytes());
    payload.extend_from_slice(&1u32.to_le_bytes());
    ByteOrder::Big.swap_words(&mut payload);
    WireMessage::new(header, payload)
}

#[test]
fn encodes_golden_vector() {
    assert_eq!(wire::encode(&request(), ByteOrder::Big), VECTOR);
}

#[test]
fn decodes_golden_vector() {
    let msg = wire::decode(VECTOR, ByteOrder::Big).unwrap();
    assert_eq!(msg, request());
    assert_eq!(msg.payload_word(0, ByteOrder::Big), Some(0xdead_beef));
    assert_eq!(wire::dispatch_key(&msg, ByteOrder::Big), Ok(DispatchKey::RemoteAlloc));
    let swapped = wire::decode(VECTOR, ByteOrder::Little).unwrap_err();
    assert!(matches!(swapped, wire::WireError::Truncated { .. }));
}
