// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use region_ipc_client::{BytesPayload, Serializable};

#[test]
fn bytes_payload_round_trips_through_the_serializable_contract() {
    let original = BytesPayload::new(b"hello region".to_vec());

    let mut buf = Vec::new();
    original.write(&mut buf).unwrap();

    let decoded = BytesPayload::read(&mut &buf[..]).unwrap();
    assert_eq!(original, decoded);
}

#[test]
fn empty_payload_round_trips() {
    let original = BytesPayload::default();
    let mut buf = Vec::new();
    original.write(&mut buf).unwrap();
    assert!(buf.is_empty());

    let decoded = BytesPayload::read(&mut &buf[..]).unwrap();
    assert_eq!(original, decoded);
}
