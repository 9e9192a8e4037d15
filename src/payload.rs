// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The `Serializable` contract requests and responses are built on.
//!
//! Serialization of the actual call payloads is out of scope for the core
//! multiplexer (see the crate-level docs); this module only defines the seam
//! the codec calls through, plus one concrete payload (`BytesPayload`) used
//! by the tests and by callers that just want to move an opaque byte buffer.

use std::io::{self, Read, Write};

/// A value that can be framed onto (and parsed off of) the wire.
///
/// The core treats this as an opaque contract: it never inspects the bytes
/// itself, only the `payload_length` prefix around them (see the wire codec
/// docs). `read` receives exactly the payload bytes for one response frame,
/// nothing more and nothing less.
pub trait Serializable: Send + Sync + 'static {
    /// Serializes `self` onto `sink`.
    fn write(&self, sink: &mut dyn Write) -> io::Result<()>;

    /// Deserializes a value of this type from `source`.
    fn read(source: &mut dyn Read) -> io::Result<Self>
    where Self: Sized;
}

/// The simplest possible `Serializable`: a raw, length-delimited byte
/// buffer. Used by the default test server/client pair and by callers that
/// have no richer schema to hand the core.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BytesPayload(pub Vec<u8>);

impl BytesPayload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

impl Serializable for BytesPayload {
    fn write(&self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(&self.0)
    }

    fn read(source: &mut dyn Read) -> io::Result<Self> {
        let mut buf = Vec::new();
        source.read_to_end(&mut buf)?;
        Ok(BytesPayload(buf))
    }
}
