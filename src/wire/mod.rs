// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire framing for the IPC protocol (§4.1 / §6 of the design).
//!
//! Byte order is big-endian throughout, matching the BHS framing style the
//! rest of this codebase uses for fixed headers, just applied to a
//! variable-length frame instead of a fixed PDU.
//!
//! ```text
//! header:   MAGIC(4) | version(1) | identity_len(4, i32) | identity_bytes
//! request:  call_id(4, i32) | payload_len(4, i32) | payload_bytes
//! ping:     call_id(4, i32) = -1
//! response: call_id(4, i32) | is_error(1, bool)
//!             is_error==1: class_len(4) class_bytes | msg_len(4) msg_bytes
//!             is_error==0: payload_bytes (caller knows the length from the
//!                          surrounding transport framing described below)
//! ```
//!
//! Response frames are not self-delimited by a `payload_len` the way request
//! frames are: the value type's `Serializable::read` consumes exactly the
//! bytes that belong to it from a length-delimited segment we read eagerly
//! (see [`read_response_frame`]), so the wire format still carries an
//! explicit `payload_len` for the success case even though the struct above
//! elides it for brevity.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed 4-byte magic prefacing every connection header.
pub const MAGIC: [u8; 4] = *b"rpcX";
/// Wire protocol version written immediately after `MAGIC`.
pub const VERSION: u8 = 1;
/// Reserved call id used for keepalive pings; never assigned to a real call.
pub const PING_CALL_ID: i32 = -1;
/// Sentinel identity length meaning "no identity token".
const NULL_IDENTITY_LEN: i32 = -1;

/// A fully decoded response frame, correlated to its call id.
#[derive(Debug)]
pub enum ResponseFrame {
    Value { call_id: i32, payload: Vec<u8> },
    Error { call_id: i32, class_name: String, message: String },
}

/// A frame read off the request side (server's read direction): either a
/// real request or the bare ping sentinel. Used by the in-process test
/// server; the production client only ever writes these.
#[derive(Debug)]
pub enum RequestFrame {
    Request { call_id: i32, payload: Vec<u8> },
    Ping,
}

/// Reads the one-time connection header (server side counterpart to
/// [`write_header`]). Returns the identity bytes, or `None` for the null
/// encoding.
pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
    }
    let version = r.read_u8().await?;
    if version != VERSION {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported version"));
    }
    let len = r.read_i32().await?;
    if len == NULL_IDENTITY_LEN {
        return Ok(None);
    }
    let len = usize::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative identity length"))?;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Reads one request or ping frame (server side counterpart to
/// [`write_request`] / [`write_ping`]).
pub async fn read_request_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<RequestFrame> {
    let call_id = r.read_i32().await?;
    if call_id == PING_CALL_ID {
        return Ok(RequestFrame::Ping);
    }
    let len = r.read_i32().await?;
    let len = usize::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative payload length"))?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(RequestFrame::Request { call_id, payload })
}

/// Writes the one-time connection header: magic, version, and the
/// length-prefixed identity block (or the null encoding when `identity` is
/// `None`).
pub async fn write_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    identity: Option<&[u8]>,
) -> io::Result<()> {
    w.write_all(&MAGIC).await?;
    w.write_u8(VERSION).await?;
    match identity {
        Some(bytes) => {
            w.write_i32(bytes.len() as i32).await?;
            w.write_all(bytes).await?;
        },
        None => {
            w.write_i32(NULL_IDENTITY_LEN).await?;
        },
    }
    Ok(())
}

/// Writes a request frame: `call_id || payload_len || payload`.
pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    call_id: i32,
    payload: &[u8],
) -> io::Result<()> {
    debug_assert!(call_id >= 0, "call ids must be non-negative");
    w.write_i32(call_id).await?;
    w.write_i32(payload.len() as i32).await?;
    w.write_all(payload).await?;
    Ok(())
}

/// Writes the bare ping sentinel (`call_id == -1`, no payload).
pub async fn write_ping<W: AsyncWrite + Unpin>(w: &mut W) -> io::Result<()> {
    w.write_i32(PING_CALL_ID).await
}

/// Reads one response frame, blocking until a full frame (or EOF / error) is
/// available. This is the sole read access point on a connection's socket;
/// callers external to the reader worker never call this.
pub async fn read_response_frame<R: AsyncRead + Unpin>(
    r: &mut R,
) -> io::Result<ResponseFrame> {
    let call_id = r.read_i32().await?;
    let is_error = r.read_u8().await? != 0;

    if is_error {
        let class_name = read_string(r).await?;
        let message = read_string(r).await?;
        Ok(ResponseFrame::Error { call_id, class_name, message })
    } else {
        let len = r.read_i32().await?;
        let len = usize::try_from(len).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "negative payload length")
        })?;
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).await?;
        Ok(ResponseFrame::Value { call_id, payload })
    }
}

async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<String> {
    let len = r.read_u32().await? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_u32(s.len() as u32).await?;
    w.write_all(s.as_bytes()).await
}

/// Writes a success response frame (used by the in-process test server).
pub async fn write_value_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    call_id: i32,
    payload: &[u8],
) -> io::Result<()> {
    w.write_i32(call_id).await?;
    w.write_u8(0).await?;
    w.write_i32(payload.len() as i32).await?;
    w.write_all(payload).await
}

/// Writes an error response frame (used by the in-process test server).
pub async fn write_error_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    call_id: i32,
    class_name: &str,
    message: &str,
) -> io::Result<()> {
    w.write_i32(call_id).await?;
    w.write_u8(1).await?;
    write_string(w, class_name).await?;
    write_string(w, message).await
}
