// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy for the IPC client.
//!
//! Transport failures are always tagged with the peer address they happened
//! against, and always carry their original cause via `#[source]` so the
//! chain survives `anyhow::Error::context` / `{:#}` formatting at call sites.

use std::{fmt, net::SocketAddr};

use thiserror::Error;

/// A server-supplied exception re-materialized on the client side.
///
/// Carries the class name and message the remote end reported in a
/// `is_error=true` response frame. Raised to the caller without envelope
/// wrapping so it can be matched on directly.
#[derive(Debug, Clone)]
pub struct RemoteException {
    pub class_name: String,
    pub message: String,
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class_name, self.message)
    }
}

impl std::error::Error for RemoteException {}

/// The error taxonomy described in the IPC core's design: a small set of
/// *kinds*, each tagged with enough context to decide retry policy at the
/// call site.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Peer reachable but refused the connection.
    #[error("connection refused by {addr}")]
    ConnectRefused {
        addr: SocketAddr,
        #[source]
        cause: std::io::Error,
    },

    /// A blocking socket operation (connect or read) timed out.
    #[error("socket timeout talking to {addr}")]
    SocketTimeout {
        addr: SocketAddr,
        #[source]
        cause: std::io::Error,
    },

    /// Any other transport failure.
    #[error("I/O error talking to {addr}")]
    LocalIo {
        addr: SocketAddr,
        #[source]
        cause: std::io::Error,
    },

    /// The server returned `is_error=true`.
    #[error(transparent)]
    Remote(#[from] RemoteException),

    /// A connection (or the whole client) was acquired after `stop()`.
    #[error("client is stopped")]
    ClientStopped,

    /// The peer address could not be resolved.
    #[error("unknown host: {0}")]
    UnknownHost(String),
}

impl IpcError {
    /// Classifies a raw I/O error observed while connecting or reading,
    /// tagging it with the peer address per the envelope rules in the
    /// error-handling design: `ConnectionRefused` -> `ConnectRefused`,
    /// `TimedOut`/`WouldBlock` -> `SocketTimeout`, everything else ->
    /// `LocalIo`.
    pub fn from_io(addr: SocketAddr, cause: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match cause.kind() {
            ErrorKind::ConnectionRefused => IpcError::ConnectRefused { addr, cause },
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                IpcError::SocketTimeout { addr, cause }
            },
            _ => IpcError::LocalIo { addr, cause },
        }
    }

    /// True for kinds that mean the connection carrying the call must be
    /// torn down (everything except a pure logical `Remote` error, which
    /// leaves the connection open per S2).
    pub fn closes_connection(&self) -> bool {
        !matches!(self, IpcError::Remote(_))
    }

    /// Builds an independent copy carrying the same kind, address, and
    /// message. `std::io::Error` is not `Clone`, so when a single close
    /// cause has to be handed to every pending call in `cleanup_calls`, each
    /// waiter gets its own reconstructed `io::Error` with the same kind and
    /// text rather than sharing one.
    pub fn duplicate(&self) -> IpcError {
        let dup_io = |e: &std::io::Error| std::io::Error::new(e.kind(), e.to_string());
        match self {
            IpcError::ConnectRefused { addr, cause } => IpcError::ConnectRefused {
                addr: *addr,
                cause: dup_io(cause),
            },
            IpcError::SocketTimeout { addr, cause } => IpcError::SocketTimeout {
                addr: *addr,
                cause: dup_io(cause),
            },
            IpcError::LocalIo { addr, cause } => IpcError::LocalIo {
                addr: *addr,
                cause: dup_io(cause),
            },
            IpcError::Remote(e) => IpcError::Remote(e.clone()),
            IpcError::ClientStopped => IpcError::ClientStopped,
            IpcError::UnknownHost(h) => IpcError::UnknownHost(h.clone()),
        }
    }
}
