// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Identity tokens and the connection-pool key built from them.
//!
//! The source this core is modeled on deliberately keys connections on
//! *reference* equality of the identity token, not value equality: two
//! credentials with byte-for-byte identical contents but obtained through
//! distinct acquisition paths (e.g. two separate logins) are treated as
//! distinct principals and get distinct connections. We preserve that
//! explicitly by hashing and comparing on `Arc` pointer identity instead of
//! deriving `Hash`/`Eq` from the token's bytes.

use std::{
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::Arc,
};

/// An opaque credential carried once in the connection header.
///
/// The core never interprets the bytes; it only length-prefixes and writes
/// them once, before the first call. What the bytes mean is up to caller and
/// server.
#[derive(Debug, Clone)]
pub struct IdentityToken(pub Vec<u8>);

impl IdentityToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self(bytes.into()))
    }
}

/// `(peer_address, identity)` key for the connection pool.
///
/// `identity` equality is pointer identity on the `Arc`, per the module
/// docs above: cloning the `Arc` and looking it up again yields the same
/// key, but constructing a fresh `Arc` from equal bytes does not.
#[derive(Debug, Clone)]
pub struct ConnectionKey {
    pub peer: SocketAddr,
    pub identity: Option<Arc<IdentityToken>>,
}

impl ConnectionKey {
    pub fn new(peer: SocketAddr, identity: Option<Arc<IdentityToken>>) -> Self {
        Self { peer, identity }
    }
}

impl PartialEq for ConnectionKey {
    fn eq(&self, other: &Self) -> bool {
        if self.peer != other.peer {
            return false;
        }
        match (&self.identity, &other.identity) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for ConnectionKey {}

impl Hash for ConnectionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer.hash(state);
        match &self.identity {
            Some(id) => (Arc::as_ptr(id) as usize).hash(state),
            None => 0usize.hash(state),
        }
    }
}
