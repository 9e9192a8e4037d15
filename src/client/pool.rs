// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection Pool (§4.4): one live [`Connection`] per
//! `(peer_address, identity)` key, shared by every caller that targets the
//! same destination with the same credential.

use std::sync::{Arc, Weak};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::config::ClientConfig,
    client::{call::CallEntry, connection::Connection, identity::ConnectionKey},
    error::IpcError,
    payload::Serializable,
};

pub struct Pool<V> {
    cfg: Arc<ClientConfig>,
    client_cancel: CancellationToken,
    connections: DashMap<ConnectionKey, Arc<Connection<V>>>,
}

impl<V: Serializable> Pool<V> {
    pub fn new(cfg: Arc<ClientConfig>, client_cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self { cfg, client_cancel, connections: DashMap::new() })
    }

    /// Looks up (or creates) the connection for `key`, registers `entry` on
    /// it, and returns that connection so the caller can `send` on it.
    ///
    /// A connection that refuses registration (already closing) is retried
    /// against a freshly created replacement — the pool never hands back a
    /// connection it knows is dead.
    pub async fn acquire(
        self: &Arc<Self>,
        key: ConnectionKey,
        entry: Arc<CallEntry<V>>,
    ) -> Result<Arc<Connection<V>>, IpcError> {
        loop {
            if self.client_cancel.is_cancelled() {
                return Err(IpcError::ClientStopped);
            }

            let (conn, created) = self.lookup_or_insert(&key).await;

            if created {
                // setup_io connects (possibly retrying for seconds) — MUST
                // run outside the pool lock, which `lookup_or_insert`
                // already released.
                conn.setup_io().await?;
            }

            if conn.register(Arc::clone(&entry)).await {
                if !created {
                    // Another acquirer created this connection; make sure
                    // it is actually connected before handing it back.
                    conn.setup_io().await?;
                }
                return Ok(conn);
            }

            // Lost the race against this connection closing. Drop it from
            // the map if it's still the one mapped there, and retry with a
            // fresh connection.
            self.remove_if_same(&key, &conn).await;
        }
    }

    /// Looks up `key`, or inserts a fresh `Connection` for it, in one shard
    /// lock acquisition — `DashMap::entry` holds that shard's lock for the
    /// whole match below, so two concurrent acquirers for the same key can
    /// never both observe "missing" and both insert (Testable Property #2).
    async fn lookup_or_insert(self: &Arc<Self>, key: &ConnectionKey) -> (Arc<Connection<V>>, bool) {
        match self.connections.entry(key.clone()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(e) => {
                let conn = Connection::new(
                    key.clone(),
                    Arc::clone(&self.cfg),
                    self.client_cancel.clone(),
                    Arc::downgrade(self),
                );
                e.insert(Arc::clone(&conn));
                (conn, true)
            },
        }
    }

    /// Removes `key` from the map iff it still maps to `conn` (pointer
    /// identity) — a connection that already lost the race to a newer one
    /// for the same key must not evict its replacement.
    pub async fn remove_if_same(&self, key: &ConnectionKey, conn: &Arc<Connection<V>>) {
        if self.connections.remove_if(key, |_, current| Arc::ptr_eq(current, conn)).is_some() {
            debug!(peer = %conn.remote_address(), "removed connection from pool");
        }
    }

    /// A point-in-time snapshot of live connections, used by `stop()` to
    /// drive every connection closed and to decide when the pool is empty.
    pub async fn snapshot(&self) -> Vec<Arc<Connection<V>>> {
        self.connections.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
