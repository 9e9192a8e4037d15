// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client Facade (§4.5): the public entry point. Allocates call ids, routes
//! calls through the pool, and owns the reference-counted shutdown.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::ClientConfig,
    client::{
        call::{CallEntry, CallOutcome, SingleCall},
        identity::{ConnectionKey, IdentityToken},
        parallel::{ParallelResults, ParallelSlot},
        pool::Pool,
    },
    error::IpcError,
    payload::Serializable,
};

/// Interval between pool-emptiness checks during `stop()`.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Client<V> {
    cfg: Arc<ClientConfig>,
    pool: Arc<Pool<V>>,
    client_cancel: CancellationToken,
    next_call_id: AtomicI32,
    running: AtomicBool,
    /// Advisory only: `stop()` tears the client down unconditionally and
    /// does not consult this counter (§3).
    references: AtomicUsize,
}

impl<V: Serializable> Client<V> {
    pub fn new(cfg: ClientConfig) -> Arc<Self> {
        let cfg = Arc::new(cfg);
        let client_cancel = CancellationToken::new();
        let pool = Pool::new(Arc::clone(&cfg), client_cancel.clone());
        Arc::new(Self {
            cfg,
            pool,
            client_cancel,
            next_call_id: AtomicI32::new(0),
            running: AtomicBool::new(true),
            references: AtomicUsize::new(0),
        })
    }

    fn next_id(&self) -> i32 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_reference(&self) -> usize {
        self.references.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn remove_reference(&self) -> usize {
        self.references.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    pub fn zero_references(&self) -> bool {
        self.references.load(Ordering::Acquire) == 0
    }

    /// Convenience for `call(param, addr, None)`.
    pub async fn call(&self, param: &dyn Serializable, addr: SocketAddr) -> Result<V, IpcError> {
        self.call_with_identity(param, addr, None).await
    }

    /// Convenience for `call_host_with_identity(param, host, port, None)`.
    pub async fn call_host(
        &self,
        param: &dyn Serializable,
        host: &str,
        port: u16,
    ) -> Result<V, IpcError> {
        self.call_host_with_identity(param, host, port, None).await
    }

    /// Resolves `host:port` before routing the call, surfacing resolution
    /// failure as `IpcError::UnknownHost` at connection construction (§7)
    /// rather than letting it reach the connect-retry machinery as an
    /// opaque I/O error.
    pub async fn call_host_with_identity(
        &self,
        param: &dyn Serializable,
        host: &str,
        port: u16,
        identity: Option<Arc<IdentityToken>>,
    ) -> Result<V, IpcError> {
        let addr = resolve_host(host, port).await?;
        self.call_with_identity(param, addr, identity).await
    }

    /// Submits one call against `addr`, authenticating with `identity` if
    /// present, and awaits its outcome.
    pub async fn call_with_identity(
        &self,
        param: &dyn Serializable,
        addr: SocketAddr,
        identity: Option<Arc<IdentityToken>>,
    ) -> Result<V, IpcError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(IpcError::ClientStopped);
        }

        let payload = serialize(param, addr)?;
        let id = self.next_id();
        let (slot, rx) = SingleCall::<V>::new();
        let entry =
            Arc::new(CallEntry { id, payload, sink: Arc::new(slot) as Arc<dyn crate::client::call::CallSink<V>> });

        let key = ConnectionKey::new(addr, identity);
        let conn = self.pool.acquire(key, Arc::clone(&entry)).await?;
        conn.send(&entry).await?;

        match rx.await {
            Ok(CallOutcome::Value(v)) => Ok(v),
            Ok(CallOutcome::Error(e)) => Err(e),
            Err(_recv_err) => Err(IpcError::ClientStopped),
        }
    }

    /// Fans `params[i]` out to `addrs[i]` in parallel. Never raises: a call
    /// that could not be submitted, or that later fails, leaves `values[i]`
    /// as `None` instead of aborting the whole batch.
    pub async fn call_parallel(
        &self,
        params: &[&dyn Serializable],
        addrs: &[SocketAddr],
    ) -> Result<Vec<Option<V>>, IpcError> {
        assert_eq!(params.len(), addrs.len(), "params and addrs must be the same length");

        if !self.running.load(Ordering::Acquire) {
            return Err(IpcError::ClientStopped);
        }

        let n = params.len();
        let results = ParallelResults::<V>::new(n);

        for (i, (&param, &addr)) in params.iter().zip(addrs.iter()).enumerate() {
            let payload = match serialize(param, addr) {
                Ok(p) => p,
                Err(e) => {
                    warn!(index = i, error = %e, "failed to serialize parallel call parameter");
                    results.decrement_expected();
                    continue;
                },
            };

            let id = self.next_id();
            let sink = Arc::new(ParallelSlot::new(Arc::clone(&results), i));
            let entry = Arc::new(CallEntry {
                id,
                payload,
                sink: sink as Arc<dyn crate::client::call::CallSink<V>>,
            });

            let key = ConnectionKey::new(addr, None);
            match self.pool.acquire(key, Arc::clone(&entry)).await {
                Ok(conn) => {
                    if let Err(e) = conn.send(&entry).await {
                        // `send` already routed the failure through the
                        // sink via the connection's close path, so the
                        // slot already counted toward completion; just log.
                        warn!(index = i, peer = %addr, error = %e, "parallel call send failed");
                    }
                },
                Err(e) => {
                    warn!(index = i, peer = %addr, error = %e, "parallel call could not acquire a connection");
                    results.decrement_expected();
                },
            }
        }

        Ok(results.wait().await)
    }

    /// CAS `running` true->false (a no-op if already stopped), then cancels
    /// every connection's reader worker and waits for the pool to drain.
    pub async fn stop(&self) {
        if self.running.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_err()
        {
            return;
        }

        info!("client stopping, cancelling all connections");
        self.client_cancel.cancel();

        loop {
            if self.pool.is_empty().await {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        info!("client stopped, pool drained");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of live pooled connections. Diagnostic only.
    pub async fn connection_count(&self) -> usize {
        self.pool.snapshot().await.len()
    }
}

/// Resolves `host:port` into a concrete peer address. Any resolution
/// failure — unknown name, no addresses returned — is surfaced as
/// `IpcError::UnknownHost` rather than propagating the raw resolver error.
async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, IpcError> {
    tokio::net::lookup_host((host, port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| IpcError::UnknownHost(format!("{host}:{port}")))
}

fn serialize(param: &dyn Serializable, addr: SocketAddr) -> Result<Bytes, IpcError> {
    let mut buf = Vec::new();
    param.write(&mut buf).map_err(|e| IpcError::LocalIo { addr, cause: e })?;
    Ok(Bytes::from(buf))
}
