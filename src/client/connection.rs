// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection (§4.3): owns a socket plus a reader task, multiplexes
//! in-flight calls by id, and implements connect-with-retry, idle
//! eviction, heartbeat-on-read-timeout, and coordinated close.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    net::{TcpStream, tcp::OwnedReadHalf},
    sync::{Mutex, Notify},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::ClientConfig,
    client::{call::CallEntry, identity::ConnectionKey, pool::Pool},
    error::{IpcError, RemoteException},
    payload::Serializable,
    wire,
};

/// Fixed cap on consecutive connect-timeout failures before giving up.
/// Unlike `max_retries`, this is not configurable (§4.3).
const MAX_CONNECT_TIMEOUTS: u32 = 45;
/// Per-attempt connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// Backoff between connect attempts, held under the setup lock.
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// `should_close` and `close_cause` change together as one unit (the
/// "connection monitor" the design describes), so they share a lock. The
/// pending-call map itself is a concurrent `DashMap` (§5: "per-connection
/// `pending` map") — `register`/`dispatch_frame`/`cleanup_calls` touch it
/// without contending on this smaller lock, and re-check `should_close`
/// after inserting to reclaim any entry that raced a concurrent close.
struct Inner {
    should_close: bool,
    close_cause: Option<IpcError>,
}

/// What woke the reader out of `wait_for_work`.
enum WakeReason {
    HasWork,
    Closing,
    IdleTimedOut,
    Stopping,
}

pub struct Connection<V> {
    key: ConnectionKey,
    remote_addr: SocketAddr,
    identity: Option<Arc<crate::client::identity::IdentityToken>>,
    cfg: Arc<ClientConfig>,
    client_cancel: CancellationToken,
    pool: Weak<Pool<V>>,

    writer: Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    inner: Mutex<Inner>,
    /// Outstanding calls keyed by id. A `DashMap` so `register`,
    /// `dispatch_frame`, and `cleanup_calls` can all touch it without going
    /// through `inner`'s lock.
    pending: DashMap<i32, Arc<CallEntry<V>>>,
    /// Signaled whenever `pending` gains work or `should_close` flips, so a
    /// parked reader (in `wait_for_work` or mid-read) notices promptly.
    notify: Notify,
    last_activity_ms: AtomicI64,

    /// Held across the whole connect-retry loop, including its sleeps, so
    /// concurrent `setup_io` callers serialize instead of racing to
    /// reconnect the same key.
    setup_lock: Mutex<()>,
    setup_done: AtomicBool,
    /// Guards `close()` itself running its teardown more than once.
    closed: AtomicBool,
}

impl<V: Serializable> Connection<V> {
    pub fn new(
        key: ConnectionKey,
        cfg: Arc<ClientConfig>,
        client_cancel: CancellationToken,
        pool: Weak<Pool<V>>,
    ) -> Arc<Self> {
        let remote_addr = key.peer;
        let identity = key.identity.clone();
        Arc::new(Self {
            key,
            remote_addr,
            identity,
            cfg,
            client_cancel,
            pool,
            writer: Mutex::new(None),
            inner: Mutex::new(Inner { should_close: false, close_cause: None }),
            pending: DashMap::new(),
            notify: Notify::new(),
            last_activity_ms: AtomicI64::new(now_ms()),
            setup_lock: Mutex::new(()),
            setup_done: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    fn touch_activity(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Release);
    }

    async fn is_closing(&self) -> bool {
        self.inner.lock().await.should_close
    }

    async fn close_cause_snapshot(&self) -> Option<IpcError> {
        self.inner.lock().await.close_cause.as_ref().map(IpcError::duplicate)
    }

    /// Inserts `entry` into `pending` and wakes the reader. Returns `false`
    /// iff the connection is already closing, in which case the caller must
    /// acquire a fresh connection and retry.
    ///
    /// `pending` lives in its own `DashMap`, separate from the
    /// `should_close` lock, so a concurrent `close()` could drain `pending`
    /// between our pre-check and our insert. We re-check `should_close`
    /// after inserting and, if it flipped underneath us, reclaim the entry
    /// ourselves so it's never left stranded with no one to complete it.
    pub async fn register(&self, entry: Arc<CallEntry<V>>) -> bool {
        if self.is_closing().await {
            return false;
        }
        let id = entry.id;
        self.pending.insert(id, entry);
        self.notify.notify_waiters();

        if self.is_closing().await {
            if let Some((_, stranded)) = self.pending.remove(&id) {
                let cause = self.close_cause_snapshot().await.unwrap_or(IpcError::ClientStopped);
                stranded.sink.complete_error(cause);
            }
            return false;
        }
        true
    }

    /// Serializes `entry`'s request frame onto the write side. On I/O
    /// failure, marks the connection closing with the failure as cause and
    /// tears it down.
    pub async fn send(self: &Arc<Self>, entry: &Arc<CallEntry<V>>) -> Result<(), IpcError> {
        let write_result = {
            let mut w = self.writer.lock().await;
            match w.as_mut() {
                Some(writer) => wire::write_request(writer, entry.id, &entry.payload).await,
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "no writer")),
            }
        };

        match write_result {
            Ok(()) => {
                self.touch_activity();
                Ok(())
            },
            Err(io_err) => {
                let e = IpcError::from_io(self.remote_addr, io_err);
                self.mark_closed(Some(e.duplicate())).await;
                self.close().await;
                Err(e)
            },
        }
    }

    /// Idempotent: performs the connect-retry loop and spawns the reader
    /// task the first time it is called; subsequent calls return
    /// immediately (successfully if setup already completed, with the
    /// stored close cause otherwise). MUST be called outside the pool's
    /// lock — connecting can take many seconds across retries.
    pub async fn setup_io(self: &Arc<Self>) -> Result<(), IpcError> {
        let _guard = self.setup_lock.lock().await;

        if self.setup_done.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.is_closing().await {
            return Err(self.close_cause_snapshot().await.unwrap_or(IpcError::ClientStopped));
        }

        match self.connect_with_retry().await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(self.cfg.tcp_nodelay) {
                    warn!(peer = %self.remote_addr, error = %e, "failed to set TCP_NODELAY");
                }
                let (read_half, mut write_half) = stream.into_split();
                let identity_bytes = self.identity.as_ref().map(|id| id.0.as_slice());

                if let Err(io_err) = wire::write_header(&mut write_half, identity_bytes).await {
                    let e = IpcError::from_io(self.remote_addr, io_err);
                    self.mark_closed(Some(e.duplicate())).await;
                    self.close().await;
                    return Err(e);
                }

                self.touch_activity();
                *self.writer.lock().await = Some(write_half);
                self.setup_done.store(true, Ordering::Release);

                let reader_conn = Arc::clone(self);
                tokio::spawn(async move {
                    reader_conn.reader_loop(read_half).await;
                });

                Ok(())
            },
            Err(e) => {
                self.mark_closed(Some(e.duplicate())).await;
                self.close().await;
                Err(e)
            },
        }
    }

    /// Two independent counters (connect timeouts vs. other I/O failures),
    /// a fixed per-attempt timeout, and a backoff between attempts — all
    /// executed while the setup lock is held (§4.3).
    async fn connect_with_retry(&self) -> Result<TcpStream, IpcError> {
        let mut timeout_failures: u32 = 0;
        let mut io_failures: u32 = 0;

        loop {
            if self.client_cancel.is_cancelled() {
                return Err(IpcError::ClientStopped);
            }

            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.remote_addr))
                .await
            {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(io_err)) => {
                    io_failures += 1;
                    let classified = IpcError::from_io(self.remote_addr, io_err);
                    if io_failures > self.cfg.max_retries {
                        return Err(classified);
                    }
                    debug!(
                        peer = %self.remote_addr,
                        io_failures,
                        "connect attempt failed, will retry"
                    );
                },
                Err(_elapsed) => {
                    timeout_failures += 1;
                    let classified = IpcError::SocketTimeout {
                        addr: self.remote_addr,
                        cause: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                    };
                    if timeout_failures > MAX_CONNECT_TIMEOUTS {
                        return Err(classified);
                    }
                    debug!(
                        peer = %self.remote_addr,
                        timeout_failures,
                        "connect attempt timed out, will retry"
                    );
                },
            }

            sleep(CONNECT_BACKOFF).await;
        }
    }

    /// Writes the ping sentinel, coalescing redundant pings: a ping is only
    /// actually written if the connection has been idle for at least a full
    /// `ping_interval` since the last activity.
    async fn send_ping(&self) -> io::Result<()> {
        let now = now_ms();
        let last = self.last_activity_ms.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.cfg.ping_interval.as_millis() as i64 {
            return Ok(());
        }
        {
            let mut w = self.writer.lock().await;
            if let Some(writer) = w.as_mut() {
                wire::write_ping(writer).await?;
            }
        }
        self.touch_activity();
        Ok(())
    }

    /// If `pending` is empty, waits up to `max_idle_time - age` for new
    /// work or a close signal. Loops on spurious/irrelevant wakeups so the
    /// caller always observes a settled state.
    async fn wait_for_work(&self) -> WakeReason {
        loop {
            if self.is_closing().await {
                return WakeReason::Closing;
            }
            // Checked unconditionally, not only when `pending` is
            // non-empty: an idle connection (empty `pending`) must also
            // wake and terminate once the client cancels, otherwise this
            // loop spins forever re-selecting an already-cancelled token
            // without ever setting `should_close`.
            if self.client_cancel.is_cancelled() {
                return WakeReason::Stopping;
            }
            if !self.pending.is_empty() {
                return WakeReason::HasWork;
            }

            let age_ms = now_ms().saturating_sub(self.last_activity_ms.load(Ordering::Acquire)).max(0);
            let remaining = self.cfg.max_idle_time.saturating_sub(Duration::from_millis(age_ms as u64));
            if remaining.is_zero() {
                return WakeReason::IdleTimedOut;
            }

            let notified = self.notify.notified();
            tokio::select! {
                _ = self.client_cancel.cancelled() => {},
                _ = notified => {},
                _ = sleep(remaining) => {},
            }
        }
    }

    /// Reads one frame, racing against a ping-interval timeout (the
    /// heartbeat mechanism) and the connection's closing signal so a
    /// concurrent `send` failure or `stop()` unblocks an in-flight read
    /// promptly.
    async fn receive_response(&self, read_half: &mut OwnedReadHalf) -> Result<(), IpcError> {
        self.touch_activity();
        loop {
            let closing_signal = self.notify.notified();
            let timed =
                tokio::time::timeout(self.cfg.ping_interval, wire::read_response_frame(read_half));

            tokio::select! {
                _ = self.client_cancel.cancelled() => {
                    return Err(IpcError::ClientStopped);
                }
                _ = closing_signal => {
                    if self.is_closing().await {
                        return Err(self.close_cause_snapshot().await.unwrap_or(IpcError::ClientStopped));
                    }
                    continue;
                }
                outcome = timed => {
                    match outcome {
                        Ok(Ok(frame)) => return self.dispatch_frame(frame).await,
                        Ok(Err(io_err)) => return Err(IpcError::from_io(self.remote_addr, io_err)),
                        Err(_elapsed) => {
                            if self.is_closing().await || self.client_cancel.is_cancelled() {
                                return Err(IpcError::SocketTimeout {
                                    addr: self.remote_addr,
                                    cause: io::Error::new(io::ErrorKind::TimedOut, "read timed out"),
                                });
                            }
                            self.send_ping().await.map_err(|e| IpcError::from_io(self.remote_addr, e))?;
                            continue;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch_frame(&self, frame: wire::ResponseFrame) -> Result<(), IpcError> {
        self.touch_activity();
        let call_id = match &frame {
            wire::ResponseFrame::Value { call_id, .. } => *call_id,
            wire::ResponseFrame::Error { call_id, .. } => *call_id,
        };

        let entry = self.pending.remove(&call_id).map(|(_, entry)| entry);

        let Some(entry) = entry else {
            return Err(IpcError::LocalIo {
                addr: self.remote_addr,
                cause: io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("response for unregistered call id {call_id}"),
                ),
            });
        };

        match frame {
            wire::ResponseFrame::Value { payload, .. } => {
                match V::read(&mut &payload[..]) {
                    Ok(value) => entry.sink.complete_value(value),
                    Err(io_err) => {
                        entry.sink.complete_error(IpcError::from_io(self.remote_addr, io_err))
                    },
                }
            },
            wire::ResponseFrame::Error { class_name, message, .. } => {
                entry.sink.complete_error(IpcError::Remote(RemoteException {
                    class_name,
                    message,
                }));
            },
        }
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        loop {
            match self.wait_for_work().await {
                WakeReason::HasWork => {},
                WakeReason::Closing => break,
                WakeReason::IdleTimedOut => {
                    self.mark_closed(None).await;
                    break;
                },
                WakeReason::Stopping => {
                    self.mark_closed(Some(IpcError::ClientStopped)).await;
                    break;
                },
            }

            if let Err(e) = self.receive_response(&mut read_half).await {
                self.mark_closed(Some(e)).await;
                break;
            }
        }
        self.close().await;
    }

    /// CAS `should_close` false -> true. Stores `cause` only on that first
    /// transition; a later call with a different cause is dropped, so the
    /// *first* cause observed always wins.
    async fn mark_closed(&self, cause: Option<IpcError>) {
        let mut guard = self.inner.lock().await;
        if guard.should_close {
            return;
        }
        guard.should_close = true;
        guard.close_cause = cause;
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Requires `should_close == true` (logs and returns otherwise).
    /// Self-deregisters from the pool, tears down the sockets, and
    /// completes every still-pending call with the close cause (synthesizing
    /// a generic cause if none was recorded). Idempotent.
    pub async fn close(self: &Arc<Self>) {
        if !self.is_closing().await {
            debug!(peer = %self.remote_addr, "close() called while still open, ignoring");
            return;
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!(peer = %self.remote_addr, "close() already ran");
            return;
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.remove_if_same(&self.key, self).await;
        }

        {
            let mut w = self.writer.lock().await;
            if let Some(mut writer) = w.take() {
                use tokio::io::AsyncWriteExt;
                let _ = writer.shutdown().await;
            }
        }

        let cause = {
            let mut guard = self.inner.lock().await;
            match guard.close_cause.take() {
                Some(c) => Some(c),
                None if !self.pending.is_empty() => Some(IpcError::LocalIo {
                    addr: self.remote_addr,
                    cause: io::Error::new(io::ErrorKind::Other, "unexpected closed connection"),
                }),
                None => None,
            }
        };

        if let Some(cause) = cause {
            self.cleanup_calls(cause).await;
        }
    }

    /// Completes every remaining pending call with `cause`, releasing every
    /// waiter with an error.
    async fn cleanup_calls(&self, cause: IpcError) {
        let ids: Vec<i32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.sink.complete_error(cause.duplicate());
            }
        }
    }
}
