// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Call Slot (§4.2): the rendezvous between a caller awaiting a result and
//! the connection's reader worker completing it.
//!
//! Two sink implementations share the same `CallSink` seam: [`SingleCall`]
//! wakes exactly one `await`er through a oneshot channel, and
//! [`ParallelSlot`] (see [`crate::client::parallel`]) instead writes into a
//! positionally-indexed result array. The connection's pending map stores
//! `Arc<dyn CallSink<V>>` so `receive_response` does not need to know which
//! kind of caller is waiting.

use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::IpcError;

/// The terminal state of a [`SingleCall`]: exactly one of value or error.
#[derive(Debug)]
pub enum CallOutcome<V> {
    Value(V),
    Error(IpcError),
}

/// Completion seam shared by single calls and parallel fan-out calls.
///
/// Implementations MUST make completion idempotent: a second call to either
/// method after the first is a silent no-op. This is what lets
/// `cleanup_calls` and `receive_response` race without a higher-level lock.
pub trait CallSink<V>: Send + Sync {
    fn complete_value(&self, value: V);
    fn complete_error(&self, error: IpcError);
}

/// One in-flight call registered on a connection: its id, its already
/// serialized request payload (kept around only long enough for `send` to
/// write it), and where its outcome should land.
pub struct CallEntry<V> {
    pub id: i32,
    pub payload: Bytes,
    pub sink: std::sync::Arc<dyn CallSink<V>>,
}

/// A call slot awaited by a single caller via [`SingleCall::wait`].
///
/// Backed by a oneshot channel: the channel itself guarantees "wake exactly
/// one waiter", and the `Mutex<Option<Sender>>` around it guarantees
/// "complete exactly once" even when `receive_response` and
/// `cleanup_calls`/timeout race to finish the same call.
pub struct SingleCall<V> {
    tx: Mutex<Option<oneshot::Sender<CallOutcome<V>>>>,
}

impl<V: Send + 'static> SingleCall<V> {
    /// Creates a fresh slot and the receiver half the caller will `await`.
    pub fn new() -> (Self, oneshot::Receiver<CallOutcome<V>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Mutex::new(Some(tx)) }, rx)
    }
}

impl<V: Send + 'static> CallSink<V> for SingleCall<V> {
    fn complete_value(&self, value: V) {
        if let Some(tx) = self.tx.lock().expect("call slot mutex poisoned").take() {
            let _ = tx.send(CallOutcome::Value(value));
        }
    }

    fn complete_error(&self, error: IpcError) {
        if let Some(tx) = self.tx.lock().expect("call slot mutex poisoned").take() {
            let _ = tx.send(CallOutcome::Error(error));
        }
    }
}
