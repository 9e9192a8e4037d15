// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Parallel Coordinator (§4.6): a fixed-size, positionally-indexed result
//! array shared by a fan-out `call(params[], addrs[])` invocation.
//!
//! `size` starts at `params.len()` and is decremented by the facade for
//! every call that fails before it could even be registered on a
//! connection (§4.5); `count` is incremented by [`ParallelSlot`] for every
//! call that reaches a terminal outcome after that point. The fan-out
//! unblocks once `count == size`, so a submit-time failure and a post-submit
//! failure both "count" toward completion without ever raising.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::Notify;

use crate::{client::call::CallSink, error::IpcError};

/// Shared state for one `call(params[], addrs[])` fan-out.
pub struct ParallelResults<V> {
    slots: Vec<Mutex<Option<V>>>,
    size: AtomicUsize,
    count: AtomicUsize,
    done: Notify,
}

impl<V: Send + 'static> ParallelResults<V> {
    /// Allocates a coordinator expecting `n` completions.
    pub fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: (0..n).map(|_| Mutex::new(None)).collect(),
            size: AtomicUsize::new(n),
            count: AtomicUsize::new(0),
            done: Notify::new(),
        })
    }

    /// Called by the facade when call `index` could not even be submitted
    /// (acquire or send failed before registration). Shrinks the expected
    /// completion count by one so the overall wait still terminates.
    pub fn decrement_expected(&self) {
        let prev = self.size.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "decremented size below zero");
        self.maybe_signal();
    }

    fn maybe_signal(&self) {
        if self.count.load(Ordering::Acquire) >= self.size.load(Ordering::Acquire) {
            self.done.notify_waiters();
        }
    }

    /// Blocks until every expected call has completed (successfully, with an
    /// error, or by submit-time decrement), then returns the result array.
    /// Failed or never-submitted slots remain `None`.
    pub async fn wait(self: &Arc<Self>) -> Vec<Option<V>> {
        loop {
            let notified = self.done.notified();
            if self.count.load(Ordering::Acquire) >= self.size.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }
        self.slots.iter().map(|slot| slot.lock().expect("poisoned").take()).collect()
    }
}

/// A [`CallSink`] that routes completion to a coordinator slot instead of
/// waking a private caller. This is the "complete override" the design
/// refers to: the parallel path never raises, it only ever stores `None` on
/// failure.
pub struct ParallelSlot<V> {
    results: Arc<ParallelResults<V>>,
    index: usize,
}

impl<V: Send + 'static> ParallelSlot<V> {
    pub fn new(results: Arc<ParallelResults<V>>, index: usize) -> Self {
        Self { results, index }
    }
}

impl<V: Send + 'static> CallSink<V> for ParallelSlot<V> {
    fn complete_value(&self, value: V) {
        *self.results.slots[self.index].lock().expect("poisoned") = Some(value);
        self.results.count.fetch_add(1, Ordering::AcqRel);
        self.results.maybe_signal();
    }

    fn complete_error(&self, error: IpcError) {
        tracing::warn!(index = self.index, %error, "parallel call failed, leaving slot empty");
        self.results.count.fetch_add(1, Ordering::AcqRel);
        self.results.maybe_signal();
    }
}
