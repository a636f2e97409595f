// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded, drop-oldest outbound queue (spec §4.1 "Backpressure", §7
//! *Backpressure* error kind): when a consumer falls behind, the hub drops
//! the oldest undelivered item rather than blocking the single-writer
//! session actor or unbounding memory. The consumer detects the resulting
//! gap itself (via `seq`, for viewers) and resynchronizes — this queue only
//! needs to count what it drops.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// A bounded queue that drops its oldest entry instead of blocking the
/// producer when full. Cloning the `Arc` gives the consumer-side handle;
/// `push` is a cheap, synchronous, non-blocking call safe to invoke from an
/// actor's hot path.
pub struct Outbox<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

impl<T> Outbox<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Push an item, dropping the oldest queued item if at capacity.
    pub fn push(&self, item: T) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(item);
        drop(guard);
        self.notify.notify_one();
    }

    /// Mark the outbox closed; wakes any waiting receiver so it observes
    /// `recv() == None` once drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Pull the next batch of queued items, waiting if empty. Returns
    /// `None` once closed and drained.
    pub async fn recv_batch(&self) -> Option<Vec<T>> {
        loop {
            {
                let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if !guard.is_empty() {
                    return Some(guard.drain(..).collect());
                }
                if self.closed.load(Ordering::Relaxed) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Count of items dropped due to capacity overflow since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[path = "outbox_tests.rs"]
mod tests;
