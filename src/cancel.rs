// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Cancellation for long-running diagnostic operations.
//!
//! A [`CancelHandle`] flips a `watch` channel that any number of
//! [`CancelToken`] clones observe. Cancellation is sticky: a token checked
//! after the handle fired still reports cancelled.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Create a connected handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // With the sender gone `cancelled()` parks forever.
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. If the handle is dropped
    /// without cancelling, this never resolves.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One cancellable operation per fan channel.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    handles: Mutex<HashMap<usize, CancelHandle>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `fan_index` for a new operation, or `None` if one is running.
    /// The channel is released when the returned [`CancelSlot`] is dropped.
    pub fn register(&self, fan_index: usize) -> Option<(CancelSlot<'_>, CancelToken)> {
        let mut handles = self.lock();
        if handles.contains_key(&fan_index) {
            return None;
        }
        let (handle, token) = cancel_pair();
        handles.insert(fan_index, handle);
        Some((
            CancelSlot {
                registry: self,
                fan_index,
            },
            token,
        ))
    }

    /// Signal the operation running on `fan_index`. Returns `false` if none is.
    pub fn cancel(&self, fan_index: usize) -> bool {
        match self.lock().get(&fan_index) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, fan_index: usize) -> bool {
        self.lock().contains_key(&fan_index)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, CancelHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registration held for the duration of an operation.
#[must_use = "the channel is released as soon as the slot is dropped"]
pub struct CancelSlot<'a> {
    registry: &'a CancelRegistry,
    fan_index: usize,
}

impl Drop for CancelSlot<'_> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.fan_index);
    }
}
