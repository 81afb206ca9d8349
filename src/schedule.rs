// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Cancellable delayed work, used for debouncing and burst coalescing.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct Pending {
    handle: JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

/// At most one pending action at a time.
///
/// Scheduling again supersedes an action that has not fired yet. An action
/// that already started runs to completion.
#[derive(Default)]
pub struct ScheduledTask {
    pending: Option<Pending>,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay`, replacing any unfired action.
    pub fn schedule<F>(&mut self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            flag.store(true, Ordering::SeqCst);
            action.await;
        });
        self.pending = Some(Pending { handle, fired });
    }

    /// Run `action` after `delay` unless an action is already waiting, in
    /// which case that one absorbs this request.
    ///
    /// Returns `true` if a new action was scheduled.
    pub fn schedule_if_idle<F>(&mut self, delay: Duration, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_pending() {
            return false;
        }
        self.schedule(delay, action);
        true
    }

    /// Drop the unfired action, if any. Returns `true` if one was dropped.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) if !pending.fired.load(Ordering::SeqCst) => {
                pending.handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Whether an action is waiting for its delay to elapse.
    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| !p.fired.load(Ordering::SeqCst) && !p.handle.is_finished())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
