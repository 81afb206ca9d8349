// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Single-task ownership of the [`Coordinator`].
//!
//! All commands and timer ticks go through one queue, so they are handled
//! strictly in arrival order and never interleave.

use crate::service::Coordinator;
use std::time::Duration;
use tabmix_ipc::{CommandEnvelope, PanelEvent, ResponseEnvelope, TabmixError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

enum Request {
    Command {
        envelope: CommandEnvelope,
        reply: oneshot::Sender<ResponseEnvelope>,
    },
    Reconcile {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    requests: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<PanelEvent>,
}

impl CoordinatorHandle {
    /// Enqueue a command and return the receiver for its reply.
    ///
    /// Enqueueing is synchronous, so commands submitted in sequence from
    /// one task keep their order even when the replies are awaited later.
    pub fn submit(
        &self,
        envelope: CommandEnvelope,
    ) -> Result<oneshot::Receiver<ResponseEnvelope>, TabmixError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Command { envelope, reply })
            .map_err(|_| stopped())?;
        Ok(response)
    }

    pub async fn request(&self, envelope: CommandEnvelope) -> Result<ResponseEnvelope, TabmixError> {
        self.submit(envelope)?.await.map_err(|_| stopped())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.events.subscribe()
    }

    /// Run a staleness pass now instead of waiting for the next tick.
    pub async fn reconcile(&self) -> Result<usize, TabmixError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Reconcile { reply })
            .map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())
    }

    /// Persist state and stop the coordinator task.
    pub async fn shutdown(&self) -> Result<(), TabmixError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Shutdown { reply })
            .map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())
    }
}

fn stopped() -> TabmixError {
    TabmixError::Internal("coordinator is not running".into())
}

/// Start the coordinator on its own task, reconciling every `reconcile_every`.
///
/// The coordinator must already be initialized.
pub fn spawn(
    mut coordinator: Coordinator,
    reconcile_every: Duration,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (requests, mut queue) = mpsc::unbounded_channel();
    let handle = CoordinatorHandle {
        requests,
        events: coordinator.event_sender(),
    };

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reconcile_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; init already reconciled.
        ticker.tick().await;

        loop {
            tokio::select! {
                request = queue.recv() => match request {
                    Some(Request::Command { envelope, reply }) => {
                        let response = coordinator.handle(envelope).await;
                        let _ = reply.send(response);
                    }
                    Some(Request::Reconcile { reply }) => {
                        let _ = reply.send(coordinator.reconcile().await);
                    }
                    Some(Request::Shutdown { reply }) => {
                        coordinator.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        debug!("All coordinator handles dropped");
                        coordinator.shutdown().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    coordinator.reconcile().await;
                }
            }
        }
        info!("Coordinator task stopped");
    });

    (handle, task)
}
