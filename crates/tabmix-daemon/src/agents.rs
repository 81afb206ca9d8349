// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Links from the coordinator to page-context agents.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tabmix_ipc::{AgentCommand, AgentRequest, ContextId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Default time an agent has to acknowledge a command.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("no agent connected for context {0}")]
    NotConnected(ContextId),
    #[error("agent for context {0} did not answer within {1:?}")]
    Timeout(ContextId, Duration),
    #[error("agent for context {0} went away")]
    Closed(ContextId),
    #[error("agent rejected command: {0}")]
    Rejected(String),
}

/// Delivery of commands into page contexts.
pub trait AgentLink: Send + Sync {
    /// Send a command and wait for the agent's acknowledgement.
    fn dispatch(
        &self,
        context_id: ContextId,
        command: AgentCommand,
    ) -> BoxFuture<'_, Result<Value, LinkError>>;
}

struct Connected {
    generation: u64,
    sender: mpsc::UnboundedSender<AgentRequest>,
}

/// Registry of connected agents, one command queue per context.
pub struct AgentRegistry {
    agents: Mutex<HashMap<ContextId, Connected>>,
    next_generation: Mutex<u64>,
    timeout: Duration,
}

impl AgentRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            next_generation: Mutex::new(0),
            timeout,
        }
    }

    /// Register an agent. A newer connection for the same context replaces
    /// the older one.
    ///
    /// Returns the connection generation (for [`Self::disconnect`]) and the
    /// queue the agent reads commands from.
    pub fn connect(&self, context_id: ContextId) -> (u64, mpsc::UnboundedReceiver<AgentRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };
        if self
            .agents
            .lock()
            .insert(context_id, Connected { generation, sender })
            .is_some()
        {
            debug!("Agent for context {} reconnected", context_id);
        }
        (generation, receiver)
    }

    /// Remove an agent, unless it has been replaced by a newer connection.
    pub fn disconnect(&self, context_id: ContextId, generation: u64) -> bool {
        let mut agents = self.agents.lock();
        match agents.get(&context_id) {
            Some(c) if c.generation == generation => {
                agents.remove(&context_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_connected(&self, context_id: ContextId) -> bool {
        self.agents.lock().contains_key(&context_id)
    }

    pub fn connected_count(&self) -> usize {
        self.agents.lock().len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_TIMEOUT)
    }
}

impl AgentLink for AgentRegistry {
    fn dispatch(
        &self,
        context_id: ContextId,
        command: AgentCommand,
    ) -> BoxFuture<'_, Result<Value, LinkError>> {
        Box::pin(async move {
            let (sender, generation) = {
                let agents = self.agents.lock();
                let connected = agents
                    .get(&context_id)
                    .ok_or(LinkError::NotConnected(context_id))?;
                (connected.sender.clone(), connected.generation)
            };

            let kind = command.kind_str();
            let (reply, response) = oneshot::channel();
            if sender.send(AgentRequest { command, reply }).is_err() {
                self.disconnect(context_id, generation);
                return Err(LinkError::Closed(context_id));
            }

            match tokio::time::timeout(self.timeout, response).await {
                Ok(Ok(Ok(ack))) => Ok(ack),
                Ok(Ok(Err(message))) => Err(LinkError::Rejected(message)),
                Ok(Err(_)) => Err(LinkError::Closed(context_id)),
                Err(_) => {
                    warn!(
                        "Agent for context {} did not acknowledge {} within {:?}",
                        context_id, kind, self.timeout
                    );
                    Err(LinkError::Timeout(context_id, self.timeout))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabmix_ipc::VolumeLevel;

    fn volume(level: i64) -> AgentCommand {
        AgentCommand::ApplyVolume {
            level: VolumeLevel::new(level).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_missing_agent() {
        let registry = AgentRegistry::default();
        assert_eq!(
            registry.dispatch(4, volume(50)).await,
            Err(LinkError::NotConnected(4))
        );
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let registry = AgentRegistry::default();
        let (_, mut rx) = registry.connect(1);
        let agent = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.command, volume(65));
            request.reply.send(Ok(json!({ "applied": 2 }))).unwrap();
        });
        assert_eq!(
            registry.dispatch(1, volume(65)).await,
            Ok(json!({ "applied": 2 }))
        );
        agent.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_out() {
        let registry = AgentRegistry::new(Duration::from_millis(500));
        let (_, _rx) = registry.connect(1);
        assert_eq!(
            registry.dispatch(1, volume(65)).await,
            Err(LinkError::Timeout(1, Duration::from_millis(500)))
        );
    }

    #[tokio::test]
    async fn test_dispatch_after_agent_dropped() {
        let registry = AgentRegistry::default();
        let (_, rx) = registry.connect(1);
        drop(rx);
        assert_eq!(
            registry.dispatch(1, volume(65)).await,
            Err(LinkError::Closed(1))
        );
        assert!(!registry.is_connected(1));
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_new_connection() {
        let registry = AgentRegistry::default();
        let (old, _rx1) = registry.connect(1);
        let (new, _rx2) = registry.connect(1);
        assert!(!registry.disconnect(1, old));
        assert!(registry.is_connected(1));
        assert!(registry.disconnect(1, new));
        assert_eq!(registry.connected_count(), 0);
    }
}
