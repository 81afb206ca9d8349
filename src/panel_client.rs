// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Front-panel side of the coordinator protocol.

use crate::schedule::ScheduledTask;
use crate::transport::{CommandSink, Connection};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tabmix_ipc::{
    panel_event_from_envelope, AgentStatus, AudioTab, Command, CommandEnvelope, ContextId,
    ContextPayload, GlobalConfig, GlobalConfigPatch, ImportProfilesPayload, OriginPayload,
    OriginVolumeProfile, PanelEvent, SetMutePayload, TabmixError, VolumeLevel,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Quiet period after the last slider movement before a level is sent.
pub const VOLUME_DEBOUNCE: Duration = Duration::from_millis(300);

pub struct PanelClient {
    connection: Arc<Connection>,
    inbound: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<CommandEnvelope>>>,
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, TabmixError> {
    serde_json::from_value(value)
        .map_err(|e| TabmixError::Internal(format!("unexpected response shape: {}", e)))
}

impl PanelClient {
    pub async fn connect(path: &Path) -> Result<Self, TabmixError> {
        let (connection, inbound) = Connection::connect(path).await?;
        Ok(Self::from_connection(connection, inbound))
    }

    pub fn from_connection(
        connection: Arc<Connection>,
        inbound: mpsc::UnboundedReceiver<CommandEnvelope>,
    ) -> Self {
        Self {
            connection,
            inbound: parking_lot::Mutex::new(Some(inbound)),
        }
    }

    async fn call(&self, command: Command) -> Result<Value, TabmixError> {
        self.connection.send(command).await
    }

    pub async fn list_active_contexts(&self) -> Result<Vec<AudioTab>, TabmixError> {
        #[derive(Deserialize)]
        struct Listing {
            contexts: Vec<AudioTab>,
        }
        let listing: Listing = decode(self.call(Command::ListActiveContexts).await?)?;
        Ok(listing.contexts)
    }

    pub async fn context_state(&self, context_id: ContextId) -> Result<AudioTab, TabmixError> {
        decode(
            self.call(Command::GetContextState(ContextPayload { context_id }))
                .await?,
        )
    }

    /// Send a level immediately. Out-of-range levels fail before anything is
    /// sent.
    pub async fn set_volume(&self, context_id: ContextId, level: i64) -> Result<Value, TabmixError> {
        let level = VolumeLevel::new(level)?;
        self.call(Command::SetVolume { context_id, level }).await
    }

    pub async fn set_mute(&self, context_id: ContextId, muted: bool) -> Result<Value, TabmixError> {
        self.call(Command::SetMute(SetMutePayload { context_id, muted }))
            .await
    }

    pub async fn get_config(&self) -> Result<GlobalConfig, TabmixError> {
        decode(self.call(Command::GetConfig).await?)
    }

    pub async fn update_config(&self, patch: GlobalConfigPatch) -> Result<GlobalConfig, TabmixError> {
        decode(self.call(Command::UpdateConfig(patch)).await?)
    }

    pub async fn export_profiles(&self) -> Result<Vec<OriginVolumeProfile>, TabmixError> {
        #[derive(Deserialize)]
        struct Export {
            profiles: Vec<OriginVolumeProfile>,
        }
        let export: Export = decode(self.call(Command::ExportProfiles).await?)?;
        Ok(export.profiles)
    }

    pub async fn import_profiles(
        &self,
        profiles: Vec<OriginVolumeProfile>,
        average: bool,
    ) -> Result<usize, TabmixError> {
        #[derive(Deserialize)]
        struct Import {
            imported: usize,
        }
        let import: Import = decode(
            self.call(Command::ImportProfiles(ImportProfilesPayload { profiles, average }))
                .await?,
        )?;
        Ok(import.imported)
    }

    /// Returns whether a profile existed.
    pub async fn reset_origin_profile(&self, origin: &str) -> Result<bool, TabmixError> {
        #[derive(Deserialize)]
        struct Reset {
            removed: bool,
        }
        let reset: Reset = decode(
            self.call(Command::ResetOriginProfile(OriginPayload {
                origin: origin.to_string(),
            }))
            .await?,
        )?;
        Ok(reset.removed)
    }

    pub async fn agent_status(&self, context_id: ContextId) -> Result<AgentStatus, TabmixError> {
        decode(
            self.call(Command::GetAgentStatus(ContextPayload { context_id }))
                .await?,
        )
    }

    /// Start receiving push notifications. Only the first call gets a
    /// receiver; later calls fail with `Internal`.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<PanelEvent>, TabmixError> {
        let mut inbound = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| TabmixError::Internal("already subscribed".into()))?;
        self.call(Command::Subscribe).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                match panel_event_from_envelope(&envelope) {
                    Some(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    None => debug!("Ignoring {} frame on panel connection", envelope.kind),
                }
            }
        });
        Ok(rx)
    }

    /// A debouncer that sends through this client's connection.
    pub fn debouncer(&self) -> (VolumeDebouncer, mpsc::UnboundedReceiver<DebounceFailure>) {
        VolumeDebouncer::new(self.connection.clone(), VOLUME_DEBOUNCE)
    }
}

/// A debounced level the coordinator refused. The panel reverts its slider.
#[derive(Debug, Clone, PartialEq)]
pub struct DebounceFailure {
    pub context_id: ContextId,
    pub level: VolumeLevel,
    pub error: TabmixError,
}

/// Collapses bursts of `SetVolume` per context into the last value.
pub struct VolumeDebouncer {
    sink: Arc<dyn CommandSink>,
    quiet: Duration,
    pending: HashMap<ContextId, ScheduledTask>,
    failures: mpsc::UnboundedSender<DebounceFailure>,
}

impl VolumeDebouncer {
    pub fn new(
        sink: Arc<dyn CommandSink>,
        quiet: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<DebounceFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            sink,
            quiet,
            pending: HashMap::new(),
            failures,
        };
        (debouncer, rx)
    }

    /// Queue a level, superseding any level for the same context that has
    /// not been sent yet.
    pub fn set_volume(&mut self, context_id: ContextId, level: VolumeLevel) {
        let sink = self.sink.clone();
        let failures = self.failures.clone();
        self.pending
            .entry(context_id)
            .or_default()
            .schedule(self.quiet, async move {
                if let Err(error) = sink.send(Command::SetVolume { context_id, level }).await {
                    warn!("Volume {} for context {} rejected: {}", level, context_id, error);
                    let _ = failures.send(DebounceFailure {
                        context_id,
                        level,
                        error,
                    });
                }
            });
    }

    /// Drop the unsent level for a context. Returns `true` if one was pending.
    pub fn cancel(&mut self, context_id: ContextId) -> bool {
        self.pending
            .remove(&context_id)
            .is_some_and(|mut task| task.cancel())
    }

    pub fn is_pending(&self, context_id: ContextId) -> bool {
        self.pending
            .get(&context_id)
            .is_some_and(ScheduledTask::is_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Command>>,
        reject: bool,
    }

    impl CommandSink for RecordingSink {
        fn send(&self, command: Command) -> BoxFuture<'static, Result<Value, TabmixError>> {
            self.sent.lock().push(command);
            let reject = self.reject;
            Box::pin(async move {
                if reject {
                    Err(TabmixError::AgentUnreachable(1))
                } else {
                    Ok(json!({}))
                }
            })
        }
    }

    fn level(v: i64) -> VolumeLevel {
        VolumeLevel::new(v).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_slider_drag_sends_final_value_once() {
        let sink = Arc::new(RecordingSink::default());
        let (mut debouncer, _failures) = VolumeDebouncer::new(sink.clone(), VOLUME_DEBOUNCE);

        debouncer.set_volume(1, level(60));
        tokio::time::sleep(Duration::from_millis(50)).await;
        debouncer.set_volume(1, level(70));
        tokio::time::sleep(Duration::from_millis(70)).await;
        debouncer.set_volume(1, level(80));
        assert!(debouncer.is_pending(1));

        tokio::time::sleep(Duration::from_millis(299)).await;
        assert!(sink.sent.lock().is_empty());
        tokio::time::sleep(Duration::from_millis(2)).await;

        let sent = sink.sent.lock().clone();
        assert_eq!(
            sent,
            vec![Command::SetVolume {
                context_id: 1,
                level: level(80)
            }]
        );
        assert!(!debouncer.is_pending(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contexts_debounce_independently() {
        let sink = Arc::new(RecordingSink::default());
        let (mut debouncer, _failures) = VolumeDebouncer::new(sink.clone(), VOLUME_DEBOUNCE);

        debouncer.set_volume(1, level(10));
        debouncer.set_volume(2, level(20));
        debouncer.set_volume(1, level(15));
        tokio::time::sleep(Duration::from_millis(400)).await;

        let mut sent: Vec<(ContextId, u8)> = sink
            .sent
            .lock()
            .iter()
            .filter_map(|c| match c {
                Command::SetVolume { context_id, level } => Some((*context_id, level.get())),
                _ => None,
            })
            .collect();
        sent.sort();
        assert_eq!(sent, vec![(1, 15), (2, 20)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_failure_reporting() {
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
            reject: true,
        });
        let (mut debouncer, mut failures) = VolumeDebouncer::new(sink.clone(), VOLUME_DEBOUNCE);

        debouncer.set_volume(1, level(50));
        assert!(debouncer.cancel(1));
        assert!(!debouncer.cancel(1));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(sink.sent.lock().is_empty());

        debouncer.set_volume(1, level(90));
        tokio::time::sleep(Duration::from_millis(400)).await;
        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.context_id, 1);
        assert_eq!(failure.level, level(90));
        assert_eq!(failure.error, TabmixError::AgentUnreachable(1));
    }
}
