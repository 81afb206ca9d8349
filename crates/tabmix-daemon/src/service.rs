// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Core coordinator logic and live state.
//!
//! The coordinator owns the registry of audio-producing page contexts,
//! routes panel commands to page agents, restores per-origin preferences
//! when audio starts, and keeps the durable store in step.

use crate::agents::{AgentLink, LinkError};
use crate::clock::Clock;
use crate::migration;
use crate::store::{Store, StoreError, SESSION_RETENTION_MS};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tabmix_ipc::{
    is_valid_origin, origin_from_url, target_identifiers, ActivityReportPayload, AgentCommand,
    AudioTab, Command, CommandEnvelope, ContextId, CoordinatorState, GlobalConfig,
    GlobalConfigPatch, ImportProfilesPayload, OriginVolumeProfile, PanelEvent, ResponseEnvelope,
    RestoreProfilePayload, TabPhase, TabmixError, Timestamp, VolumeLevel,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Handler result: reply data plus an optional degraded-mode warning.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub data: Value,
    pub warning: Option<TabmixError>,
}

impl Reply {
    fn data(data: Value) -> Self {
        Self {
            data,
            warning: None,
        }
    }

    fn with_warning(data: Value, warning: Option<TabmixError>) -> Self {
        Self { data, warning }
    }
}

/// Coordinator tuning that does not belong in user settings.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub session_retention_ms: u64,
    /// Profiles unused for longer than this are pruned. `None` disables aging.
    pub profile_max_age_ms: Option<u64>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            session_retention_ms: SESSION_RETENTION_MS,
            profile_max_age_ms: None,
        }
    }
}

pub struct Coordinator {
    registry: HashMap<ContextId, AudioTab>,
    state: CoordinatorState,
    store: Store,
    agents: Arc<dyn AgentLink>,
    clock: Arc<dyn Clock>,
    options: CoordinatorOptions,
    events: broadcast::Sender<PanelEvent>,
    notified_active: BTreeSet<ContextId>,
}

impl Coordinator {
    pub fn new(store: Store, agents: Arc<dyn AgentLink>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let now = clock.now();
        Self {
            registry: HashMap::new(),
            state: CoordinatorState::new(now),
            store,
            agents,
            clock,
            options: CoordinatorOptions::default(),
            events,
            notified_active: BTreeSet::new(),
        }
    }

    pub fn with_options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    pub fn tab(&self, context_id: ContextId) -> Option<&AudioTab> {
        self.registry.get(&context_id)
    }

    pub fn tab_count(&self) -> usize {
        self.registry.len()
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<PanelEvent> {
        self.events.clone()
    }

    /// Startup: migrate legacy data, drop expired session entries, pre-warm
    /// the registry from the snapshot and purge anything already stale.
    pub async fn init(&mut self) {
        let now = self.clock.now();
        info!("Coordinator starting");

        if let Err(e) = migration::migrate_legacy(&mut self.store, now).await {
            warn!("Legacy migration failed: {}", e);
        }

        let config = self.store.get_config().await;
        debug!("Loaded settings: {:?}", config);

        if let Err(e) = self
            .store
            .cleanup_stale_sessions(now, self.options.session_retention_ms)
            .await
        {
            warn!("Session cleanup failed: {}", e);
        }

        // Snapshot entries are hints only; activity must be re-reported.
        let snapshot = self.store.get_session_snapshot().await;
        let hinted = snapshot.len();
        for (id, mut tab) in snapshot {
            tab.is_audio_active = false;
            self.registry.insert(id, tab);
        }
        if hinted > 0 {
            info!("Pre-warmed registry with {} contexts from last session", hinted);
        }

        self.reconcile().await;
    }

    /// Persist a final snapshot before the coordinator goes away.
    pub async fn shutdown(&mut self) {
        info!("Coordinator shutting down");
        self.persist_snapshot().await;
        self.state.active_context_ids.clear();
    }

    /// Handle one envelope: schema validation, then dispatch by kind.
    pub async fn handle(&mut self, envelope: CommandEnvelope) -> ResponseEnvelope {
        let correlation_id = envelope.correlation_id.clone();
        let target = target_identifiers(&envelope);

        let command = match Command::parse(&envelope) {
            Ok(command) => command,
            Err(e) => {
                debug!("Rejected {} command: {}", envelope.kind, e);
                return ResponseEnvelope::failure(&e, target, correlation_id);
            }
        };

        match self.execute(command).await {
            Ok(reply) => ResponseEnvelope::success(reply.data, correlation_id)
                .with_warning(reply.warning.as_ref()),
            Err(e) => {
                debug!("{} failed: {}", envelope.kind, e);
                ResponseEnvelope::failure(&e, target, correlation_id)
            }
        }
    }

    /// Run an already validated command.
    pub async fn execute(&mut self, command: Command) -> Result<Reply, TabmixError> {
        match command {
            Command::ActivityReport(report) => self.on_activity_report(report).await,
            Command::SetVolume { context_id, level } => self.set_volume(context_id, level).await,
            Command::SetMute(p) => self.set_mute(p.context_id, p.muted).await,
            Command::ListActiveContexts => {
                let contexts = self.list_active_contexts().await;
                Ok(Reply::data(json!({ "contexts": contexts })))
            }
            Command::GetContextState(p) => {
                let tab = self
                    .registry
                    .get(&p.context_id)
                    .ok_or_else(|| TabmixError::NotFound(format!("context {}", p.context_id)))?;
                Ok(Reply::data(to_json(tab)?))
            }
            Command::RestoreProfile(p) => self.restore_profile(p).await,
            Command::ContextClosed(p) => {
                let removed = self.close_context(p.context_id).await;
                Ok(Reply::data(
                    json!({ "contextId": p.context_id, "removed": removed }),
                ))
            }
            Command::GetConfig => Ok(Reply::data(to_json(&self.store.get_config().await)?)),
            Command::UpdateConfig(patch) => self.update_config(patch).await,
            Command::ExportProfiles => {
                let profiles = self.store.export_profiles().await?;
                Ok(Reply::data(json!({ "profiles": profiles })))
            }
            Command::ImportProfiles(payload) => self.import_profiles(payload).await,
            Command::ResetOriginProfile(p) => {
                if !is_valid_origin(&p.origin) {
                    return Err(TabmixError::Validation(format!(
                        "malformed origin: {:?}",
                        p.origin
                    )));
                }
                let removed = self.store.delete_origin_profile(&p.origin).await?;
                Ok(Reply::data(json!({ "origin": p.origin, "removed": removed })))
            }
            Command::GetAgentStatus(p) => {
                if !self.registry.contains_key(&p.context_id) {
                    return Err(TabmixError::NotFound(format!("context {}", p.context_id)));
                }
                let status = self.send_to_agent(p.context_id, AgentCommand::AgentStatus).await?;
                Ok(Reply::data(status))
            }
            // Connection-level kinds; the transport does the registration.
            Command::AgentHello(p) => Ok(Reply::data(json!({ "contextId": p.context_id }))),
            Command::Subscribe => Ok(Reply::data(json!({ "subscribed": true }))),
        }
    }

    // ---- activity ----

    async fn on_activity_report(&mut self, report: ActivityReportPayload) -> Result<Reply, TabmixError> {
        let now = self.clock.now();
        let config = self.store.get_config().await;
        let id = report.context_id;

        let is_new = !self.registry.contains_key(&id);
        let tab = self.registry.entry(id).or_insert_with(|| {
            let mut tab = AudioTab::new(id, &report.url, now);
            tab.volume_level = config.default_volume;
            tab
        });
        if is_new {
            self.state.total_contexts_ever_controlled += 1;
            debug!("Tracking new context {}", id);
        }

        let was_active = tab.is_audio_active;
        if !report.url.is_empty() {
            tab.set_url(&report.url);
        }
        if !report.title.trim().is_empty() {
            tab.title = report.title.clone();
        }
        if report.favicon_ref.is_some() {
            tab.favicon_ref = report.favicon_ref.clone();
        }
        tab.detected_media_kinds = report.media_kinds.iter().cloned().collect();
        tab.is_audio_active = report.is_active;
        tab.touch(now);
        let origin = tab.origin.clone();

        if report.is_active {
            self.state.active_context_ids.insert(id);
        } else {
            self.state.active_context_ids.remove(&id);
        }

        // Restore completes before the report is acknowledged, so a later
        // SetVolume for this context cannot be overwritten by it.
        if report.is_active && !was_active {
            self.restore_on_activity(id, &origin, &config).await;
        }

        self.registry_changed().await;
        Ok(Reply::data(json!({
            "contextId": id,
            "isActive": report.is_active,
            "origin": origin,
        })))
    }

    async fn restore_on_activity(&mut self, id: ContextId, origin: &str, config: &GlobalConfig) {
        if !is_valid_origin(origin) {
            debug!("Context {} has no profile origin ({:?}), skipping restore", id, origin);
            return;
        }
        let now = self.clock.now();
        let profile = self.store.get_origin_profile(origin, now).await;

        let level = profile.default_volume;
        if let Err(e) = self.send_to_agent(id, AgentCommand::ApplyVolume { level }).await {
            warn!("Restoring volume for context {} failed: {}", id, e);
            return;
        }
        if let Err(e) = self
            .send_to_agent(id, AgentCommand::ApplyMute { muted: profile.is_muted })
            .await
        {
            warn!("Restoring mute for context {} failed: {}", id, e);
        } else if let Some(tab) = self.registry.get_mut(&id) {
            tab.is_muted = profile.is_muted;
        }
        if let Some(tab) = self.registry.get_mut(&id) {
            tab.volume_level = level;
        }
        info!("Restored {} (muted: {}) for {} on context {}", level, profile.is_muted, origin, id);

        if config.enable_notifications {
            let _ = self.events.send(PanelEvent::ProfileRestored {
                context_id: id,
                origin: origin.to_string(),
                level,
                muted: profile.is_muted,
            });
        }
    }

    async fn restore_profile(&mut self, p: RestoreProfilePayload) -> Result<Reply, TabmixError> {
        let now = self.clock.now();
        if let Some(tab) = self.registry.get_mut(&p.context_id) {
            tab.set_url(&p.url);
        }
        let origin = origin_from_url(&p.url);
        let profile = if is_valid_origin(&origin) {
            self.store.get_origin_profile(&origin, now).await
        } else {
            OriginVolumeProfile {
                origin: origin.clone(),
                ..OriginVolumeProfile::new("", now)
            }
        };
        Ok(Reply::data(json!({
            "defaultVolume": profile.default_volume,
            "isMuted": profile.is_muted,
        })))
    }

    // ---- panel commands ----

    async fn set_volume(&mut self, id: ContextId, level: VolumeLevel) -> Result<Reply, TabmixError> {
        if !self.registry.contains_key(&id) {
            return Err(TabmixError::NotFound(format!("context {}", id)));
        }
        let config = self.store.get_config().await;
        if level.get() > config.max_volume_limit {
            return Err(TabmixError::Validation(format!(
                "level {} exceeds the configured limit of {}",
                level.get(),
                config.max_volume_limit
            )));
        }

        self.send_to_agent(id, AgentCommand::ApplyVolume { level }).await?;

        let now = self.clock.now();
        let origin = match self.registry.get_mut(&id) {
            Some(tab) => {
                tab.volume_level = level;
                tab.touch(now);
                tab.origin.clone()
            }
            None => return Err(TabmixError::NotFound(format!("context {}", id))),
        };
        let warning = self
            .persist_profile(&origin, now, |p| p.default_volume = level)
            .await;
        self.persist_snapshot().await;

        Ok(Reply::with_warning(
            json!({ "contextId": id, "level": level }),
            warning,
        ))
    }

    async fn set_mute(&mut self, id: ContextId, muted: bool) -> Result<Reply, TabmixError> {
        if !self.registry.contains_key(&id) {
            return Err(TabmixError::NotFound(format!("context {}", id)));
        }

        self.send_to_agent(id, AgentCommand::ApplyMute { muted }).await?;

        let now = self.clock.now();
        let origin = match self.registry.get_mut(&id) {
            Some(tab) => {
                tab.is_muted = muted;
                tab.touch(now);
                tab.origin.clone()
            }
            None => return Err(TabmixError::NotFound(format!("context {}", id))),
        };
        let warning = self.persist_profile(&origin, now, |p| p.is_muted = muted).await;
        self.persist_snapshot().await;

        Ok(Reply::with_warning(
            json!({ "contextId": id, "muted": muted }),
            warning,
        ))
    }

    /// Active contexts with a usable title (all titled contexts when
    /// `showInactiveContexts` is set), ordered by context id.
    pub async fn list_active_contexts(&mut self) -> Vec<AudioTab> {
        let show_inactive = self.store.get_config().await.show_inactive_contexts;
        self.visible_tabs(show_inactive)
    }

    fn visible_tabs(&self, show_inactive: bool) -> Vec<AudioTab> {
        let mut tabs: Vec<AudioTab> = self
            .registry
            .values()
            .filter(|t| (show_inactive || t.is_audio_active) && t.has_title())
            .cloned()
            .collect();
        tabs.sort_by_key(|t| t.context_id);
        tabs
    }

    async fn update_config(&mut self, patch: GlobalConfigPatch) -> Result<Reply, TabmixError> {
        let current = self.store.get_config().await;
        let next = current.patched(&patch)?;
        let warning = match self.store.save_config(&next).await {
            Ok(()) => None,
            Err(e) if e.is_degraded() => Some(TabmixError::from(e)),
            Err(e) => return Err(e.into()),
        };
        info!("Settings updated");
        Ok(Reply::with_warning(to_json(&next)?, warning))
    }

    async fn import_profiles(&mut self, payload: ImportProfilesPayload) -> Result<Reply, TabmixError> {
        let mut batch = self.store.begin_batch(payload.average);
        for profile in payload.profiles {
            batch.queue(profile)?;
        }
        let queued = batch.len();
        match self.store.flush_batch(batch).await {
            Ok(imported) => Ok(Reply::data(json!({ "imported": imported }))),
            Err(e) if e.is_degraded() => Ok(Reply::with_warning(
                json!({ "imported": queued }),
                Some(e.into()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    // ---- lifecycle ----

    /// Drop a context immediately, bypassing the grace window.
    pub async fn close_context(&mut self, id: ContextId) -> bool {
        let removed = self.registry.remove(&id).is_some();
        self.state.active_context_ids.remove(&id);
        if removed {
            debug!("Context {} closed", id);
            self.registry_changed().await;
        }
        removed
    }

    /// Purge contexts inactive beyond the grace window. Never touches
    /// origin profiles, except through the explicit aging option.
    pub async fn reconcile(&mut self) -> usize {
        let now = self.clock.now();
        let config = self.store.get_config().await;

        let mut purged = 0;
        if config.auto_cleanup {
            let grace = config.cleanup_delay_ms();
            let stale: Vec<ContextId> = self
                .registry
                .values()
                .filter(|t| t.phase(now, grace) == TabPhase::Stale)
                .map(|t| t.context_id)
                .collect();
            for id in &stale {
                self.registry.remove(id);
                self.state.active_context_ids.remove(id);
            }
            purged = stale.len();
            if purged > 0 {
                info!("Purged {} stale contexts", purged);
                self.registry_changed().await;
            }
        }

        if let Some(max_age) = self.options.profile_max_age_ms {
            if let Err(e) = self.store.prune_profiles(now.saturating_sub(max_age)).await {
                warn!("Profile aging failed: {}", e);
            }
        }
        purged
    }

    // ---- helpers ----

    async fn send_to_agent(&self, id: ContextId, command: AgentCommand) -> Result<Value, TabmixError> {
        self.agents
            .dispatch(id, command)
            .await
            .map_err(|e| match e {
                LinkError::Rejected(message) => TabmixError::Internal(message),
                LinkError::NotConnected(_) | LinkError::Timeout(..) | LinkError::Closed(_) => {
                    TabmixError::AgentUnreachable(id)
                }
            })
    }

    /// Write-through update of an origin's profile. Returns a warning when
    /// the durable tier could not take the write.
    async fn persist_profile<F>(&mut self, origin: &str, now: Timestamp, update: F) -> Option<TabmixError>
    where
        F: FnOnce(&mut OriginVolumeProfile),
    {
        if !is_valid_origin(origin) {
            debug!("No durable profile for origin {:?}", origin);
            return None;
        }
        let mut profile = self.store.get_origin_profile(origin, now).await;
        update(&mut profile);
        profile.last_used_timestamp = profile.last_used_timestamp.max(now);
        match self.store.save_origin_profile(&profile).await {
            Ok(()) => None,
            Err(StoreError::Validation(m)) => {
                warn!("Profile for {} not saved: {}", origin, m);
                None
            }
            Err(e) => Some(e.into()),
        }
    }

    async fn persist_snapshot(&self) {
        if let Err(e) = self.store.save_session_snapshot(self.registry.values()).await {
            warn!("Failed to save session snapshot: {}", e);
        }
    }

    async fn registry_changed(&mut self) {
        self.state.last_update_timestamp = self.clock.now();
        self.persist_snapshot().await;

        if self.state.active_context_ids != self.notified_active {
            self.notified_active = self.state.active_context_ids.clone();
            let show_inactive = self.store.get_config().await.show_inactive_contexts;
            let contexts = self.visible_tabs(show_inactive);
            let _ = self
                .events
                .send(PanelEvent::ActiveContextsChanged { contexts });
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, TabmixError> {
    serde_json::to_value(value).map_err(|e| TabmixError::Internal(e.to_string()))
}
