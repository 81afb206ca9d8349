// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Durable store: per-origin profiles, global config and the session snapshot.
//!
//! Reads go through an in-memory cache. The cache is refreshed from change
//! notifications reported by the storage areas, and updated in the same
//! step as every committed write, so no stale value is visible after a
//! write returns.

use crate::storage::{StorageArea, StorageChange, StorageError};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tabmix_ipc::{
    AudioTab, ContextId, GlobalConfig, OriginVolumeProfile, TabmixError,
    Timestamp,
};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

pub const ORIGIN_PROFILES_KEY: &str = "originProfiles";
pub const GLOBAL_CONFIG_KEY: &str = "globalConfig";
pub const SESSION_SNAPSHOT_KEY: &str = "sessionSnapshot";

/// Retention of session-snapshot entries, in milliseconds.
pub const SESSION_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("invalid data: {0}")]
    Validation(String),
    #[error("{0}")]
    QuotaExceeded(String),
    #[error("{0}")]
    Unavailable(String),
}

impl StoreError {
    /// Degraded-mode failures leave the cache authoritative.
    pub fn is_degraded(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded(_) | StoreError::Unavailable(_))
    }
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::QuotaExceeded { .. } => StoreError::QuotaExceeded(e.to_string()),
            StorageError::Unavailable { .. } => StoreError::Unavailable(e.to_string()),
        }
    }
}

impl From<StoreError> for TabmixError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(m) => TabmixError::Validation(m),
            StoreError::QuotaExceeded(m) => TabmixError::QuotaExceeded(m),
            StoreError::Unavailable(m) => TabmixError::Unavailable(m),
        }
    }
}

/// Which storage area to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Durable, synced between devices.
    Synced,
    /// Durable, this device only.
    Local,
    /// Fast, session scoped.
    Session,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Synced, Tier::Local, Tier::Session];
}

/// The storage areas a store is built on. A missing area makes every
/// operation on it report `Unavailable`.
#[derive(Clone, Default)]
pub struct StorageTiers {
    pub synced: Option<Arc<dyn StorageArea>>,
    pub local: Option<Arc<dyn StorageArea>>,
    pub session: Option<Arc<dyn StorageArea>>,
}

/// Origin profile writes queued for a single durable write.
#[derive(Debug, Default)]
pub struct ProfileBatch {
    queued: BTreeMap<String, OriginVolumeProfile>,
    average: bool,
}

impl ProfileBatch {
    /// Queue a profile; duplicates for an origin are merged.
    pub fn queue(&mut self, profile: OriginVolumeProfile) -> Result<(), StoreError> {
        profile
            .validate()
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        let key = profile.origin.to_ascii_lowercase();
        let merged = match self.queued.get(&key) {
            Some(existing) => existing.merge(&profile, self.average),
            None => profile,
        };
        self.queued.insert(key, merged);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

/// Cached access to the persisted namespaces.
pub struct Store {
    tiers: StorageTiers,
    profiles: HashMap<String, OriginVolumeProfile>,
    config: Option<GlobalConfig>,
    sync_profiles: bool,
    changes: Vec<broadcast::Receiver<StorageChange>>,
}

impl Store {
    pub fn new(tiers: StorageTiers) -> Self {
        let changes = [&tiers.synced, &tiers.local]
            .into_iter()
            .flatten()
            .map(|area| area.subscribe())
            .collect();
        Self {
            tiers,
            profiles: HashMap::new(),
            config: None,
            sync_profiles: true,
            changes,
        }
    }

    pub fn area(&self, tier: Tier) -> Option<&Arc<dyn StorageArea>> {
        match tier {
            Tier::Synced => self.tiers.synced.as_ref(),
            Tier::Local => self.tiers.local.as_ref(),
            Tier::Session => self.tiers.session.as_ref(),
        }
    }

    fn require(&self, tier: Tier) -> Result<Arc<dyn StorageArea>, StoreError> {
        self.area(tier)
            .cloned()
            .ok_or_else(|| StoreError::Unavailable(format!("{:?} storage is not available", tier)))
    }

    fn profile_tier(&self) -> Tier {
        if self.sync_profiles {
            Tier::Synced
        } else {
            Tier::Local
        }
    }

    // ---- change notifications ----

    /// Apply pending change notifications to the cache.
    pub fn poll_changes(&mut self) {
        let mut pending = Vec::new();
        let mut lagged = false;
        for rx in &mut self.changes {
            loop {
                match rx.try_recv() {
                    Ok(change) => pending.push(change),
                    Err(TryRecvError::Lagged(n)) => {
                        warn!("Missed {} storage change notifications, dropping cache", n);
                        lagged = true;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }
        if lagged {
            self.profiles.clear();
            self.config = None;
        }
        for change in pending {
            self.apply_change(&change);
        }
    }

    fn apply_change(&mut self, change: &StorageChange) {
        let profile_area = self.area(self.profile_tier()).map(|a| a.name().to_string());
        let synced_area = self.area(Tier::Synced).map(|a| a.name().to_string());

        for (key, value) in &change.changes {
            if key == ORIGIN_PROFILES_KEY && profile_area.as_deref() == Some(change.area.as_str()) {
                let incoming = value
                    .as_ref()
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let before = self.profiles.len();
                self.profiles.retain(|origin, cached| {
                    let fresh = incoming
                        .get(origin)
                        .and_then(|v| serde_json::from_value::<OriginVolumeProfile>(v.clone()).ok());
                    fresh.as_ref() == Some(cached)
                });
                let dropped = before - self.profiles.len();
                if dropped > 0 {
                    debug!("Invalidated {} cached origin profiles from {}", dropped, change.area);
                }
            } else if key == GLOBAL_CONFIG_KEY && synced_area.as_deref() == Some(change.area.as_str())
            {
                let fresh = value
                    .as_ref()
                    .and_then(|v| serde_json::from_value::<GlobalConfig>(v.clone()).ok());
                if fresh != self.config {
                    debug!("Invalidated cached global config");
                    self.config = None;
                }
                // Unreadable or removed settings fall back to the defaults.
                let sync = fresh.as_ref().map_or_else(
                    || GlobalConfig::default().sync_across_devices,
                    |c| c.sync_across_devices,
                );
                if sync != self.sync_profiles {
                    let tier = if sync { Tier::Synced } else { Tier::Local };
                    info!("Another writer moved profile storage to the {:?} tier", tier);
                    self.sync_profiles = sync;
                    self.profiles.clear();
                }
            }
        }
    }

    // ---- origin profiles ----

    async fn read_profile_map(
        &self,
        tier: Tier,
    ) -> Result<BTreeMap<String, OriginVolumeProfile>, StoreError> {
        let area = self.require(tier)?;
        let raw = area.get(ORIGIN_PROFILES_KEY).await?;
        let mut profiles = BTreeMap::new();
        match raw {
            None => {}
            Some(Value::Object(map)) => {
                for (origin, value) in map {
                    match serde_json::from_value::<OriginVolumeProfile>(value) {
                        Ok(profile) if profile.validate().is_ok() => {
                            profiles.insert(origin, profile);
                        }
                        _ => warn!("Dropping corrupted origin profile for {:?}", origin),
                    }
                }
            }
            Some(_) => {
                warn!("Corrupted {} namespace in {}, resetting", ORIGIN_PROFILES_KEY, area.name());
                if let Err(e) = area.remove(vec![ORIGIN_PROFILES_KEY.to_string()]).await {
                    warn!("Failed to reset {}: {}", ORIGIN_PROFILES_KEY, e);
                }
            }
        }
        Ok(profiles)
    }

    async fn write_profile_map(
        &self,
        tier: Tier,
        profiles: &BTreeMap<String, OriginVolumeProfile>,
    ) -> Result<(), StoreError> {
        let area = self.require(tier)?;
        let value = serde_json::to_value(profiles)
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        area.set(vec![(ORIGIN_PROFILES_KEY.to_string(), value)]).await?;
        Ok(())
    }

    /// Look up the profile for an origin.
    ///
    /// Never fails: when nothing is stored (or storage is unreachable) a
    /// default profile is synthesized and cached.
    pub async fn get_origin_profile(&mut self, origin: &str, now: Timestamp) -> OriginVolumeProfile {
        self.poll_changes();
        let key = origin.to_ascii_lowercase();
        if let Some(cached) = self.profiles.get(&key) {
            return cached.clone();
        }

        let stored = match self.read_profile_map(self.profile_tier()).await {
            Ok(mut map) => map.remove(&key),
            Err(e) => {
                warn!("Reading profile for {} failed, using defaults: {}", key, e);
                None
            }
        };
        let profile = stored.unwrap_or_else(|| OriginVolumeProfile::new(&key, now));
        self.profiles.insert(key, profile.clone());
        profile
    }

    /// Validate and persist a profile, updating the cache.
    ///
    /// On `QuotaExceeded`/`Unavailable` the cache still holds the new value
    /// and the error is returned for the caller to report as a warning.
    pub async fn save_origin_profile(&mut self, profile: &OriginVolumeProfile) -> Result<(), StoreError> {
        profile
            .validate()
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        self.poll_changes();

        let key = profile.origin.to_ascii_lowercase();
        let tier = self.profile_tier();
        let result = match self.read_profile_map(tier).await {
            Ok(mut map) => {
                map.insert(key.clone(), profile.clone());
                self.write_profile_map(tier, &map).await
            }
            Err(e) => Err(e),
        };
        self.profiles.insert(key, profile.clone());
        if let Err(e) = &result {
            warn!("Profile for {} kept in cache only: {}", profile.origin, e);
        }
        result
    }

    pub async fn delete_origin_profile(&mut self, origin: &str) -> Result<bool, StoreError> {
        self.poll_changes();
        let key = origin.to_ascii_lowercase();
        let tier = self.profile_tier();
        let mut map = self.read_profile_map(tier).await?;
        let removed = map.remove(&key).is_some();
        if removed {
            self.write_profile_map(tier, &map).await?;
        }
        self.profiles.remove(&key);
        Ok(removed)
    }

    /// All persisted profiles, sorted by origin.
    pub async fn export_profiles(&mut self) -> Result<Vec<OriginVolumeProfile>, StoreError> {
        self.poll_changes();
        let map = self.read_profile_map(self.profile_tier()).await?;
        Ok(map.into_values().collect())
    }

    pub fn begin_batch(&self, average: bool) -> ProfileBatch {
        ProfileBatch {
            queued: BTreeMap::new(),
            average,
        }
    }

    /// Merge all queued profiles into the stored set with one durable write.
    pub async fn flush_batch(&mut self, batch: ProfileBatch) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.poll_changes();
        let tier = self.profile_tier();
        let count = batch.len();
        let stored = self.read_profile_map(tier).await;
        let degraded = stored.is_err();
        let mut map = stored.unwrap_or_default();
        for (origin, profile) in batch.queued {
            let merged = match map.get(&origin) {
                Some(existing) => existing.merge(&profile, batch.average),
                None => profile,
            };
            self.profiles.insert(origin.clone(), merged.clone());
            map.insert(origin, merged);
        }
        if degraded {
            return Err(StoreError::Unavailable(format!(
                "{:?} storage unreachable, {} profiles kept in cache",
                tier, count
            )));
        }
        self.write_profile_map(tier, &map).await?;
        info!("Flushed {} origin profiles in one write", count);
        Ok(count)
    }

    /// Remove profiles not used since `cutoff`.
    pub async fn prune_profiles(&mut self, cutoff: Timestamp) -> Result<usize, StoreError> {
        self.poll_changes();
        let tier = self.profile_tier();
        let mut map = self.read_profile_map(tier).await?;
        let before = map.len();
        map.retain(|_, p| p.last_used_timestamp >= cutoff);
        let removed = before - map.len();
        if removed > 0 {
            self.write_profile_map(tier, &map).await?;
            self.profiles.retain(|origin, _| map.contains_key(origin));
            info!("Pruned {} unused origin profiles", removed);
        }
        Ok(removed)
    }

    // ---- global config ----

    /// Current settings, with hard-coded defaults when nothing usable is
    /// stored.
    pub async fn get_config(&mut self) -> GlobalConfig {
        self.poll_changes();
        if let Some(config) = &self.config {
            return config.clone();
        }

        let config = match self.require(Tier::Synced) {
            Ok(area) => match area.get(GLOBAL_CONFIG_KEY).await {
                Ok(None) => GlobalConfig::default(),
                Ok(Some(value)) => match serde_json::from_value::<GlobalConfig>(value) {
                    Ok(config) if config.validate().is_ok() => config,
                    _ => {
                        warn!("Corrupted {} namespace, resetting to defaults", GLOBAL_CONFIG_KEY);
                        let defaults = GlobalConfig::default();
                        if let Ok(value) = serde_json::to_value(&defaults) {
                            if let Err(e) = area.set(vec![(GLOBAL_CONFIG_KEY.to_string(), value)]).await {
                                warn!("Failed to reset {}: {}", GLOBAL_CONFIG_KEY, e);
                            }
                        }
                        defaults
                    }
                },
                Err(e) => {
                    warn!("Reading global config failed, using defaults: {}", e);
                    GlobalConfig::default()
                }
            },
            Err(e) => {
                warn!("{}, using default config", e);
                GlobalConfig::default()
            }
        };
        self.sync_profiles = config.sync_across_devices;
        self.config = Some(config.clone());
        config
    }

    /// Validate and persist settings.
    ///
    /// Switching `syncAcrossDevices` moves the stored profiles to the
    /// matching tier.
    pub async fn save_config(&mut self, config: &GlobalConfig) -> Result<(), StoreError> {
        config
            .validate()
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        self.poll_changes();

        if config.sync_across_devices != self.sync_profiles {
            self.move_profiles(config.sync_across_devices).await;
        }

        let value =
            serde_json::to_value(config).map_err(|e| StoreError::Validation(e.to_string()))?;
        let result = match self.require(Tier::Synced) {
            Ok(area) => area
                .set(vec![(GLOBAL_CONFIG_KEY.to_string(), value)])
                .await
                .map_err(StoreError::from),
            Err(e) => Err(e),
        };
        self.sync_profiles = config.sync_across_devices;
        self.config = Some(config.clone());
        result
    }

    async fn move_profiles(&mut self, to_synced: bool) {
        let (from, to) = if to_synced {
            (Tier::Local, Tier::Synced)
        } else {
            (Tier::Synced, Tier::Local)
        };
        let source = match self.read_profile_map(from).await {
            Ok(map) => map,
            Err(e) => {
                warn!("Cannot move profiles out of {:?}: {}", from, e);
                return;
            }
        };
        if source.is_empty() {
            return;
        }
        let mut target = self.read_profile_map(to).await.unwrap_or_default();
        for (origin, profile) in source {
            let merged = match target.get(&origin) {
                Some(existing) => existing.merge(&profile, false),
                None => profile,
            };
            target.insert(origin, merged);
        }
        match self.write_profile_map(to, &target).await {
            Ok(()) => {
                if let Ok(area) = self.require(from) {
                    if let Err(e) = area.remove(vec![ORIGIN_PROFILES_KEY.to_string()]).await {
                        warn!("Failed to clear profiles from {:?}: {}", from, e);
                    }
                }
                info!("Moved {} origin profiles from {:?} to {:?}", target.len(), from, to);
            }
            Err(e) => warn!("Failed to move profiles to {:?}: {}", to, e),
        }
        self.profiles.clear();
    }

    // ---- session snapshot ----

    async fn read_snapshot(&self) -> Result<BTreeMap<ContextId, AudioTab>, StoreError> {
        let area = self.require(Tier::Session)?;
        let mut tabs = BTreeMap::new();
        match area.get(SESSION_SNAPSHOT_KEY).await? {
            None => {}
            Some(Value::Object(map)) => {
                for (key, value) in map {
                    match (key.parse::<ContextId>(), serde_json::from_value::<AudioTab>(value)) {
                        (Ok(id), Ok(mut tab)) if id == tab.context_id && id != 0 => {
                            tab.normalize();
                            tabs.insert(id, tab);
                        }
                        _ => warn!("Dropping corrupted session entry {:?}", key),
                    }
                }
            }
            Some(_) => {
                warn!("Corrupted {} namespace, resetting", SESSION_SNAPSHOT_KEY);
                if let Err(e) = area.remove(vec![SESSION_SNAPSHOT_KEY.to_string()]).await {
                    warn!("Failed to reset {}: {}", SESSION_SNAPSHOT_KEY, e);
                }
            }
        }
        Ok(tabs)
    }

    async fn write_snapshot(&self, tabs: &BTreeMap<ContextId, AudioTab>) -> Result<(), StoreError> {
        let area = self.require(Tier::Session)?;
        let map: Map<String, Value> = tabs
            .iter()
            .filter_map(|(id, tab)| serde_json::to_value(tab).ok().map(|v| (id.to_string(), v)))
            .collect();
        area.set(vec![(SESSION_SNAPSHOT_KEY.to_string(), Value::Object(map))])
            .await?;
        Ok(())
    }

    /// Best-effort restart hint: the last saved live registry.
    pub async fn get_session_snapshot(&self) -> BTreeMap<ContextId, AudioTab> {
        match self.read_snapshot().await {
            Ok(tabs) => tabs,
            Err(e) => {
                warn!("Session snapshot unavailable: {}", e);
                BTreeMap::new()
            }
        }
    }

    pub async fn save_session_snapshot<'a, I>(&self, tabs: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = &'a AudioTab>,
    {
        let tabs: BTreeMap<ContextId, AudioTab> =
            tabs.into_iter().map(|t| (t.context_id, t.clone())).collect();
        self.write_snapshot(&tabs).await
    }

    /// Drop snapshot entries idle for longer than `retention_ms`.
    pub async fn cleanup_stale_sessions(
        &self,
        now: Timestamp,
        retention_ms: u64,
    ) -> Result<usize, StoreError> {
        let mut tabs = self.read_snapshot().await?;
        let cutoff = now.saturating_sub(retention_ms);
        let before = tabs.len();
        tabs.retain(|_, tab| tab.last_activity_timestamp >= cutoff);
        let removed = before - tabs.len();
        if removed > 0 {
            self.write_snapshot(&tabs).await?;
            info!("Removed {} stale session entries", removed);
        }
        Ok(removed)
    }

    /// Merge entries into the snapshot without overwriting existing ones.
    pub(crate) async fn merge_into_snapshot(&self, entries: Vec<AudioTab>) -> Result<usize, StoreError> {
        let mut tabs = self.read_snapshot().await?;
        let mut added = 0;
        for tab in entries {
            if !tabs.contains_key(&tab.context_id) {
                tabs.insert(tab.context_id, tab);
                added += 1;
            }
        }
        if added > 0 {
            self.write_snapshot(&tabs).await?;
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryArea;
    use serde_json::json;
    use tabmix_ipc::VolumeLevel;

    struct Areas {
        synced: Arc<MemoryArea>,
        local: Arc<MemoryArea>,
        session: Arc<MemoryArea>,
    }

    fn areas() -> Areas {
        Areas {
            synced: Arc::new(MemoryArea::new("sync")),
            local: Arc::new(MemoryArea::new("local")),
            session: Arc::new(MemoryArea::new("session")),
        }
    }

    fn store(areas: &Areas) -> Store {
        Store::new(StorageTiers {
            synced: Some(areas.synced.clone()),
            local: Some(areas.local.clone()),
            session: Some(areas.session.clone()),
        })
    }

    fn profile(origin: &str, volume: i64, now: Timestamp) -> OriginVolumeProfile {
        let mut p = OriginVolumeProfile::new(origin, now);
        p.default_volume = VolumeLevel::new(volume).unwrap();
        p
    }

    #[tokio::test]
    async fn test_missing_profile_synthesizes_default() {
        let areas = areas();
        let mut store = store(&areas);
        let p = store.get_origin_profile("a.com", 5).await;
        assert_eq!(p.default_volume.get(), 100);
        assert!(!p.is_muted);
        assert_eq!(areas.synced.write_count(), 0);
    }

    #[tokio::test]
    async fn test_save_then_get_round_trip() {
        let areas = areas();
        let mut store = store(&areas);
        let saved = profile("music.example.com", 65, 10);
        store.save_origin_profile(&saved).await.unwrap();

        let mut fresh = Store::new(StorageTiers {
            synced: Some(areas.synced.clone()),
            local: None,
            session: None,
        });
        assert_eq!(fresh.get_origin_profile("music.example.com", 99).await, saved);
        assert_eq!(store.get_origin_profile("music.example.com", 99).await, saved);
    }

    #[tokio::test]
    async fn test_save_rejects_malformed_origin() {
        let areas = areas();
        let mut store = store(&areas);
        for origin in ["bad..domain", "-bad.com"] {
            let err = store
                .save_origin_profile(&profile(origin, 50, 1))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)), "{}", origin);
        }
        assert_eq!(areas.synced.write_count(), 0);
    }

    #[tokio::test]
    async fn test_quota_exceeded_keeps_cache() {
        let synced = Arc::new(MemoryArea::new("sync").with_quota(40));
        let mut store = Store::new(StorageTiers {
            synced: Some(synced.clone()),
            local: None,
            session: None,
        });
        let p = profile("a.com", 70, 1);
        let err = store.save_origin_profile(&p).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded(_)));
        assert_eq!(store.get_origin_profile("a.com", 2).await.default_volume.get(), 70);
    }

    #[tokio::test]
    async fn test_unavailable_tier() {
        let mut store = Store::new(StorageTiers::default());
        let err = store
            .save_origin_profile(&profile("a.com", 70, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.get_origin_profile("a.com", 2).await.default_volume.get(), 70);
        assert_eq!(store.get_config().await, GlobalConfig::default());
    }

    #[tokio::test]
    async fn test_external_change_invalidates_cache() {
        let areas = areas();
        let mut store = store(&areas);
        store.save_origin_profile(&profile("a.com", 40, 1)).await.unwrap();
        assert_eq!(store.get_origin_profile("a.com", 2).await.default_volume.get(), 40);

        // Another device writes a new value.
        let remote = json!({ "a.com": profile("a.com", 90, 5) });
        areas.synced.apply_external(ORIGIN_PROFILES_KEY, Some(remote));

        assert_eq!(store.get_origin_profile("a.com", 6).await.default_volume.get(), 90);
    }

    #[tokio::test]
    async fn test_own_write_does_not_drop_cache() {
        let areas = areas();
        let mut store = store(&areas);
        store.save_origin_profile(&profile("a.com", 40, 1)).await.unwrap();
        store.poll_changes();
        assert!(store.profiles.contains_key("a.com"));
    }

    #[tokio::test]
    async fn test_batch_flush_is_single_write() {
        let areas = areas();
        let mut store = store(&areas);
        let mut batch = store.begin_batch(false);
        batch.queue(profile("a.com", 10, 1)).unwrap();
        batch.queue(profile("b.com", 20, 1)).unwrap();
        batch.queue(profile("c.com", 30, 1)).unwrap();
        batch.queue(profile("a.com", 15, 2)).unwrap();
        assert!(batch.queue(profile("bad..x", 1, 1)).is_err());

        assert_eq!(store.flush_batch(batch).await.unwrap(), 3);
        assert_eq!(areas.synced.write_count(), 1);
        let stored = areas.synced.snapshot();
        assert_eq!(stored[ORIGIN_PROFILES_KEY]["a.com"]["defaultVolume"], 15);
        assert_eq!(stored[ORIGIN_PROFILES_KEY]["c.com"]["defaultVolume"], 30);
    }

    #[tokio::test]
    async fn test_corrupted_profiles_namespace_resets() {
        let synced = Arc::new(
            MemoryArea::new("sync").with_contents(json!({ ORIGIN_PROFILES_KEY: "garbage" })),
        );
        let mut store = Store::new(StorageTiers {
            synced: Some(synced.clone()),
            local: None,
            session: None,
        });
        assert_eq!(store.get_origin_profile("a.com", 1).await.default_volume.get(), 100);
        assert_eq!(synced.snapshot(), json!({}));
    }

    #[tokio::test]
    async fn test_corrupted_config_resets_to_defaults() {
        let synced = Arc::new(
            MemoryArea::new("sync")
                .with_contents(json!({ GLOBAL_CONFIG_KEY: { "cleanupDelaySeconds": 1 } })),
        );
        let mut store = Store::new(StorageTiers {
            synced: Some(synced.clone()),
            local: None,
            session: None,
        });
        assert_eq!(store.get_config().await, GlobalConfig::default());
        assert_eq!(synced.snapshot()[GLOBAL_CONFIG_KEY]["cleanupDelaySeconds"], 30);
    }

    #[tokio::test]
    async fn test_sync_toggle_moves_profiles() {
        let areas = areas();
        let mut store = store(&areas);
        store.save_origin_profile(&profile("a.com", 40, 1)).await.unwrap();

        let mut config = store.get_config().await;
        config.sync_across_devices = false;
        store.save_config(&config).await.unwrap();

        assert!(areas.synced.snapshot().get(ORIGIN_PROFILES_KEY).is_none());
        assert_eq!(areas.local.snapshot()[ORIGIN_PROFILES_KEY]["a.com"]["defaultVolume"], 40);
        assert_eq!(store.get_origin_profile("a.com", 2).await.default_volume.get(), 40);
    }

    #[tokio::test]
    async fn test_external_sync_toggle_rebinds_profiles() {
        let areas = Areas {
            local: Arc::new(MemoryArea::new("local").with_contents(
                json!({ ORIGIN_PROFILES_KEY: { "a.com": profile("a.com", 70, 1) } }),
            )),
            ..areas()
        };
        let mut store = store(&areas);
        store.save_origin_profile(&profile("a.com", 40, 1)).await.unwrap();
        assert_eq!(store.get_origin_profile("a.com", 2).await.default_volume.get(), 40);

        let config = GlobalConfig {
            sync_across_devices: false,
            ..GlobalConfig::default()
        };
        areas
            .synced
            .apply_external(GLOBAL_CONFIG_KEY, Some(serde_json::to_value(&config).unwrap()));

        assert_eq!(store.get_origin_profile("a.com", 3).await.default_volume.get(), 70);
        assert!(!store.get_config().await.sync_across_devices);
    }

    #[tokio::test]
    async fn test_prune_profiles() {
        let areas = areas();
        let mut store = store(&areas);
        store.save_origin_profile(&profile("old.com", 40, 1)).await.unwrap();
        store.save_origin_profile(&profile("new.com", 40, 1_000)).await.unwrap();
        assert_eq!(store.prune_profiles(500).await.unwrap(), 1);
        let left = store.export_profiles().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].origin, "new.com");
    }

    #[tokio::test]
    async fn test_session_snapshot_cleanup() {
        let areas = areas();
        let store = store(&areas);
        let now = SESSION_RETENTION_MS + 10_000;
        let fresh = AudioTab::new(1, "https://a.com", now - 1_000);
        let stale = AudioTab::new(2, "https://b.com", 5_000);
        store.save_session_snapshot([&fresh, &stale]).await.unwrap();

        assert_eq!(store.cleanup_stale_sessions(now, SESSION_RETENTION_MS).await.unwrap(), 1);
        let left = store.get_session_snapshot().await;
        assert_eq!(left.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_session_snapshot_drops_bad_entries() {
        let session = Arc::new(MemoryArea::new("session").with_contents(json!({
            SESSION_SNAPSHOT_KEY: {
                "3": { "contextId": 3, "url": "https://a.com/x", "volumeLevel": 80 },
                "4": { "contextId": 4, "volumeLevel": 900 },
                "x": { "contextId": 5 }
            }
        })));
        let store = Store::new(StorageTiers {
            synced: None,
            local: None,
            session: Some(session),
        });
        let tabs = store.get_session_snapshot().await;
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[&3].origin, "a.com");
        assert_eq!(tabs[&3].volume_level.get(), 80);
    }
}
