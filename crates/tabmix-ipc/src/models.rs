// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Entity models: validated value objects with no I/O.

use crate::error::TabmixError;
use crate::origin::{is_valid_origin, origin_from_url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque identifier of a page context, unique within a coordinator lifetime.
pub type ContextId = u32;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// Playback volume in percent, 0 to 200.
///
/// Values above 100 require amplification through a gain stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct VolumeLevel(u8);

impl VolumeLevel {
    pub const MIN: u8 = 0;
    pub const MAX: u8 = 200;
    /// Ceiling of the native element volume.
    pub const NATIVE_MAX: u8 = 100;

    pub const UNITY: VolumeLevel = VolumeLevel(100);

    pub fn new(level: i64) -> Result<Self, TabmixError> {
        if level < Self::MIN as i64 || level > Self::MAX as i64 {
            return Err(TabmixError::Validation(format!(
                "volume level {} outside {}..={}",
                level,
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(Self(level as u8))
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// Native element volume in 0.0..=1.0.
    pub fn native_volume(&self) -> f64 {
        self.0.min(Self::NATIVE_MAX) as f64 / 100.0
    }

    /// Total output gain, including any amplification.
    pub fn gain(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn is_amplified(&self) -> bool {
        self.0 > Self::NATIVE_MAX
    }
}

impl Default for VolumeLevel {
    fn default() -> Self {
        Self::UNITY
    }
}

impl TryFrom<i64> for VolumeLevel {
    type Error = TabmixError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VolumeLevel> for u8 {
    fn from(level: VolumeLevel) -> Self {
        level.0
    }
}

impl std::fmt::Display for VolumeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Lifecycle phase of an [`AudioTab`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabPhase {
    /// Media found, not yet confirmed playing.
    Detected,
    /// Confirmed audio active.
    Active,
    /// Active but silenced.
    Muted,
    /// Inactive beyond the grace window, eligible for purge.
    Stale,
}

/// A page context known to produce (or to have produced) audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTab {
    pub context_id: ContextId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon_ref: Option<String>,
    #[serde(default)]
    pub volume_level: VolumeLevel,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_audio_active: bool,
    #[serde(default)]
    pub last_activity_timestamp: Timestamp,
    #[serde(default)]
    pub detected_media_kinds: BTreeSet<String>,
}

impl AudioTab {
    pub fn new(context_id: ContextId, url: &str, now: Timestamp) -> Self {
        Self {
            context_id,
            title: String::new(),
            url: url.to_string(),
            origin: origin_from_url(url),
            favicon_ref: None,
            volume_level: VolumeLevel::default(),
            is_muted: false,
            is_audio_active: false,
            last_activity_timestamp: now,
            detected_media_kinds: BTreeSet::new(),
        }
    }

    /// Update the URL and re-derive the origin.
    pub fn set_url(&mut self, url: &str) {
        if self.url != url {
            self.url = url.to_string();
            self.origin = origin_from_url(url);
        }
    }

    /// Advance the activity timestamp; never moves backwards.
    pub fn touch(&mut self, now: Timestamp) {
        self.last_activity_timestamp = self.last_activity_timestamp.max(now);
    }

    /// Whether the title is usable for display.
    pub fn has_title(&self) -> bool {
        !self.title.trim().is_empty()
    }

    pub fn phase(&self, now: Timestamp, grace_ms: u64) -> TabPhase {
        if self.is_audio_active {
            if self.is_muted {
                TabPhase::Muted
            } else {
                TabPhase::Active
            }
        } else if now.saturating_sub(self.last_activity_timestamp) > grace_ms {
            TabPhase::Stale
        } else {
            TabPhase::Detected
        }
    }

    /// Repair fields that must be derivable from others.
    pub fn normalize(&mut self) {
        self.origin = origin_from_url(&self.url);
    }
}

/// Durable per-origin volume preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginVolumeProfile {
    pub origin: String,
    #[serde(default)]
    pub default_volume: VolumeLevel,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub last_used_timestamp: Timestamp,
    #[serde(default)]
    pub created_timestamp: Timestamp,
}

impl OriginVolumeProfile {
    /// Create a default profile (100%, unmuted).
    pub fn new(origin: &str, now: Timestamp) -> Self {
        Self {
            origin: origin.to_ascii_lowercase(),
            default_volume: VolumeLevel::default(),
            is_muted: false,
            last_used_timestamp: now,
            created_timestamp: now,
        }
    }

    pub fn validate(&self) -> Result<(), TabmixError> {
        if !is_valid_origin(&self.origin) {
            return Err(TabmixError::Validation(format!(
                "malformed origin: {:?}",
                self.origin
            )));
        }
        if self.created_timestamp > self.last_used_timestamp && self.last_used_timestamp != 0 {
            return Err(TabmixError::Validation(format!(
                "profile for {} used before it was created",
                self.origin
            )));
        }
        Ok(())
    }

    /// Merge two profiles for the same origin.
    ///
    /// The most recently used profile wins; with `average` the two volumes
    /// are averaged instead.
    pub fn merge(&self, other: &OriginVolumeProfile, average: bool) -> OriginVolumeProfile {
        let (newer, older) = if other.last_used_timestamp >= self.last_used_timestamp {
            (other, self)
        } else {
            (self, other)
        };
        let default_volume = if average {
            let sum = newer.default_volume.get() as u16 + older.default_volume.get() as u16;
            // Both inputs are <= 200, so the rounded mean is too.
            VolumeLevel(((sum + 1) / 2) as u8)
        } else {
            newer.default_volume
        };
        OriginVolumeProfile {
            origin: newer.origin.clone(),
            default_volume,
            is_muted: newer.is_muted,
            last_used_timestamp: newer.last_used_timestamp,
            created_timestamp: self.created_timestamp.min(other.created_timestamp),
        }
    }
}

fn default_volume_100() -> VolumeLevel {
    VolumeLevel::UNITY
}

fn default_cleanup_delay() -> u16 {
    30
}

fn default_min_volume_step() -> u8 {
    5
}

fn default_max_volume_limit() -> u8 {
    200
}

fn default_true() -> bool {
    true
}

/// User settings, persisted as a singleton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default = "default_volume_100")]
    pub default_volume: VolumeLevel,
    /// Include inactive contexts in `ListActiveContexts`.
    #[serde(default)]
    pub show_inactive_contexts: bool,
    /// Enable the staleness purge.
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,
    #[serde(default = "default_cleanup_delay")]
    pub cleanup_delay_seconds: u16,
    #[serde(default = "default_true")]
    pub enable_notifications: bool,
    #[serde(default = "default_true")]
    pub sync_across_devices: bool,
    #[serde(default = "default_min_volume_step")]
    pub min_volume_step: u8,
    #[serde(default = "default_max_volume_limit")]
    pub max_volume_limit: u8,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume_100(),
            show_inactive_contexts: false,
            auto_cleanup: true,
            cleanup_delay_seconds: default_cleanup_delay(),
            enable_notifications: true,
            sync_across_devices: true,
            min_volume_step: default_min_volume_step(),
            max_volume_limit: default_max_volume_limit(),
        }
    }
}

impl GlobalConfig {
    pub const CLEANUP_DELAY_RANGE: std::ops::RangeInclusive<u16> = 5..=300;
    pub const VOLUME_STEP_RANGE: std::ops::RangeInclusive<u8> = 1..=10;
    pub const VOLUME_LIMIT_RANGE: std::ops::RangeInclusive<u8> = 100..=200;

    pub fn validate(&self) -> Result<(), TabmixError> {
        if !Self::CLEANUP_DELAY_RANGE.contains(&self.cleanup_delay_seconds) {
            return Err(TabmixError::Validation(format!(
                "cleanupDelaySeconds {} outside 5..=300",
                self.cleanup_delay_seconds
            )));
        }
        if !Self::VOLUME_STEP_RANGE.contains(&self.min_volume_step) {
            return Err(TabmixError::Validation(format!(
                "minVolumeStep {} outside 1..=10",
                self.min_volume_step
            )));
        }
        if !Self::VOLUME_LIMIT_RANGE.contains(&self.max_volume_limit) {
            return Err(TabmixError::Validation(format!(
                "maxVolumeLimit {} outside 100..=200",
                self.max_volume_limit
            )));
        }
        if self.default_volume.get() > self.max_volume_limit {
            return Err(TabmixError::Validation(format!(
                "defaultVolume {} exceeds maxVolumeLimit {}",
                self.default_volume.get(),
                self.max_volume_limit
            )));
        }
        Ok(())
    }

    /// Grace window for inactive contexts, in milliseconds.
    pub fn cleanup_delay_ms(&self) -> u64 {
        self.cleanup_delay_seconds as u64 * 1000
    }

    /// Apply a partial update, returning the validated result.
    pub fn patched(&self, patch: &GlobalConfigPatch) -> Result<GlobalConfig, TabmixError> {
        let mut next = self.clone();
        if let Some(v) = patch.default_volume {
            next.default_volume = v;
        }
        if let Some(v) = patch.show_inactive_contexts {
            next.show_inactive_contexts = v;
        }
        if let Some(v) = patch.auto_cleanup {
            next.auto_cleanup = v;
        }
        if let Some(v) = patch.cleanup_delay_seconds {
            next.cleanup_delay_seconds = v;
        }
        if let Some(v) = patch.enable_notifications {
            next.enable_notifications = v;
        }
        if let Some(v) = patch.sync_across_devices {
            next.sync_across_devices = v;
        }
        if let Some(v) = patch.min_volume_step {
            next.min_volume_step = v;
        }
        if let Some(v) = patch.max_volume_limit {
            next.max_volume_limit = v;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial [`GlobalConfig`] update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GlobalConfigPatch {
    #[serde(default)]
    pub default_volume: Option<VolumeLevel>,
    #[serde(default)]
    pub show_inactive_contexts: Option<bool>,
    #[serde(default)]
    pub auto_cleanup: Option<bool>,
    #[serde(default)]
    pub cleanup_delay_seconds: Option<u16>,
    #[serde(default)]
    pub enable_notifications: Option<bool>,
    #[serde(default)]
    pub sync_across_devices: Option<bool>,
    #[serde(default)]
    pub min_volume_step: Option<u8>,
    #[serde(default)]
    pub max_volume_limit: Option<u8>,
}

/// Ephemeral per-run coordinator state. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorState {
    pub active_context_ids: BTreeSet<ContextId>,
    pub is_enabled: bool,
    pub last_update_timestamp: Timestamp,
    pub total_contexts_ever_controlled: u64,
}

impl CoordinatorState {
    pub fn new(now: Timestamp) -> Self {
        Self {
            active_context_ids: BTreeSet::new(),
            is_enabled: true,
            last_update_timestamp: now,
            total_contexts_ever_controlled: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_level_bounds() {
        assert!(VolumeLevel::new(0).is_ok());
        assert!(VolumeLevel::new(200).is_ok());
        assert!(matches!(VolumeLevel::new(-5), Err(TabmixError::Validation(_))));
        assert!(matches!(VolumeLevel::new(250), Err(TabmixError::Validation(_))));
    }

    #[test]
    fn test_volume_level_native_and_gain() {
        let quiet = VolumeLevel::new(40).unwrap();
        assert!((quiet.native_volume() - 0.4).abs() < 1e-9);
        assert!(!quiet.is_amplified());

        let loud = VolumeLevel::new(150).unwrap();
        assert!((loud.native_volume() - 1.0).abs() < 1e-9);
        assert!((loud.gain() - 1.5).abs() < 1e-9);
        assert!(loud.is_amplified());
    }

    #[test]
    fn test_volume_level_rejects_out_of_range_json() {
        assert!(serde_json::from_str::<VolumeLevel>("201").is_err());
        assert_eq!(serde_json::from_str::<VolumeLevel>("65").unwrap().get(), 65);
    }

    #[test]
    fn test_audio_tab_origin_follows_url() {
        let mut tab = AudioTab::new(3, "https://a.com/page", 10);
        assert_eq!(tab.origin, "a.com");
        tab.set_url("https://b.org/");
        assert_eq!(tab.origin, "b.org");
    }

    #[test]
    fn test_audio_tab_touch_is_monotonic() {
        let mut tab = AudioTab::new(1, "https://a.com", 100);
        tab.touch(50);
        assert_eq!(tab.last_activity_timestamp, 100);
        tab.touch(150);
        assert_eq!(tab.last_activity_timestamp, 150);
    }

    #[test]
    fn test_audio_tab_phase() {
        let mut tab = AudioTab::new(1, "https://a.com", 1_000);
        assert_eq!(tab.phase(1_500, 30_000), TabPhase::Detected);
        assert_eq!(tab.phase(40_000, 30_000), TabPhase::Stale);
        tab.is_audio_active = true;
        assert_eq!(tab.phase(40_000, 30_000), TabPhase::Active);
        tab.is_muted = true;
        assert_eq!(tab.phase(40_000, 30_000), TabPhase::Muted);
    }

    #[test]
    fn test_audio_tab_blank_title() {
        let mut tab = AudioTab::new(1, "https://a.com", 0);
        assert!(!tab.has_title());
        tab.title = "   ".into();
        assert!(!tab.has_title());
        tab.title = "Song".into();
        assert!(tab.has_title());
    }

    #[test]
    fn test_profile_validation() {
        assert!(OriginVolumeProfile::new("a.com", 1).validate().is_ok());
        assert!(OriginVolumeProfile::new("bad..domain", 1).validate().is_err());
        assert!(OriginVolumeProfile::new("-bad.com", 1).validate().is_err());
    }

    #[test]
    fn test_profile_merge_most_recent_wins() {
        let mut old = OriginVolumeProfile::new("a.com", 100);
        old.default_volume = VolumeLevel::new(40).unwrap();
        let mut new = OriginVolumeProfile::new("a.com", 200);
        new.default_volume = VolumeLevel::new(80).unwrap();
        new.is_muted = true;

        let merged = old.merge(&new, false);
        assert_eq!(merged.default_volume.get(), 80);
        assert!(merged.is_muted);
        assert_eq!(merged.created_timestamp, 100);
        assert_eq!(merged.last_used_timestamp, 200);

        let same = new.merge(&old, false);
        assert_eq!(same, merged);
    }

    #[test]
    fn test_profile_merge_average() {
        let mut a = OriginVolumeProfile::new("a.com", 100);
        a.default_volume = VolumeLevel::new(40).unwrap();
        let mut b = OriginVolumeProfile::new("a.com", 200);
        b.default_volume = VolumeLevel::new(81).unwrap();
        assert_eq!(a.merge(&b, true).default_volume.get(), 61);
    }

    #[test]
    fn test_global_config_defaults_valid() {
        let config = GlobalConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cleanup_delay_ms(), 30_000);
    }

    #[test]
    fn test_global_config_ranges() {
        let base = GlobalConfig::default();
        let too_short = GlobalConfigPatch {
            cleanup_delay_seconds: Some(4),
            ..Default::default()
        };
        assert!(base.patched(&too_short).is_err());

        let low_limit = GlobalConfigPatch {
            max_volume_limit: Some(120),
            default_volume: Some(VolumeLevel::new(150).unwrap()),
            ..Default::default()
        };
        assert!(base.patched(&low_limit).is_err());

        let fine = GlobalConfigPatch {
            max_volume_limit: Some(120),
            ..Default::default()
        };
        assert_eq!(base.patched(&fine).unwrap().max_volume_limit, 120);
    }

    #[test]
    fn test_global_config_fills_missing_fields() {
        let config: GlobalConfig = serde_json::from_str(r#"{"autoCleanup": false}"#).unwrap();
        assert!(!config.auto_cleanup);
        assert_eq!(config.default_volume.get(), 100);
        assert_eq!(config.max_volume_limit, 200);
    }
}
