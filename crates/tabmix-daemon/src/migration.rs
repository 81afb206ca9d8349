// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Migration of data written by the legacy schema.
//!
//! The old layout kept per-tab state under `tabs` (`{id, vol, muted}`) and
//! per-site volumes under `domains` (`{origin: {vol, muted}}` or a bare
//! number). Both are rewritten into the current shapes and then removed.

use crate::store::{Store, StoreError, Tier};
use serde::Deserialize;
use serde_json::Value;
use tabmix_ipc::{AudioTab, ContextId, OriginVolumeProfile, Timestamp, VolumeLevel};
use tracing::{debug, info, warn};

pub const LEGACY_TABS_KEY: &str = "tabs";
pub const LEGACY_DOMAINS_KEY: &str = "domains";

#[derive(Debug, Deserialize)]
struct LegacyTab {
    id: ContextId,
    #[serde(default = "legacy_default_volume")]
    vol: i64,
    #[serde(default)]
    muted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyDomain {
    Volume(i64),
    Entry {
        #[serde(default = "legacy_default_volume")]
        vol: i64,
        #[serde(default)]
        muted: bool,
    },
}

fn legacy_default_volume() -> i64 {
    100
}

/// What a migration run converted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub tabs: usize,
    pub profiles: usize,
    pub skipped: usize,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.tabs == 0 && self.profiles == 0 && self.skipped == 0
    }
}

fn convert_tabs(value: &Value, now: Timestamp, report: &mut MigrationReport) -> Vec<AudioTab> {
    let Some(map) = value.as_object() else {
        warn!("Legacy {} entry is not an object, discarding", LEGACY_TABS_KEY);
        report.skipped += 1;
        return Vec::new();
    };
    let mut tabs = Vec::new();
    for (key, raw) in map {
        let parsed = serde_json::from_value::<LegacyTab>(raw.clone())
            .ok()
            .and_then(|t| VolumeLevel::new(t.vol).ok().map(|level| (t, level)));
        match parsed {
            Some((legacy, level)) if legacy.id != 0 => {
                let mut tab = AudioTab::new(legacy.id, "", now);
                tab.volume_level = level;
                tab.is_muted = legacy.muted;
                tabs.push(tab);
            }
            _ => {
                warn!("Skipping unreadable legacy tab {:?}", key);
                report.skipped += 1;
            }
        }
    }
    tabs
}

fn convert_domains(
    value: &Value,
    now: Timestamp,
    report: &mut MigrationReport,
) -> Vec<OriginVolumeProfile> {
    let Some(map) = value.as_object() else {
        warn!("Legacy {} entry is not an object, discarding", LEGACY_DOMAINS_KEY);
        report.skipped += 1;
        return Vec::new();
    };
    let mut profiles = Vec::new();
    for (origin, raw) in map {
        let (vol, muted) = match serde_json::from_value::<LegacyDomain>(raw.clone()) {
            Ok(LegacyDomain::Volume(vol)) => (vol, false),
            Ok(LegacyDomain::Entry { vol, muted }) => (vol, muted),
            Err(_) => {
                report.skipped += 1;
                continue;
            }
        };
        let mut profile = OriginVolumeProfile::new(origin, now);
        match VolumeLevel::new(vol) {
            Ok(level) => profile.default_volume = level,
            Err(_) => {
                report.skipped += 1;
                continue;
            }
        }
        profile.is_muted = muted;
        if profile.validate().is_ok() {
            profiles.push(profile);
        } else {
            warn!("Skipping legacy profile with malformed origin {:?}", origin);
            report.skipped += 1;
        }
    }
    profiles
}

/// Probe every tier for legacy keys and convert what is found.
///
/// Finding nothing is not an error.
pub async fn migrate_legacy(store: &mut Store, now: Timestamp) -> Result<MigrationReport, StoreError> {
    let mut report = MigrationReport::default();

    for tier in Tier::ALL {
        let Some(area) = store.area(tier).cloned() else {
            continue;
        };
        let legacy_tabs = area.get(LEGACY_TABS_KEY).await?;
        let legacy_domains = area.get(LEGACY_DOMAINS_KEY).await?;
        if legacy_tabs.is_none() && legacy_domains.is_none() {
            continue;
        }
        debug!("Found legacy data in {}", area.name());

        let mut converted_keys = Vec::new();
        if let Some(value) = legacy_tabs {
            let tabs = convert_tabs(&value, now, &mut report);
            report.tabs += store.merge_into_snapshot(tabs).await?;
            converted_keys.push(LEGACY_TABS_KEY.to_string());
        }
        if let Some(value) = legacy_domains {
            let profiles = convert_domains(&value, now, &mut report);
            let mut batch = store.begin_batch(false);
            for profile in profiles {
                batch.queue(profile)?;
            }
            report.profiles += store.flush_batch(batch).await?;
            converted_keys.push(LEGACY_DOMAINS_KEY.to_string());
        }
        area.remove(converted_keys).await?;
    }

    if report.is_empty() {
        debug!("No legacy data to migrate");
    } else {
        info!(
            "Migrated legacy data: {} tabs, {} profiles ({} skipped)",
            report.tabs, report.profiles, report.skipped
        );
    }
    Ok(report)
}
