// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Which control path an agent uses, chosen once at construction.

use crate::page::{PageDocument, PlatformPlayer};
use std::sync::Arc;
use tabmix_ipc::{origin_from_url, TargetKind, VolumeLevel};
use tracing::{debug, warn};

/// Hosts whose embedded player exposes its own volume API.
const PLATFORM_HOSTS: &[&str] = &["youtube.com"];

fn is_platform_origin(origin: &str) -> bool {
    PLATFORM_HOSTS
        .iter()
        .any(|host| origin == *host || origin.ends_with(&format!(".{}", host)))
}

pub enum MediaTarget {
    /// Plain media elements only.
    Standard,
    /// A streaming platform page; its player API is preferred.
    Platform(Arc<dyn PlatformPlayer>),
}

impl MediaTarget {
    pub fn detect(document: &dyn PageDocument) -> Self {
        let origin = origin_from_url(&document.url());
        if !is_platform_origin(&origin) {
            return MediaTarget::Standard;
        }
        match document.platform_player() {
            Some(player) => {
                debug!("Using platform player API on {}", origin);
                MediaTarget::Platform(player)
            }
            None => {
                debug!("No platform player found on {}, using elements", origin);
                MediaTarget::Standard
            }
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            MediaTarget::Standard => TargetKind::Standard,
            MediaTarget::Platform(_) => TargetKind::Platform,
        }
    }

    /// Try the player API. Returns `true` when it fully handled the level.
    ///
    /// Levels above the player's 0..=100 scale are never fully handled: the
    /// player is set to its maximum and the caller amplifies the rest.
    pub fn apply_volume(&self, level: VolumeLevel) -> bool {
        let MediaTarget::Platform(player) = self else {
            return false;
        };
        let native = level.get().min(VolumeLevel::NATIVE_MAX);
        match player.set_volume(native) {
            Ok(()) => !level.is_amplified(),
            Err(e) => {
                warn!("Player volume API failed, falling back to elements: {}", e);
                false
            }
        }
    }

    /// Try the player API for mute. Returns `true` when it succeeded.
    pub fn apply_muted(&self, muted: bool) -> bool {
        let MediaTarget::Platform(player) = self else {
            return false;
        };
        match player.set_muted(muted) {
            Ok(()) => true,
            Err(e) => {
                warn!("Player mute API failed, falling back to elements: {}", e);
                false
            }
        }
    }
}
