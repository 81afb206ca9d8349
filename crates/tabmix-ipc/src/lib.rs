// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared message types and entity models for TabMix.
//!
//! This crate defines the protocol spoken between the TabMix coordinator,
//! the page-context media agents and front-panel clients: JSON envelopes
//! carried one per line over a Unix socket.

mod error;
mod message;
mod models;
mod origin;

pub use error::{ErrorBody, ErrorKind, TabmixError};
pub use message::{
    decode_frame, encode_frame, panel_event_from_envelope, target_identifiers,
    ActivityReportPayload, AgentCommand, AgentReply, AgentRequest, Command,
    CommandEnvelope, CommandKind, ContextPayload, EmptyPayload, Frame, ImportProfilesPayload,
    OriginPayload, PanelEvent, MAX_FRAME_BYTES, ResponseEnvelope, RestoreProfilePayload, SetMutePayload,
    SetVolumePayload,
};
pub use models::{
    now_millis, AudioTab, ContextId, CoordinatorState, GlobalConfig, GlobalConfigPatch,
    OriginVolumeProfile, TabPhase, Timestamp, VolumeLevel,
};
pub use origin::{is_valid_origin, origin_from_url};

use serde::{Deserialize, Serialize};

/// Default socket file name inside the runtime directory.
pub const SOCKET_NAME: &str = "tabmix.sock";

/// Whether a page agent can amplify above the native volume ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Amplification {
    Available,
    Unsupported,
}

/// Which media target variant an agent drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    Standard,
    Platform,
}

/// Reply to an `AgentStatus` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub tracked: usize,
    pub amplification: Amplification,
    pub target: TargetKind,
}
