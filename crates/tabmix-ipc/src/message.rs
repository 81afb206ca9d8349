// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Command and response envelopes and their typed payloads.

use crate::error::{ErrorBody, TabmixError};
use crate::models::{AudioTab, ContextId, GlobalConfigPatch, OriginVolumeProfile, VolumeLevel};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;

/// A command or query sent to the coordinator (or, downstream, to an agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommandEnvelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Reply to a [`CommandEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Degraded-mode notice on an otherwise successful command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ResponseEnvelope {
    pub fn success(data: Value, correlation_id: Option<String>) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            warning: None,
            correlation_id,
        }
    }

    /// Build an error reply that keeps the command's target identifiers.
    pub fn failure(
        error: &TabmixError,
        target: Option<Value>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            ok: false,
            data: target,
            error: Some(error.to_body()),
            warning: None,
            correlation_id,
        }
    }

    pub fn with_warning(mut self, warning: Option<&TabmixError>) -> Self {
        self.warning = warning.map(TabmixError::to_body);
        self
    }

    /// Convert into a `Result`, as a client would.
    pub fn into_result(self) -> Result<Value, TabmixError> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .as_ref()
                .map(TabmixError::from_body)
                .unwrap_or_else(|| TabmixError::Internal("error response without body".into())))
        }
    }
}

/// Message kinds understood by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    ActivityReport,
    SetVolume,
    SetMute,
    ListActiveContexts,
    GetContextState,
    RestoreProfile,
    ContextClosed,
    GetConfig,
    UpdateConfig,
    ExportProfiles,
    ImportProfiles,
    ResetOriginProfile,
    GetAgentStatus,
    AgentHello,
    Subscribe,
}

impl CommandKind {
    pub const ALL: [CommandKind; 15] = [
        CommandKind::ActivityReport,
        CommandKind::SetVolume,
        CommandKind::SetMute,
        CommandKind::ListActiveContexts,
        CommandKind::GetContextState,
        CommandKind::RestoreProfile,
        CommandKind::ContextClosed,
        CommandKind::GetConfig,
        CommandKind::UpdateConfig,
        CommandKind::ExportProfiles,
        CommandKind::ImportProfiles,
        CommandKind::ResetOriginProfile,
        CommandKind::GetAgentStatus,
        CommandKind::AgentHello,
        CommandKind::Subscribe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::ActivityReport => "ActivityReport",
            CommandKind::SetVolume => "SetVolume",
            CommandKind::SetMute => "SetMute",
            CommandKind::ListActiveContexts => "ListActiveContexts",
            CommandKind::GetContextState => "GetContextState",
            CommandKind::RestoreProfile => "RestoreProfile",
            CommandKind::ContextClosed => "ContextClosed",
            CommandKind::GetConfig => "GetConfig",
            CommandKind::UpdateConfig => "UpdateConfig",
            CommandKind::ExportProfiles => "ExportProfiles",
            CommandKind::ImportProfiles => "ImportProfiles",
            CommandKind::ResetOriginProfile => "ResetOriginProfile",
            CommandKind::GetAgentStatus => "GetAgentStatus",
            CommandKind::AgentHello => "AgentHello",
            CommandKind::Subscribe => "Subscribe",
        }
    }

    pub fn parse(kind: &str) -> Option<CommandKind> {
        Self::ALL.iter().copied().find(|k| k.as_str() == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityReportPayload {
    pub context_id: ContextId,
    pub is_active: bool,
    #[serde(default)]
    pub media_kinds: Vec<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVolumePayload {
    pub context_id: ContextId,
    /// Raw level; range-checked after the schema check.
    pub level: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMutePayload {
    pub context_id: ContextId,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPayload {
    pub context_id: ContextId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreProfilePayload {
    pub context_id: ContextId,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginPayload {
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProfilesPayload {
    pub profiles: Vec<OriginVolumeProfile>,
    #[serde(default)]
    pub average: bool,
}

/// Payload for queries that take no arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyPayload {}

/// A schema-validated coordinator command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ActivityReport(ActivityReportPayload),
    SetVolume {
        context_id: ContextId,
        level: VolumeLevel,
    },
    SetMute(SetMutePayload),
    ListActiveContexts,
    GetContextState(ContextPayload),
    RestoreProfile(RestoreProfilePayload),
    ContextClosed(ContextPayload),
    GetConfig,
    UpdateConfig(GlobalConfigPatch),
    ExportProfiles,
    ImportProfiles(ImportProfilesPayload),
    ResetOriginProfile(OriginPayload),
    GetAgentStatus(ContextPayload),
    AgentHello(ContextPayload),
    Subscribe,
}

fn parse_payload<T: DeserializeOwned>(kind: CommandKind, payload: &Value) -> Result<T, TabmixError> {
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload.clone()
    };
    serde_json::from_value(payload)
        .map_err(|e| TabmixError::Validation(format!("{} payload: {}", kind.as_str(), e)))
}

fn check_context_id(context_id: ContextId) -> Result<(), TabmixError> {
    if context_id == 0 {
        return Err(TabmixError::Validation("contextId must be positive".into()));
    }
    Ok(())
}

impl Command {
    /// Parse an envelope: kind lookup, then schema, then value ranges.
    pub fn parse(envelope: &CommandEnvelope) -> Result<Command, TabmixError> {
        let kind = CommandKind::parse(&envelope.kind)
            .ok_or_else(|| TabmixError::UnsupportedCommand(envelope.kind.clone()))?;
        let payload = &envelope.payload;

        let command = match kind {
            CommandKind::ActivityReport => {
                let p: ActivityReportPayload = parse_payload(kind, payload)?;
                check_context_id(p.context_id)?;
                Command::ActivityReport(p)
            }
            CommandKind::SetVolume => {
                let p: SetVolumePayload = parse_payload(kind, payload)?;
                check_context_id(p.context_id)?;
                Command::SetVolume {
                    context_id: p.context_id,
                    level: VolumeLevel::new(p.level)?,
                }
            }
            CommandKind::SetMute => {
                let p: SetMutePayload = parse_payload(kind, payload)?;
                check_context_id(p.context_id)?;
                Command::SetMute(p)
            }
            CommandKind::ListActiveContexts => {
                parse_payload::<EmptyPayload>(kind, payload)?;
                Command::ListActiveContexts
            }
            CommandKind::GetContextState => {
                let p: ContextPayload = parse_payload(kind, payload)?;
                check_context_id(p.context_id)?;
                Command::GetContextState(p)
            }
            CommandKind::RestoreProfile => {
                let p: RestoreProfilePayload = parse_payload(kind, payload)?;
                check_context_id(p.context_id)?;
                Command::RestoreProfile(p)
            }
            CommandKind::ContextClosed => {
                let p: ContextPayload = parse_payload(kind, payload)?;
                check_context_id(p.context_id)?;
                Command::ContextClosed(p)
            }
            CommandKind::GetConfig => {
                parse_payload::<EmptyPayload>(kind, payload)?;
                Command::GetConfig
            }
            CommandKind::UpdateConfig => Command::UpdateConfig(parse_payload(kind, payload)?),
            CommandKind::ExportProfiles => {
                parse_payload::<EmptyPayload>(kind, payload)?;
                Command::ExportProfiles
            }
            CommandKind::ImportProfiles => Command::ImportProfiles(parse_payload(kind, payload)?),
            CommandKind::ResetOriginProfile => {
                Command::ResetOriginProfile(parse_payload(kind, payload)?)
            }
            CommandKind::GetAgentStatus => {
                let p: ContextPayload = parse_payload(kind, payload)?;
                check_context_id(p.context_id)?;
                Command::GetAgentStatus(p)
            }
            CommandKind::AgentHello => {
                let p: ContextPayload = parse_payload(kind, payload)?;
                check_context_id(p.context_id)?;
                Command::AgentHello(p)
            }
            CommandKind::Subscribe => {
                parse_payload::<EmptyPayload>(kind, payload)?;
                Command::Subscribe
            }
        };
        Ok(command)
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::ActivityReport(_) => CommandKind::ActivityReport,
            Command::SetVolume { .. } => CommandKind::SetVolume,
            Command::SetMute(_) => CommandKind::SetMute,
            Command::ListActiveContexts => CommandKind::ListActiveContexts,
            Command::GetContextState(_) => CommandKind::GetContextState,
            Command::RestoreProfile(_) => CommandKind::RestoreProfile,
            Command::ContextClosed(_) => CommandKind::ContextClosed,
            Command::GetConfig => CommandKind::GetConfig,
            Command::UpdateConfig(_) => CommandKind::UpdateConfig,
            Command::ExportProfiles => CommandKind::ExportProfiles,
            Command::ImportProfiles(_) => CommandKind::ImportProfiles,
            Command::ResetOriginProfile(_) => CommandKind::ResetOriginProfile,
            Command::GetAgentStatus(_) => CommandKind::GetAgentStatus,
            Command::AgentHello(_) => CommandKind::AgentHello,
            Command::Subscribe => CommandKind::Subscribe,
        }
    }

    /// Context targeted by this command, if any.
    pub fn context_id(&self) -> Option<ContextId> {
        match self {
            Command::ActivityReport(p) => Some(p.context_id),
            Command::SetVolume { context_id, .. } => Some(*context_id),
            Command::SetMute(p) => Some(p.context_id),
            Command::GetContextState(p)
            | Command::ContextClosed(p)
            | Command::GetAgentStatus(p)
            | Command::AgentHello(p) => Some(p.context_id),
            Command::RestoreProfile(p) => Some(p.context_id),
            _ => None,
        }
    }

    /// Build the wire envelope for this command.
    pub fn to_envelope(&self) -> CommandEnvelope {
        let payload = match self {
            Command::ActivityReport(p) => json!(p),
            Command::SetVolume { context_id, level } => {
                json!({ "contextId": context_id, "level": level.get() })
            }
            Command::SetMute(p) => json!(p),
            Command::GetContextState(p)
            | Command::ContextClosed(p)
            | Command::GetAgentStatus(p)
            | Command::AgentHello(p) => json!(p),
            Command::RestoreProfile(p) => json!(p),
            Command::UpdateConfig(p) => json!(p),
            Command::ImportProfiles(p) => json!(p),
            Command::ResetOriginProfile(p) => json!(p),
            Command::ListActiveContexts
            | Command::GetConfig
            | Command::ExportProfiles
            | Command::Subscribe => json!({}),
        };
        CommandEnvelope::new(self.kind().as_str(), payload)
    }
}

/// Best-effort extraction of target identifiers from a raw payload, so that
/// error replies can name the element they refer to even when the payload
/// failed validation.
pub fn target_identifiers(envelope: &CommandEnvelope) -> Option<Value> {
    let payload = envelope.payload.as_object()?;
    let mut target = serde_json::Map::new();
    for key in ["contextId", "origin"] {
        if let Some(v) = payload.get(key) {
            target.insert(key.to_string(), v.clone());
        }
    }
    if target.is_empty() {
        None
    } else {
        Some(Value::Object(target))
    }
}

/// Commands issued by the coordinator to a page-context agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    ApplyVolume { level: VolumeLevel },
    ApplyMute { muted: bool },
    AgentStatus,
}

impl AgentCommand {
    pub fn kind_str(&self) -> &'static str {
        match self {
            AgentCommand::ApplyVolume { .. } => "ApplyVolume",
            AgentCommand::ApplyMute { .. } => "ApplyMute",
            AgentCommand::AgentStatus => "AgentStatus",
        }
    }

    pub fn to_envelope(&self) -> CommandEnvelope {
        let payload = match self {
            AgentCommand::ApplyVolume { level } => json!({ "level": level.get() }),
            AgentCommand::ApplyMute { muted } => json!({ "muted": muted }),
            AgentCommand::AgentStatus => json!({}),
        };
        CommandEnvelope::new(self.kind_str(), payload)
    }

    pub fn from_envelope(envelope: &CommandEnvelope) -> Result<AgentCommand, TabmixError> {
        #[derive(Deserialize)]
        struct Level {
            level: i64,
        }
        #[derive(Deserialize)]
        struct Muted {
            muted: bool,
        }

        let invalid = |e: serde_json::Error| {
            TabmixError::Validation(format!("{} payload: {}", envelope.kind, e))
        };
        match envelope.kind.as_str() {
            "ApplyVolume" => {
                let p: Level = serde_json::from_value(envelope.payload.clone()).map_err(invalid)?;
                Ok(AgentCommand::ApplyVolume {
                    level: VolumeLevel::new(p.level)?,
                })
            }
            "ApplyMute" => {
                let p: Muted = serde_json::from_value(envelope.payload.clone()).map_err(invalid)?;
                Ok(AgentCommand::ApplyMute { muted: p.muted })
            }
            "AgentStatus" => Ok(AgentCommand::AgentStatus),
            other => Err(TabmixError::UnsupportedCommand(other.to_string())),
        }
    }
}

/// Reply sent back by an agent: acknowledgement data or a failure message.
pub type AgentReply = Result<Value, String>;

/// An [`AgentCommand`] in flight to an agent, with its reply slot.
#[derive(Debug)]
pub struct AgentRequest {
    pub command: AgentCommand,
    pub reply: oneshot::Sender<AgentReply>,
}

/// Unsolicited notifications pushed to subscribed panels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum PanelEvent {
    #[serde(rename_all = "camelCase")]
    ActiveContextsChanged { contexts: Vec<AudioTab> },
    #[serde(rename_all = "camelCase")]
    ProfileRestored {
        context_id: ContextId,
        origin: String,
        level: VolumeLevel,
        muted: bool,
    },
}

impl PanelEvent {
    pub fn is_event_kind(kind: &str) -> bool {
        matches!(kind, "ActiveContextsChanged" | "ProfileRestored")
    }
}

/// Largest accepted line on the wire.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// One line on the wire. Responses carry `ok`; everything else (commands,
/// agent commands, panel events) carries `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Response(ResponseEnvelope),
    Command(CommandEnvelope),
}

impl From<CommandEnvelope> for Frame {
    fn from(envelope: CommandEnvelope) -> Self {
        Frame::Command(envelope)
    }
}

impl From<ResponseEnvelope> for Frame {
    fn from(envelope: ResponseEnvelope) -> Self {
        Frame::Response(envelope)
    }
}

impl From<&PanelEvent> for Frame {
    fn from(event: &PanelEvent) -> Self {
        let (kind, payload) = match serde_json::to_value(event) {
            Ok(Value::Object(mut map)) => (
                map.remove("kind")
                    .and_then(|k| k.as_str().map(str::to_string))
                    .unwrap_or_default(),
                map.remove("payload").unwrap_or(Value::Null),
            ),
            _ => (String::new(), Value::Null),
        };
        Frame::Command(CommandEnvelope::new(kind, payload))
    }
}

/// Serialize a frame as a single newline-terminated line.
pub fn encode_frame(frame: &Frame) -> Result<String, TabmixError> {
    let mut line = serde_json::to_string(frame)
        .map_err(|e| TabmixError::Internal(format!("encode frame: {}", e)))?;
    line.push('\n');
    Ok(line)
}

/// Parse one line. Blank lines yield `None`.
pub fn decode_frame(line: &str) -> Result<Option<Frame>, TabmixError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if line.len() > MAX_FRAME_BYTES {
        return Err(TabmixError::Validation(format!(
            "frame of {} bytes exceeds {}",
            line.len(),
            MAX_FRAME_BYTES
        )));
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| TabmixError::Validation(format!("malformed frame: {}", e)))
}

/// Convert an event frame back into a [`PanelEvent`].
pub fn panel_event_from_envelope(envelope: &CommandEnvelope) -> Option<PanelEvent> {
    if !PanelEvent::is_event_kind(&envelope.kind) {
        return None;
    }
    serde_json::from_value(json!({ "kind": envelope.kind, "payload": envelope.payload })).ok()
}
