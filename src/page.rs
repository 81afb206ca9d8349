// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Capabilities a page context exposes to the media agent.
//!
//! The agent never touches a document directly; the embedding host
//! implements these traits over whatever DOM it runs in.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Short-lived handle for a media element, unique within one document.
pub type ElementId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Element {0} is no longer attached")]
    Detached(ElementId),
    #[error("Not supported: {0}")]
    Unsupported(String),
    #[error("Script error: {0}")]
    Script(String),
}

/// Kind of media element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Tag name of a node that is a media element.
    pub fn from_tag(tag: &str) -> Option<MediaKind> {
        match tag.to_ascii_lowercase().as_str() {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Playback events from a single element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEvent {
    Play(ElementId),
    Pause(ElementId),
    VolumeChange(ElementId),
    Ended(ElementId),
}

impl MediaEvent {
    pub fn element(&self) -> ElementId {
        match self {
            MediaEvent::Play(id)
            | MediaEvent::Pause(id)
            | MediaEvent::VolumeChange(id)
            | MediaEvent::Ended(id) => *id,
        }
    }
}

/// A node added to the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedNode {
    pub tag: String,
    /// Number of media elements below this node.
    pub media_descendants: usize,
}

impl AddedNode {
    pub fn qualifies(&self) -> bool {
        MediaKind::from_tag(&self.tag).is_some() || self.media_descendants > 0
    }
}

/// One batch of document structure changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationRecord {
    pub added_nodes: Vec<AddedNode>,
}

impl MutationRecord {
    /// Whether any added node is or contains a media element.
    pub fn adds_media(&self) -> bool {
        self.added_nodes.iter().any(AddedNode::qualifies)
    }
}

/// Handle to an active listener or observer. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// An `<audio>` or `<video>` element.
pub trait MediaElement: Send + Sync {
    fn id(&self) -> ElementId;
    fn kind(&self) -> MediaKind;
    /// Native volume in 0.0..=1.0.
    fn volume(&self) -> Result<f64, DomError>;
    fn set_volume(&self, volume: f64) -> Result<(), DomError>;
    fn muted(&self) -> Result<bool, DomError>;
    fn set_muted(&self, muted: bool) -> Result<(), DomError>;
    fn paused(&self) -> bool;
    /// Has a source with loadable audio.
    fn has_audio(&self) -> bool;
    /// Forward play/pause/volume events into `sink`.
    fn listen(&self, sink: mpsc::UnboundedSender<MediaEvent>) -> Subscription;
}

/// The native control surface of a streaming platform's player.
pub trait PlatformPlayer: Send + Sync {
    /// Volume on the player's own 0..=100 scale.
    fn set_volume(&self, volume: u8) -> Result<(), DomError>;
    fn set_muted(&self, muted: bool) -> Result<(), DomError>;
}

/// A gain node inserted between an element and the output.
pub trait GainStage: Send + Sync {
    fn set_gain(&self, gain: f64) -> Result<(), DomError>;
    fn disconnect(&self);
}

/// Audio processing graph used for amplification above the native ceiling.
pub trait AudioGraph: Send + Sync {
    fn connect_gain(&self, element: &dyn MediaElement) -> Result<Box<dyn GainStage>, DomError>;
}

/// The document of one page context.
pub trait PageDocument: Send + Sync {
    fn url(&self) -> String;
    fn title(&self) -> String;
    fn favicon(&self) -> Option<String> {
        None
    }
    /// All media elements currently in the document.
    fn media_elements(&self) -> Result<Vec<Arc<dyn MediaElement>>, DomError>;
    /// Subscribe to structure changes.
    fn observe(&self, sink: mpsc::UnboundedSender<MutationRecord>) -> Result<Subscription, DomError>;
    /// The platform player's control surface, if this page embeds one.
    fn platform_player(&self) -> Option<Arc<dyn PlatformPlayer>>;
    /// `None` when the page cannot do gain processing.
    fn audio_graph(&self) -> Option<Arc<dyn AudioGraph>>;
}
