// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The media agent for one page context.
//!
//! Tracks every media element in the document, keeps the context's volume
//! and mute applied to each (including elements that appear later) and
//! works out whether the context is currently producing audio.

use crate::gain::{GainOutcome, GainStages};
use crate::page::{
    DomError, ElementId, MediaElement, MediaEvent, MediaKind, MutationRecord, PageDocument,
    Subscription,
};
use crate::target::MediaTarget;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tabmix_ipc::{
    ActivityReportPayload, Amplification, AgentStatus, ContextId, VolumeLevel,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Per-element bookkeeping, dropped when the element goes away.
struct Tracked {
    element: Arc<dyn MediaElement>,
    original_volume: f64,
    _listener: Subscription,
}

/// What a volume or mute command did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    /// Elements updated.
    pub applied: usize,
    /// Elements whose update threw.
    pub failed: usize,
    /// The request exceeded 100% and could not be amplified.
    pub amplification_unavailable: bool,
}

/// Whether an element counts towards the context producing audio.
///
/// Playing and audible, or holding loadable audio while playing or muted.
/// The second clause keeps muted-but-playable content listed.
pub fn element_is_active(element: &dyn MediaElement) -> bool {
    let paused = element.paused();
    let muted = element.muted().unwrap_or(false);
    let volume = element.volume().unwrap_or(0.0);
    let audible = !paused && !muted && volume > 0.0;
    audible || (element.has_audio() && (!paused || muted))
}

pub struct MediaAgent {
    context_id: ContextId,
    document: Arc<dyn PageDocument>,
    target: MediaTarget,
    tracked: BTreeMap<ElementId, Tracked>,
    gains: GainStages,
    level: VolumeLevel,
    muted: bool,
    events: mpsc::UnboundedSender<MediaEvent>,
    observer: Option<Subscription>,
}

impl MediaAgent {
    /// Create an agent and the receiver its element listeners feed.
    pub fn new(
        context_id: ContextId,
        document: Arc<dyn PageDocument>,
    ) -> (Self, mpsc::UnboundedReceiver<MediaEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let target = MediaTarget::detect(document.as_ref());
        let gains = GainStages::new(document.audio_graph());
        let agent = Self {
            context_id,
            document,
            target,
            tracked: BTreeMap::new(),
            gains,
            level: VolumeLevel::UNITY,
            muted: false,
            events,
            observer: None,
        };
        (agent, receiver)
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn level(&self) -> VolumeLevel {
        self.level
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn tracked_ids(&self) -> Vec<ElementId> {
        self.tracked.keys().copied().collect()
    }

    /// Enumerate media elements, start tracking new ones and forget the
    /// ones that left the document. Returns the current set.
    pub fn scan(&mut self) -> Vec<ElementId> {
        let elements = match self.document.media_elements() {
            Ok(elements) => elements,
            Err(e) => {
                debug!("Scan of context {} found no document: {}", self.context_id, e);
                Vec::new()
            }
        };

        let present: BTreeSet<ElementId> = elements.iter().map(|e| e.id()).collect();
        let gone: Vec<ElementId> = self
            .tracked
            .keys()
            .filter(|id| !present.contains(id))
            .copied()
            .collect();
        for id in gone {
            self.tracked.remove(&id);
            self.gains.remove(id);
            debug!("Element {} left context {}", id, self.context_id);
        }

        for element in elements {
            if !self.tracked.contains_key(&element.id()) {
                self.track(element);
            }
        }
        self.tracked_ids()
    }

    fn track(&mut self, element: Arc<dyn MediaElement>) {
        let id = element.id();
        let original_volume = element.volume().unwrap_or_else(|e| {
            warn!("Could not read volume of element {}: {}", id, e);
            1.0
        });

        let native_handled = self.target.apply_volume(self.level);
        if let Err(e) = self.apply_level_to(element.as_ref(), native_handled) {
            warn!("Applying volume to new element {} failed: {}", id, e);
        }
        if self.muted {
            if let Err(e) = element.set_muted(true) {
                warn!("Muting new element {} failed: {}", id, e);
            }
        }

        let listener = element.listen(self.events.clone());
        debug!("Tracking {} element {} in context {}", element.kind(), id, self.context_id);
        self.tracked.insert(
            id,
            Tracked {
                element,
                original_volume,
                _listener: listener,
            },
        );
    }

    /// Start watching the document for added nodes.
    pub fn observe_mutations(&mut self) -> Result<mpsc::UnboundedReceiver<MutationRecord>, DomError> {
        let (sink, receiver) = mpsc::unbounded_channel();
        self.observer = Some(self.document.observe(sink)?);
        Ok(receiver)
    }

    pub fn set_volume(&mut self, level: i64) -> Result<ApplyOutcome, DomError> {
        let level = VolumeLevel::new(level)
            .map_err(|_| DomError::InvalidArgument(format!("volume level {}", level)))?;
        Ok(self.apply_volume(level))
    }

    pub fn apply_volume(&mut self, level: VolumeLevel) -> ApplyOutcome {
        self.level = level;
        let native_handled = self.target.apply_volume(level);

        let mut outcome = ApplyOutcome::default();
        let elements: Vec<Arc<dyn MediaElement>> =
            self.tracked.values().map(|t| t.element.clone()).collect();
        for element in elements {
            match self.apply_level_to(element.as_ref(), native_handled) {
                Ok(GainOutcome::Capped) => {
                    outcome.applied += 1;
                    outcome.amplification_unavailable = true;
                }
                Ok(_) => outcome.applied += 1,
                Err(e) => {
                    warn!("Setting volume on element {} failed: {}", element.id(), e);
                    outcome.failed += 1;
                }
            }
        }
        if level.is_amplified() && self.gains.amplification() == Amplification::Unsupported {
            outcome.amplification_unavailable = true;
        }
        debug!("Context {} volume {} ({:?})", self.context_id, level, outcome);
        outcome
    }

    fn apply_level_to(
        &mut self,
        element: &dyn MediaElement,
        native_handled: bool,
    ) -> Result<GainOutcome, DomError> {
        if !native_handled {
            element.set_volume(self.level.native_volume())?;
        }
        self.gains.apply(element, self.level)
    }

    /// Set the native mute flag everywhere. The volume is left alone.
    pub fn set_muted(&mut self, muted: bool) -> ApplyOutcome {
        self.muted = muted;
        let handled = self.target.apply_muted(muted);

        let mut outcome = ApplyOutcome::default();
        for tracked in self.tracked.values() {
            if handled && tracked.element.muted().ok() == Some(muted) {
                outcome.applied += 1;
                continue;
            }
            match tracked.element.set_muted(muted) {
                Ok(()) => outcome.applied += 1,
                Err(e) => {
                    warn!("Setting mute on element {} failed: {}", tracked.element.id(), e);
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    pub fn is_active(&self) -> bool {
        self.tracked
            .values()
            .any(|t| element_is_active(t.element.as_ref()))
    }

    /// Current activity, ready to send to the coordinator.
    pub fn report_activity(&self) -> ActivityReportPayload {
        let kinds: BTreeSet<MediaKind> = self.tracked.values().map(|t| t.element.kind()).collect();
        ActivityReportPayload {
            context_id: self.context_id,
            is_active: self.is_active(),
            media_kinds: kinds.iter().map(|k| k.as_str().to_string()).collect(),
            url: self.document.url(),
            title: self.document.title(),
            favicon_ref: self.document.favicon(),
        }
    }

    /// Whether an element event may have changed the activity state.
    pub fn on_media_event(&self, event: MediaEvent) -> bool {
        self.tracked.contains_key(&event.element())
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            tracked: self.tracked.len(),
            amplification: self.gains.amplification(),
            target: self.target.kind(),
        }
    }

    /// Restore original volumes, drop gain stages and stop observing.
    /// Safe to call more than once.
    pub fn cleanup(&mut self) {
        if self.tracked.is_empty() && self.observer.is_none() && self.gains.is_empty() {
            return;
        }
        for (id, tracked) in std::mem::take(&mut self.tracked) {
            if let Err(e) = tracked.element.set_volume(tracked.original_volume) {
                warn!("Restoring volume of element {} failed: {}", id, e);
            }
        }
        self.gains.clear();
        self.observer = None;
        info!("Media agent for context {} cleaned up", self.context_id);
    }
}

impl Drop for MediaAgent {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDocument, MemoryElement, MemoryGraph, MemoryPlayer};
    use tabmix_ipc::TargetKind;

    fn element(id: ElementId, kind: MediaKind) -> Arc<MemoryElement> {
        Arc::new(MemoryElement::new(id, kind))
    }

    type Events = mpsc::UnboundedReceiver<MediaEvent>;

    fn agent_for(document: MemoryDocument) -> (MediaAgent, Arc<MemoryDocument>, Events) {
        let document = Arc::new(document);
        let (agent, events) = MediaAgent::new(1, document.clone());
        (agent, document, events)
    }

    #[test]
    fn test_scan_tolerates_missing_document() {
        let doc = MemoryDocument::new("https://a.com", "A");
        doc.set_broken(true);
        let (mut agent, _, _events) = agent_for(doc);
        assert!(agent.scan().is_empty());
        assert!(!agent.report_activity().is_active);
    }

    #[test]
    fn test_native_volume_for_all_levels() {
        let graph = Arc::new(MemoryGraph::new());
        let doc = MemoryDocument::new("https://a.com", "A").with_graph(graph.clone());
        let el = element(1, MediaKind::Audio);
        doc.add_element(el.clone());
        let (mut agent, _, _events) = agent_for(doc);
        agent.scan();

        for level in [0, 1, 50, 99, 100, 101, 150, 200] {
            agent.set_volume(level).unwrap();
            let expected = level.min(100) as f64 / 100.0;
            assert!((el.current_volume() - expected).abs() < 1e-9, "level {}", level);
            if level > 100 {
                assert_eq!(graph.gain_of(1), Some(level as f64 / 100.0));
            }
        }
    }

    #[test]
    fn test_out_of_range_levels_rejected() {
        let (mut agent, _, _events) = agent_for(MemoryDocument::new("https://a.com", "A"));
        assert!(matches!(agent.set_volume(-5), Err(DomError::InvalidArgument(_))));
        assert!(matches!(agent.set_volume(250), Err(DomError::InvalidArgument(_))));
        assert_eq!(agent.level().get(), 100);
    }

    #[test]
    fn test_amplification_unavailable_is_not_an_error() {
        let doc = MemoryDocument::new("https://a.com", "A");
        let el = element(1, MediaKind::Video);
        doc.add_element(el.clone());
        let (mut agent, _, _events) = agent_for(doc);
        agent.scan();

        let outcome = agent.set_volume(180).unwrap();
        assert_eq!(outcome.applied, 1);
        assert!(outcome.amplification_unavailable);
        assert_eq!(el.current_volume(), 1.0);
        assert_eq!(agent.status().amplification, Amplification::Unsupported);
    }

    #[test]
    fn test_failing_element_does_not_stop_others() {
        let doc = MemoryDocument::new("https://a.com", "A");
        let bad = element(1, MediaKind::Audio);
        let good = element(2, MediaKind::Audio);
        doc.add_element(bad.clone());
        doc.add_element(good.clone());
        let (mut agent, _, _events) = agent_for(doc);
        agent.scan();

        bad.set_failing(true);
        let outcome = agent.set_volume(40).unwrap();
        assert_eq!(outcome, ApplyOutcome { applied: 1, failed: 1, amplification_unavailable: false });
        assert_eq!(good.current_volume(), 0.4);

        let outcome = agent.set_muted(true);
        assert_eq!(outcome.failed, 1);
        assert!(good.is_muted());
    }

    #[test]
    fn test_new_elements_get_current_settings() {
        let doc = MemoryDocument::new("https://a.com", "A");
        let (mut agent, doc, _events) = agent_for(doc);
        agent.set_volume(30).unwrap();
        agent.set_muted(true);

        let late = Arc::new(MemoryElement::new(5, MediaKind::Video).with_volume(0.8));
        doc.add_element(late.clone());
        assert_eq!(agent.scan(), vec![5]);
        assert_eq!(late.current_volume(), 0.3);
        assert!(late.is_muted());
    }

    #[test]
    fn test_mute_keeps_volume() {
        let doc = MemoryDocument::new("https://a.com", "A");
        let el = element(1, MediaKind::Audio);
        doc.add_element(el.clone());
        let (mut agent, _, _events) = agent_for(doc);
        agent.scan();
        agent.set_volume(70).unwrap();
        agent.set_muted(true);
        assert!(el.is_muted());
        assert_eq!(el.current_volume(), 0.7);
        assert_eq!(agent.level().get(), 70);
    }

    #[test]
    fn test_activity_rule() {
        // Playing, unmuted, audible.
        let doc = MemoryDocument::new("https://a.com", "A");
        let playing = element(1, MediaKind::Audio);
        playing.play();
        doc.add_element(playing);
        let (mut a, _, _events) = agent_for(doc);
        a.scan();
        assert!(a.report_activity().is_active);

        // Muted but paused with loadable audio stays visible.
        let doc = MemoryDocument::new("https://b.com", "B");
        let paused = element(2, MediaKind::Video);
        doc.add_element(paused);
        let (mut b, _, _events) = agent_for(doc);
        b.scan();
        b.set_muted(true);
        assert!(b.report_activity().is_active);

        // Paused, unmuted: inactive.
        let doc = MemoryDocument::new("https://c.com", "C");
        doc.add_element(element(3, MediaKind::Audio));
        let (mut c, _, _events) = agent_for(doc);
        c.scan();
        assert!(!c.report_activity().is_active);

        // Playing at zero volume without a loadable source: inactive.
        let doc = MemoryDocument::new("https://d.com", "D");
        let silent = Arc::new(MemoryElement::new(4, MediaKind::Video).with_audio(false));
        silent.play();
        doc.add_element(silent);
        let (mut d, _, _events) = agent_for(doc);
        d.scan();
        d.set_volume(0).unwrap();
        assert!(!d.report_activity().is_active);
    }

    #[test]
    fn test_report_lists_kinds_and_url() {
        let doc = MemoryDocument::new("https://a.com/page", "Title");
        doc.add_element(element(1, MediaKind::Video));
        doc.add_element(element(2, MediaKind::Audio));
        doc.add_element(element(3, MediaKind::Audio));
        let (mut agent, _, _events) = agent_for(doc);
        agent.scan();
        let report = agent.report_activity();
        assert_eq!(report.media_kinds, vec!["audio", "video"]);
        assert_eq!(report.url, "https://a.com/page");
        assert_eq!(report.title, "Title");
        assert_eq!(report.context_id, 1);
    }

    #[test]
    fn test_removed_elements_are_forgotten() {
        let graph = Arc::new(MemoryGraph::new());
        let doc = MemoryDocument::new("https://a.com", "A").with_graph(graph.clone());
        let el = element(1, MediaKind::Audio);
        doc.add_element(el.clone());
        let (mut agent, doc, _events) = agent_for(doc);
        agent.scan();
        agent.set_volume(150).unwrap();
        assert_eq!(el.listener_count(), 1);

        doc.remove_element(1);
        assert!(agent.scan().is_empty());
        assert_eq!(el.listener_count(), 0);
        assert_eq!(graph.gain_of(1), None);
    }

    #[test]
    fn test_cleanup_restores_and_is_idempotent() {
        let graph = Arc::new(MemoryGraph::new());
        let doc = MemoryDocument::new("https://a.com", "A").with_graph(graph.clone());
        let el = Arc::new(MemoryElement::new(1, MediaKind::Audio).with_volume(0.6));
        doc.add_element(el.clone());
        let (mut agent, doc, _events) = agent_for(doc);
        agent.scan();
        let _mutations = agent.observe_mutations().unwrap();
        agent.set_volume(160).unwrap();
        assert_eq!(doc.observer_count(), 1);

        agent.cleanup();
        assert_eq!(el.current_volume(), 0.6);
        assert_eq!(graph.gain_of(1), None);
        assert_eq!(doc.observer_count(), 0);
        assert_eq!(el.listener_count(), 0);

        agent.cleanup();
        assert_eq!(el.current_volume(), 0.6);
        assert_eq!(agent.status().tracked, 0);
    }

    #[test]
    fn test_platform_player_preferred() {
        let video = element(1, MediaKind::Video);
        let player = Arc::new(MemoryPlayer::new(video.clone()));
        let doc = MemoryDocument::new("https://www.youtube.com/watch?v=x", "Clip")
            .with_player(player.clone());
        doc.add_element(video.clone());
        let (mut agent, _, _events) = agent_for(doc);
        assert_eq!(agent.status().target, TargetKind::Platform);
        agent.scan();

        agent.set_volume(40).unwrap();
        assert!(player.calls().contains(&"setVolume(40)".to_string()));
        assert_eq!(video.current_volume(), 0.4);

        agent.set_muted(true);
        assert!(player.calls().contains(&"mute()".to_string()));
        assert!(video.is_muted());
    }

    #[test]
    fn test_platform_player_failure_falls_back() {
        let video = element(1, MediaKind::Video);
        let player = Arc::new(MemoryPlayer::new(video.clone()));
        player.set_failing(true);
        let doc = MemoryDocument::new("https://youtube.com/watch?v=x", "Clip")
            .with_player(player.clone());
        doc.add_element(video.clone());
        let (mut agent, _, _events) = agent_for(doc);
        agent.scan();

        let outcome = agent.set_volume(25).unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(video.current_volume(), 0.25);
        assert!(player.calls().is_empty());
    }

    #[test]
    fn test_platform_excess_goes_through_gain() {
        let graph = Arc::new(MemoryGraph::new());
        let video = element(1, MediaKind::Video);
        let player = Arc::new(MemoryPlayer::new(video.clone()));
        let doc = MemoryDocument::new("https://youtube.com/watch?v=x", "Clip")
            .with_player(player.clone())
            .with_graph(graph.clone());
        doc.add_element(video.clone());
        let (mut agent, _, _events) = agent_for(doc);
        agent.scan();

        agent.set_volume(170).unwrap();
        assert!(player.calls().contains(&"setVolume(100)".to_string()));
        assert_eq!(video.current_volume(), 1.0);
        assert_eq!(graph.gain_of(1), Some(1.7));
    }
}
