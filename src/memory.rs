// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory page implementation for headless hosts and tests.

use crate::page::{
    AddedNode, AudioGraph, DomError, ElementId, GainStage, MediaElement, MediaEvent, MediaKind,
    MutationRecord, PageDocument, PlatformPlayer, Subscription,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

type Listeners<T> = Arc<Mutex<Vec<(u64, mpsc::UnboundedSender<T>)>>>;

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

fn add_listener<T: Send + 'static>(listeners: &Listeners<T>, sink: mpsc::UnboundedSender<T>) -> Subscription {
    let token = NEXT_LISTENER.fetch_add(1, Ordering::Relaxed);
    listeners.lock().push((token, sink));
    let listeners = listeners.clone();
    Subscription::new(move || listeners.lock().retain(|(t, _)| *t != token))
}

fn notify<T: Clone>(listeners: &Listeners<T>, event: T) {
    listeners
        .lock()
        .retain(|(_, sink)| sink.send(event.clone()).is_ok());
}

#[derive(Debug, Clone)]
struct ElementState {
    volume: f64,
    muted: bool,
    paused: bool,
    has_audio: bool,
}

pub struct MemoryElement {
    id: ElementId,
    kind: MediaKind,
    state: Mutex<ElementState>,
    failing: AtomicBool,
    listeners: Listeners<MediaEvent>,
}

impl MemoryElement {
    /// A paused element with a loadable source at full volume.
    pub fn new(id: ElementId, kind: MediaKind) -> Self {
        Self {
            id,
            kind,
            state: Mutex::new(ElementState {
                volume: 1.0,
                muted: false,
                paused: true,
                has_audio: true,
            }),
            failing: AtomicBool::new(false),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_volume(self, volume: f64) -> Self {
        self.state.lock().volume = volume;
        self
    }

    pub fn with_audio(self, has_audio: bool) -> Self {
        self.state.lock().has_audio = has_audio;
        self
    }

    pub fn play(&self) {
        self.state.lock().paused = false;
        notify(&self.listeners, MediaEvent::Play(self.id));
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
        notify(&self.listeners, MediaEvent::Pause(self.id));
    }

    /// Make every volume/mute write fail, as a detached element would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn current_volume(&self) -> f64 {
        self.state.lock().volume
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn check(&self) -> Result<(), DomError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(DomError::Detached(self.id))
        } else {
            Ok(())
        }
    }
}

impl MediaElement for MemoryElement {
    fn id(&self) -> ElementId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn volume(&self) -> Result<f64, DomError> {
        self.check()?;
        Ok(self.state.lock().volume)
    }

    fn set_volume(&self, volume: f64) -> Result<(), DomError> {
        self.check()?;
        if !(0.0..=1.0).contains(&volume) {
            return Err(DomError::InvalidArgument(format!("volume {}", volume)));
        }
        self.state.lock().volume = volume;
        notify(&self.listeners, MediaEvent::VolumeChange(self.id));
        Ok(())
    }

    fn muted(&self) -> Result<bool, DomError> {
        self.check()?;
        Ok(self.state.lock().muted)
    }

    fn set_muted(&self, muted: bool) -> Result<(), DomError> {
        self.check()?;
        self.state.lock().muted = muted;
        notify(&self.listeners, MediaEvent::VolumeChange(self.id));
        Ok(())
    }

    fn paused(&self) -> bool {
        self.state.lock().paused
    }

    fn has_audio(&self) -> bool {
        self.state.lock().has_audio
    }

    fn listen(&self, sink: mpsc::UnboundedSender<MediaEvent>) -> Subscription {
        add_listener(&self.listeners, sink)
    }
}

/// Player API that drives its own element on a 0..=100 scale.
pub struct MemoryPlayer {
    element: Arc<MemoryElement>,
    failing: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MemoryPlayer {
    pub fn new(element: Arc<MemoryElement>) -> Self {
        Self {
            element,
            failing: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Calls made through the player API, e.g. `"setVolume(40)"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl PlatformPlayer for MemoryPlayer {
    fn set_volume(&self, volume: u8) -> Result<(), DomError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DomError::Script("player API threw".into()));
        }
        if volume > 100 {
            return Err(DomError::InvalidArgument(format!("player volume {}", volume)));
        }
        self.calls.lock().push(format!("setVolume({})", volume));
        self.element.set_volume(volume as f64 / 100.0)
    }

    fn set_muted(&self, muted: bool) -> Result<(), DomError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DomError::Script("player API threw".into()));
        }
        self.calls
            .lock()
            .push(if muted { "mute()" } else { "unMute()" }.to_string());
        self.element.set_muted(muted)
    }
}

/// Audio graph that records each element's current gain.
#[derive(Default)]
pub struct MemoryGraph {
    gains: Arc<Mutex<HashMap<ElementId, f64>>>,
}

struct MemoryGain {
    element: ElementId,
    gains: Arc<Mutex<HashMap<ElementId, f64>>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gain applied to an element, `None` when it is not routed.
    pub fn gain_of(&self, element: ElementId) -> Option<f64> {
        self.gains.lock().get(&element).copied()
    }
}

impl AudioGraph for MemoryGraph {
    fn connect_gain(&self, element: &dyn MediaElement) -> Result<Box<dyn GainStage>, DomError> {
        self.gains.lock().insert(element.id(), 1.0);
        Ok(Box::new(MemoryGain {
            element: element.id(),
            gains: self.gains.clone(),
        }))
    }
}

impl GainStage for MemoryGain {
    fn set_gain(&self, gain: f64) -> Result<(), DomError> {
        match self.gains.lock().get_mut(&self.element) {
            Some(g) => {
                *g = gain;
                Ok(())
            }
            None => Err(DomError::Detached(self.element)),
        }
    }

    fn disconnect(&self) {
        self.gains.lock().remove(&self.element);
    }
}

/// A document whose media elements are added and removed by hand.
pub struct MemoryDocument {
    url: Mutex<String>,
    title: Mutex<String>,
    elements: Mutex<Vec<Arc<MemoryElement>>>,
    observers: Listeners<MutationRecord>,
    player: Option<Arc<MemoryPlayer>>,
    graph: Option<Arc<MemoryGraph>>,
    broken: AtomicBool,
}

impl MemoryDocument {
    pub fn new(url: &str, title: &str) -> Self {
        Self {
            url: Mutex::new(url.to_string()),
            title: Mutex::new(title.to_string()),
            elements: Mutex::new(Vec::new()),
            observers: Arc::new(Mutex::new(Vec::new())),
            player: None,
            graph: None,
            broken: AtomicBool::new(false),
        }
    }

    pub fn with_player(mut self, player: Arc<MemoryPlayer>) -> Self {
        self.player = Some(player);
        self
    }

    pub fn with_graph(mut self, graph: Arc<MemoryGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Insert an element, notifying observers.
    pub fn add_element(&self, element: Arc<MemoryElement>) {
        let tag = element.kind().as_str().to_string();
        self.elements.lock().push(element);
        notify(
            &self.observers,
            MutationRecord {
                added_nodes: vec![AddedNode {
                    tag,
                    media_descendants: 0,
                }],
            },
        );
    }

    pub fn remove_element(&self, id: ElementId) {
        self.elements.lock().retain(|e| e.id() != id);
    }

    /// Report a mutation that adds no media.
    pub fn add_plain_node(&self, tag: &str) {
        notify(
            &self.observers,
            MutationRecord {
                added_nodes: vec![AddedNode {
                    tag: tag.to_string(),
                    media_descendants: 0,
                }],
            },
        );
    }

    pub fn set_title(&self, title: &str) {
        *self.title.lock() = title.to_string();
    }

    /// Make element enumeration fail, as with a half-torn-down document.
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

impl PageDocument for MemoryDocument {
    fn url(&self) -> String {
        self.url.lock().clone()
    }

    fn title(&self) -> String {
        self.title.lock().clone()
    }

    fn media_elements(&self) -> Result<Vec<Arc<dyn MediaElement>>, DomError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(DomError::Script("document is not ready".into()));
        }
        Ok(self
            .elements
            .lock()
            .iter()
            .map(|e| e.clone() as Arc<dyn MediaElement>)
            .collect())
    }

    fn observe(&self, sink: mpsc::UnboundedSender<MutationRecord>) -> Result<Subscription, DomError> {
        Ok(add_listener(&self.observers, sink))
    }

    fn platform_player(&self) -> Option<Arc<dyn PlatformPlayer>> {
        self.player.clone().map(|p| p as Arc<dyn PlatformPlayer>)
    }

    fn audio_graph(&self) -> Option<Arc<dyn AudioGraph>> {
        self.graph.clone().map(|g| g as Arc<dyn AudioGraph>)
    }
}
