// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gain stages for amplification above the native 100% ceiling.
//!
//! Once an element is routed through a gain node it stays routed; dropping
//! back to 100% or below sets the gain to unity rather than disconnecting.

use crate::page::{AudioGraph, DomError, ElementId, GainStage, MediaElement};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tabmix_ipc::{Amplification, VolumeLevel};
use tracing::{debug, info};

/// Result of applying a level to one element's gain stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainOutcome {
    /// No amplification needed.
    Native,
    Amplified,
    /// Level above 100 requested but no graph available; capped at 100.
    Capped,
}

pub struct GainStages {
    graph: Option<Arc<dyn AudioGraph>>,
    stages: HashMap<ElementId, Box<dyn GainStage>>,
    capped_logged: HashSet<ElementId>,
}

impl GainStages {
    pub fn new(graph: Option<Arc<dyn AudioGraph>>) -> Self {
        Self {
            graph,
            stages: HashMap::new(),
            capped_logged: HashSet::new(),
        }
    }

    pub fn amplification(&self) -> Amplification {
        if self.graph.is_some() {
            Amplification::Available
        } else {
            Amplification::Unsupported
        }
    }

    pub fn apply(
        &mut self,
        element: &dyn MediaElement,
        level: VolumeLevel,
    ) -> Result<GainOutcome, DomError> {
        let id = element.id();
        if !level.is_amplified() {
            if let Some(stage) = self.stages.get(&id) {
                stage.set_gain(1.0)?;
            }
            return Ok(GainOutcome::Native);
        }

        let Some(graph) = &self.graph else {
            if self.capped_logged.insert(id) {
                info!(
                    "Amplification to {} requested for element {} but unavailable, capping at 100%",
                    level, id
                );
            }
            return Ok(GainOutcome::Capped);
        };

        if !self.stages.contains_key(&id) {
            let stage = graph.connect_gain(element)?;
            debug!("Connected gain stage for element {}", id);
            self.stages.insert(id, stage);
        }
        if let Some(stage) = self.stages.get(&id) {
            // Native volume is already at 1.0; the stage supplies the rest.
            stage.set_gain(level.gain())?;
        }
        Ok(GainOutcome::Amplified)
    }

    /// Tear down the stage for an element that went away.
    pub fn remove(&mut self, id: ElementId) {
        if let Some(stage) = self.stages.remove(&id) {
            stage.disconnect();
        }
        self.capped_logged.remove(&id);
    }

    pub fn clear(&mut self) {
        for (_, stage) in self.stages.drain() {
            stage.disconnect();
        }
        self.capped_logged.clear();
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
