// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! TabMix page side: the media agent that runs in each page context and
//! the panel client that drives the coordinator.
//!
//! The page itself is reached only through the capability traits in
//! [`page`]; [`memory`] implements them for headless hosts.

pub mod agent;
pub mod gain;
pub mod host;
pub mod memory;
pub mod page;
pub mod panel_client;
pub mod schedule;
pub mod target;
pub mod transport;

pub use agent::{ApplyOutcome, MediaAgent};
pub use host::{ActivitySink, AgentHost};
pub use panel_client::{DebounceFailure, PanelClient, VolumeDebouncer};
pub use schedule::ScheduledTask;
pub use transport::{connect_agent, CommandSink, Connection};
