// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! TabMix coordinator: the single authority over which page contexts are
//! producing audio, their volume and mute state, and the per-origin
//! preferences restored when a site starts playing again.

pub mod actor;
pub mod agents;
pub mod clock;
pub mod config;
pub mod migration;
pub mod server;
pub mod service;
pub mod storage;
pub mod store;

pub use actor::{spawn, CoordinatorHandle};
pub use agents::{AgentLink, AgentRegistry, LinkError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ConfigManager, DaemonConfig};
pub use service::{Coordinator, CoordinatorOptions, Reply};
pub use storage::{FileArea, MemoryArea, StorageArea, StorageError};
pub use store::{StorageTiers, Store, StoreError};
