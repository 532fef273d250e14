// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Registry lifecycle events.

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::protocol::{DeviceFamily, DeviceIdentifier};

/// Capacity of each registry's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Something that happened to a session owned by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Connected {
        family: DeviceFamily,
        id: DeviceIdentifier,
    },
    Disconnected {
        family: DeviceFamily,
        id: DeviceIdentifier,
        reason: String,
    },
    /// Unsolicited or undecodable frame while no command was pending.
    ProtocolError {
        family: DeviceFamily,
        id: DeviceIdentifier,
        detail: String,
    },
}

impl RegistryEvent {
    pub fn id(&self) -> &DeviceIdentifier {
        match self {
            Self::Connected { id, .. }
            | Self::Disconnected { id, .. }
            | Self::ProtocolError { id, .. } => id,
        }
    }
}

/// Log registry events until the channel closes.
pub async fn log_events(mut events: broadcast::Receiver<RegistryEvent>) {
    loop {
        match events.recv().await {
            Ok(RegistryEvent::Connected { family, id }) => {
                info!("{} device connected: {}", family, id);
            }
            Ok(RegistryEvent::Disconnected { family, id, reason }) => {
                info!("{} device disconnected: {} ({})", family, id, reason);
            }
            Ok(RegistryEvent::ProtocolError { family, id, detail }) => {
                warn!("{} device {} protocol error: {}", family, id, detail);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event logger lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Event logger stopped");
}
