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

//! Byte-stream channel to one physical device.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::DeviceIdentifier;

/// Capacity of the inbound event queue of a link.
pub const EVENT_QUEUE_DEPTH: usize = 64;

/// Inbound traffic of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One notification packet.
    Packet(Vec<u8>),
    /// The link is gone.
    Disconnected { reason: String },
}

/// Outbound half of a link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Negotiated ATT MTU.
    fn mtu(&self) -> usize;

    async fn send(&self, packet: Vec<u8>) -> Result<(), TransportError>;

    /// Tear down the link. Idempotent.
    async fn disconnect(&self);
}

/// A connected channel: outbound transport plus inbound event stream.
pub struct Link {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl Link {
    pub fn new(transport: Arc<dyn Transport>, events: mpsc::Receiver<TransportEvent>) -> Self {
        Self { transport, events }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("mtu", &self.transport.mtu())
            .finish_non_exhaustive()
    }
}

/// Establishes links to devices by identifier.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, id: &DeviceIdentifier) -> Result<Link, TransportError>;
}
