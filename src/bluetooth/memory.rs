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

//! In-process link pair used by the simulator and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::transport::{Link, Transport, TransportEvent, EVENT_QUEUE_DEPTH};
use crate::error::TransportError;

/// Host side of an in-memory link.
pub struct MemoryTransport {
    mtu: usize,
    to_device: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn send(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        let tx = self
            .to_device
            .lock()
            .clone()
            .ok_or_else(|| TransportError::LinkLost("link closed".to_string()))?;
        tx.send(packet)
            .await
            .map_err(|_| TransportError::SendFailed("device side closed".to_string()))
    }

    async fn disconnect(&self) {
        if self.to_device.lock().take().is_some() {
            debug!("Memory link closed by host");
        }
    }
}

/// Device side of an in-memory link.
pub struct DevicePeer {
    from_host: mpsc::Receiver<Vec<u8>>,
    to_host: mpsc::Sender<TransportEvent>,
    mtu: usize,
}

impl DevicePeer {
    /// Next packet written by the host; `None` once the host disconnected.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_host.recv().await
    }

    /// Send one notification packet to the host.
    pub async fn notify(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        self.to_host
            .send(TransportEvent::Packet(packet))
            .await
            .map_err(|_| TransportError::LinkLost("host side closed".to_string()))
    }

    /// Simulate radio link loss.
    pub async fn drop_link(&self, reason: impl Into<String>) {
        let _ = self
            .to_host
            .send(TransportEvent::Disconnected {
                reason: reason.into(),
            })
            .await;
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

/// Create a connected host/device pair.
pub fn pair(mtu: usize) -> (Link, DevicePeer) {
    let (to_device, from_host) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (to_host, events) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let transport = Arc::new(MemoryTransport {
        mtu,
        to_device: Mutex::new(Some(to_device)),
    });

    (
        Link::new(transport, events),
        DevicePeer {
            from_host,
            to_host,
            mtu,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_packets_flow_both_ways() {
        let (mut link, mut peer) = pair(23);

        link.transport.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(peer.recv().await, Some(vec![1, 2, 3]));

        peer.notify(vec![9]).await.unwrap();
        assert_eq!(
            link.events.recv().await,
            Some(TransportEvent::Packet(vec![9]))
        );
    }

    #[tokio::test]
    async fn test_host_disconnect_closes_device_side() {
        let (link, mut peer) = pair(23);

        link.transport.disconnect().await;
        assert_eq!(peer.recv().await, None);
        assert!(matches!(
            link.transport.send(vec![1]).await,
            Err(TransportError::LinkLost(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_link_reports_reason() {
        let (mut link, peer) = pair(23);

        peer.drop_link("out of range").await;
        assert_eq!(
            link.events.recv().await,
            Some(TransportEvent::Disconnected {
                reason: "out of range".to_string()
            })
        );
    }
}
