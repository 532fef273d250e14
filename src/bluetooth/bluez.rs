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

//! BLE GATT central transport on top of BlueZ.

use anyhow::Result;
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::transport::{Connector, Link, Transport, TransportEvent, EVENT_QUEUE_DEPTH};
use crate::error::TransportError;
use crate::protocol::{DeviceIdentifier, GattProfile};

/// Poll interval while waiting for service discovery.
const SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn connect_failed(err: impl std::fmt::Display) -> TransportError {
    TransportError::ConnectFailed(err.to_string())
}

/// Connects to monitors by MAC address through the local BlueZ adapter.
pub struct BluezConnector {
    adapter: Adapter,
    profile: GattProfile,
    connect_timeout: Duration,
    fallback_mtu: usize,
}

impl BluezConnector {
    /// Open a BlueZ session and power on the adapter.
    pub async fn new(
        adapter_name: Option<&str>,
        profile: GattProfile,
        connect_timeout: Duration,
        fallback_mtu: usize,
    ) -> Result<Self> {
        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        Ok(Self {
            adapter,
            profile,
            connect_timeout,
            fallback_mtu,
        })
    }

    async fn wait_for_services(&self, device: &Device) -> Result<(), TransportError> {
        let wait = async {
            loop {
                if device.is_services_resolved().await.map_err(connect_failed)? {
                    return Ok::<(), TransportError>(());
                }
                tokio::time::sleep(SERVICE_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(self.connect_timeout, wait)
            .await
            .map_err(|_| connect_failed("service discovery timed out"))?
    }

    /// Locate the write and notify characteristics of the family profile.
    async fn find_endpoints(
        &self,
        device: &Device,
    ) -> Result<(Characteristic, Characteristic), TransportError> {
        for service in device.services().await.map_err(connect_failed)? {
            if service.uuid().await.map_err(connect_failed)? != self.profile.service {
                continue;
            }

            let mut write = None;
            let mut notify = None;
            for characteristic in service.characteristics().await.map_err(connect_failed)? {
                let uuid = characteristic.uuid().await.map_err(connect_failed)?;
                if uuid == self.profile.write {
                    write = Some(characteristic);
                } else if uuid == self.profile.notify {
                    notify = Some(characteristic);
                }
            }

            return match (write, notify) {
                (Some(write), Some(notify)) => Ok((write, notify)),
                _ => Err(connect_failed("device is missing protocol characteristics")),
            };
        }

        Err(connect_failed(format!(
            "service {} not found",
            self.profile.service
        )))
    }
}

#[async_trait]
impl Connector for BluezConnector {
    async fn connect(&self, id: &DeviceIdentifier) -> Result<Link, TransportError> {
        let address: Address = id
            .as_str()
            .parse()
            .map_err(|e| connect_failed(format!("invalid address {id}: {e}")))?;
        let device = self.adapter.device(address).map_err(connect_failed)?;

        if !device.is_connected().await.map_err(connect_failed)? {
            info!("Connecting to {}...", id);
            tokio::time::timeout(self.connect_timeout, device.connect())
                .await
                .map_err(|_| connect_failed("connect timed out"))?
                .map_err(connect_failed)?;
        }

        self.wait_for_services(&device).await?;
        let (write, notify) = self.find_endpoints(&device).await?;

        let mtu = match write.mtu().await {
            Ok(mtu) => mtu,
            Err(e) => {
                warn!("MTU unavailable ({}), using {}", e, self.fallback_mtu);
                self.fallback_mtu
            }
        };

        let notifications = notify.notify().await.map_err(connect_failed)?;
        let device_events = device.events().await.map_err(connect_failed)?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let forwarder = tokio::spawn(forward_events(notifications, device_events, event_tx));

        info!("Connected to {} (MTU {})", id, mtu);

        let transport = Arc::new(BluezTransport {
            device,
            write,
            mtu,
            forwarder: Mutex::new(Some(forwarder)),
        });
        Ok(Link::new(transport, event_rx))
    }
}

/// Pump notifications and link-state changes into the link's event queue.
async fn forward_events(
    notifications: impl Stream<Item = Vec<u8>>,
    device_events: impl Stream<Item = DeviceEvent>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    futures::pin_mut!(notifications);
    futures::pin_mut!(device_events);
    let mut events_done = false;

    loop {
        tokio::select! {
            packet = notifications.next() => match packet {
                Some(packet) => {
                    debug!("Notification: {}", hex::encode(&packet));
                    if event_tx.send(TransportEvent::Packet(packet)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = event_tx
                        .send(TransportEvent::Disconnected {
                            reason: "notification stream ended".to_string(),
                        })
                        .await;
                    break;
                }
            },
            event = device_events.next(), if !events_done => match event {
                Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) => {
                    let _ = event_tx
                        .send(TransportEvent::Disconnected {
                            reason: "device disconnected".to_string(),
                        })
                        .await;
                    break;
                }
                Some(_) => {}
                None => events_done = true,
            },
        }
    }

    debug!("BlueZ event forwarder exited");
}

/// Outbound half of a BlueZ link.
struct BluezTransport {
    device: Device,
    write: Characteristic,
    mtu: usize,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Transport for BluezTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn send(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        self.write
            .write(&packet)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn disconnect(&self) {
        let forwarder = self.forwarder.lock().take();
        let Some(forwarder) = forwarder else {
            return;
        };
        forwarder.abort();

        if let Err(e) = self.device.disconnect().await {
            error!("Disconnect failed for {}: {}", self.device.address(), e);
        }
    }
}
