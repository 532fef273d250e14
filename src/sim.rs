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

//! Simulated blood-pressure monitor.
//!
//! Runs the device half of a family codec over an in-memory link so the
//! whole host stack can be exercised without hardware. Behavior can be
//! bent at runtime (silence, NAKs, truncated transfers, link loss).

use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bluetooth::memory::{self, DevicePeer};
use crate::bluetooth::{split_frame, FrameAssembler, Link};
use crate::protocol::{
    Command, DeviceCapabilities, FeatureFlags, FrameCodec, IdpsInfo, MemoryGroup,
    OfflineRecord, PressureUnit, RecordFlags, Response,
};

/// Initial contents of a simulated device.
#[derive(Debug, Clone)]
pub struct SimulatorProfile {
    pub capabilities: DeviceCapabilities,
    pub idps: IdpsInfo,
    pub battery: u8,
    pub group1: Vec<OfflineRecord>,
    pub group2: Vec<OfflineRecord>,
}

impl Default for SimulatorProfile {
    fn default() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                current_user: 1,
                user_slots: 2,
                unit: PressureUnit::MmHg,
                is_24_hour: true,
                memory_groups: 2,
                max_memory_capacity: 200,
                device_time: None,
                firmware_version: "1.0.3".to_string(),
                hardware_version: "A2".to_string(),
                features: FeatureFlags {
                    offline: true,
                    cuff_loose_detection: true,
                    body_movement_detection: true,
                    unit_setting: true,
                    ..Default::default()
                },
            },
            idps: IdpsInfo {
                protocol: "com.bplink.sim".to_string(),
                accessory_name: "Simulated Monitor".to_string(),
                firmware_version: "1.0.3".to_string(),
                hardware_version: "A2".to_string(),
                manufacturer: "bplink".to_string(),
                model_number: "SIM-1".to_string(),
                serial_number: "0000000001".to_string(),
            },
            battery: 87,
            group1: Vec::new(),
            group2: Vec::new(),
        }
    }
}

/// Deterministic measurement series for `user`, half an hour apart.
pub fn sample_records(count: usize, user: u8) -> Vec<OfflineRecord> {
    let base = NaiveDate::from_ymd_opt(2026, 3, 1)
        .and_then(|d| d.and_hms_opt(7, 30, 0))
        .unwrap_or_default();

    (0..count)
        .map(|i| OfflineRecord {
            measured_at: base + ChronoDuration::minutes(30 * i as i64),
            systolic: 112 + (i % 25) as u16,
            diastolic: 72 + (i % 12) as u8,
            pulse: 61 + (i % 20) as u8,
            user,
            flags: RecordFlags {
                irregular_heartbeat: i % 7 == 3,
                ..Default::default()
            },
        })
        .collect()
}

#[derive(Debug)]
struct SimState {
    capabilities: DeviceCapabilities,
    idps: IdpsInfo,
    battery: u8,
    clock: Option<NaiveDateTime>,
    group1: Vec<OfflineRecord>,
    group2: Vec<OfflineRecord>,
    silent: bool,
    /// Commands still answered before going silent.
    silent_after: Option<usize>,
    reject_next: Option<u8>,
    short_by: usize,
    commands: usize,
}

impl SimState {
    fn bank(&mut self, group: MemoryGroup) -> &mut Vec<OfflineRecord> {
        match group {
            MemoryGroup::Group2 => &mut self.group2,
            _ => &mut self.group1,
        }
    }

    /// Device-side reply to one command; `None` when staying silent.
    fn respond(&mut self, command: Command) -> Option<Response> {
        self.commands += 1;
        match self.silent_after {
            Some(0) => {
                self.silent = true;
                self.silent_after = None;
            }
            Some(left) => self.silent_after = Some(left - 1),
            None => {}
        }
        if self.silent {
            return None;
        }
        if let Some(code) = self.reject_next.take() {
            return Some(Response::Nak { code });
        }

        let response = match command {
            Command::SyncTime(now) => {
                self.clock = Some(now);
                Response::Ack
            }
            Command::QueryFunction => {
                let mut caps = self.capabilities.clone();
                caps.device_time = self.clock;
                Response::Capabilities(caps)
            }
            Command::MemoryCount(group) => Response::MemoryCount {
                group,
                count: self.bank(group).len().min(u16::MAX as usize) as u16,
            },
            Command::FetchPage { group, start, max } => {
                let short_by = self.short_by;
                let bank = self.bank(group);
                let available = bank.len().saturating_sub(short_by);
                let from = usize::from(start).min(available);
                let to = (from + usize::from(max)).min(available);
                Response::Page {
                    group,
                    records: bank[from..to].to_vec(),
                    more: to < available,
                }
            }
            Command::DeleteMemory(group) => {
                self.bank(group).clear();
                Response::Ack
            }
            Command::GetIdps => Response::Idps(self.idps.clone()),
            Command::Energy => Response::Energy(self.battery),
            Command::GetDeviceDate => {
                Response::DeviceDate(self.clock.unwrap_or_else(|| Local::now().naive_local()))
            }
        };
        Some(response)
    }
}

enum Control {
    Notify(Response, oneshot::Sender<()>),
    DropLink(String, oneshot::Sender<()>),
}

/// Handle to a running simulated device.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
    control: mpsc::Sender<Control>,
}

impl SimulatedDevice {
    /// Start a device for `codec` and return the host end of its link.
    pub fn spawn(
        codec: Arc<dyn FrameCodec>,
        profile: SimulatorProfile,
        mtu: usize,
    ) -> (Link, SimulatedDevice) {
        let (link, peer) = memory::pair(mtu);
        let state = Arc::new(Mutex::new(SimState {
            capabilities: profile.capabilities,
            idps: profile.idps,
            battery: profile.battery,
            clock: None,
            group1: profile.group1,
            group2: profile.group2,
            silent: false,
            silent_after: None,
            reject_next: None,
            short_by: 0,
            commands: 0,
        }));
        let (control_tx, control_rx) = mpsc::channel(8);

        info!("Simulated {} device started", codec.family());
        tokio::spawn(run(codec, peer, state.clone(), control_rx));

        (
            link,
            SimulatedDevice {
                state,
                control: control_tx,
            },
        )
    }

    /// Swallow commands without answering.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Answer `n` more commands, then stop answering.
    pub fn stall_after(&self, n: usize) {
        self.state.lock().silent_after = Some(n);
    }

    /// Answer the next command with a NAK carrying `code`.
    pub fn reject_next(&self, code: u8) {
        self.state.lock().reject_next = Some(code);
    }

    /// Report the full count but end transfers `n` records early.
    pub fn short_by(&self, n: usize) {
        self.state.lock().short_by = n;
    }

    /// Number of commands decoded so far, answered or not.
    pub fn commands_received(&self) -> usize {
        self.state.lock().commands
    }

    pub fn records(&self, group: MemoryGroup) -> Vec<OfflineRecord> {
        self.state.lock().bank(group).clone()
    }

    pub fn add_record(&self, group: MemoryGroup, record: OfflineRecord) {
        self.state.lock().bank(group).push(record);
    }

    pub fn battery(&self) -> u8 {
        self.state.lock().battery
    }

    pub fn set_battery(&self, level: u8) {
        self.state.lock().battery = level;
    }

    /// Time last pushed by the host.
    pub fn clock(&self) -> Option<NaiveDateTime> {
        self.state.lock().clock
    }

    /// Emit a frame nobody asked for. Returns once it is on the link.
    pub async fn push_unsolicited(&self, response: Response) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.control.send(Control::Notify(response, done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Simulate radio link loss.
    pub async fn drop_link(&self, reason: &str) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .control
            .send(Control::DropLink(reason.to_string(), done_tx))
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice").finish_non_exhaustive()
    }
}

async fn send_frame(codec: &dyn FrameCodec, peer: &DevicePeer, response: &Response) {
    let frame = match codec.encode_response(response) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Simulator cannot encode {}: {}", response.name(), e);
            return;
        }
    };
    for packet in split_frame(&frame, peer.mtu()) {
        if peer.notify(packet).await.is_err() {
            debug!("Host gone while notifying");
            return;
        }
    }
}

async fn run(
    codec: Arc<dyn FrameCodec>,
    mut peer: DevicePeer,
    state: Arc<Mutex<SimState>>,
    mut control: mpsc::Receiver<Control>,
) {
    let mut assembler = FrameAssembler::new(codec.descriptor().envelope);
    let mut control_open = true;

    loop {
        tokio::select! {
            biased;
            msg = control.recv(), if control_open => match msg {
                Some(Control::Notify(response, done)) => {
                    send_frame(codec.as_ref(), &peer, &response).await;
                    let _ = done.send(());
                }
                Some(Control::DropLink(reason, done)) => {
                    peer.drop_link(reason).await;
                    let _ = done.send(());
                    break;
                }
                None => control_open = false,
            },
            packet = peer.recv() => {
                let Some(packet) = packet else {
                    debug!("Host closed the simulated link");
                    break;
                };
                for frame in assembler.push(&packet) {
                    let command = match codec.decode_command(&frame) {
                        Ok(command) => command,
                        Err(e) => {
                            warn!("Simulator dropped bad frame: {}", e);
                            continue;
                        }
                    };
                    debug!("Simulator <- {}", command.name());
                    let response = state.lock().respond(command);
                    if let Some(response) = response {
                        send_frame(codec.as_ref(), &peer, &response).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Kd5811btCodec;

    async fn round_trip(link: &mut Link, codec: &dyn FrameCodec, command: &Command) -> Response {
        let frame = codec.encode_command(command).unwrap();
        for packet in split_frame(&frame, link.transport.mtu()) {
            link.transport.send(packet).await.unwrap();
        }
        let mut assembler = FrameAssembler::new(codec.descriptor().envelope);
        loop {
            match link.events.recv().await {
                Some(crate::bluetooth::TransportEvent::Packet(p)) => {
                    if let Some(frame) = assembler.push(&p).into_iter().next() {
                        return codec.decode_response(&frame).unwrap();
                    }
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn test_sample_records_are_ordered() {
        let records = sample_records(5, 2);
        assert_eq!(records.len(), 5);
        assert!(records.windows(2).all(|w| w[0].measured_at < w[1].measured_at));
        assert!(records.iter().all(|r| r.user == 2));
    }

    #[tokio::test]
    async fn test_pages_follow_storage_order() {
        let codec = Kd5811btCodec;
        let profile = SimulatorProfile {
            group1: sample_records(5, 1),
            ..Default::default()
        };
        let (mut link, device) = SimulatedDevice::spawn(Arc::new(codec), profile, 23);

        let response = round_trip(
            &mut link,
            &codec,
            &Command::FetchPage {
                group: MemoryGroup::Group1,
                start: 2,
                max: 2,
            },
        )
        .await;

        let stored = device.records(MemoryGroup::Group1);
        assert_eq!(
            response,
            Response::Page {
                group: MemoryGroup::Group1,
                records: stored[2..4].to_vec(),
                more: true,
            }
        );
    }

    #[tokio::test]
    async fn test_reject_next_only_once() {
        let codec = Kd5811btCodec;
        let (mut link, device) =
            SimulatedDevice::spawn(Arc::new(codec), SimulatorProfile::default(), 23);

        device.reject_next(0x02);
        assert_eq!(
            round_trip(&mut link, &codec, &Command::QueryFunction).await,
            Response::Nak { code: 0x02 }
        );
        assert!(matches!(
            round_trip(&mut link, &codec, &Command::QueryFunction).await,
            Response::Capabilities(_)
        ));
        assert_eq!(device.commands_received(), 2);
    }
}
