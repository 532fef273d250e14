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

//! Device command protocol: typed commands, responses and the per-family
//! frame codecs.

pub mod frame;
pub mod kd5811bt;
pub mod kn550lt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::CodecError;

pub use kd5811bt::Kd5811btCodec;
pub use kn550lt::Kn550ltCodec;

/// MAC address or serial number of one physical device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentifier(String);

impl DeviceIdentifier {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentifier {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceIdentifier {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Supported device families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    Kd5811bt,
    Kn550lt,
}

impl DeviceFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kd5811bt => "KD5811BT",
            Self::Kn550lt => "KN550LT",
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "KD5811BT" => Ok(Self::Kd5811bt),
            "KN550LT" => Ok(Self::Kn550lt),
            other => Err(format!("unknown device family: {other}")),
        }
    }
}

/// Logical bank of on-device offline storage.
///
/// `All` only exists at request time; the device never reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryGroup {
    Group1,
    Group2,
    All,
}

impl MemoryGroup {
    /// Wire identifier used by families that address groups explicitly.
    pub fn wire_id(&self) -> u8 {
        match self {
            Self::Group1 => 0x00,
            Self::Group2 => 0x01,
            Self::All => 0xFE,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0x00 => Some(Self::Group1),
            0x01 => Some(Self::Group2),
            0xFE => Some(Self::All),
            _ => None,
        }
    }

    /// Concrete groups addressed by this request, in group-number order.
    pub fn expand(self, supported: &[MemoryGroup]) -> Vec<MemoryGroup> {
        match self {
            Self::All => supported
                .iter()
                .copied()
                .filter(|g| *g != Self::All)
                .collect(),
            group => vec![group],
        }
    }
}

impl FromStr for MemoryGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1" | "group1" => Ok(Self::Group1),
            "2" | "group2" => Ok(Self::Group2),
            "all" => Ok(Self::All),
            other => Err(format!("unknown memory group: {other}")),
        }
    }
}

/// Display unit configured on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PressureUnit {
    MmHg,
    KPa,
}

/// Feature flags reported by the capability query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub offline: bool,
    pub cuff_loose_detection: bool,
    pub body_movement_detection: bool,
    pub angle_sensor: bool,
    pub angle_setting: bool,
    pub self_update: bool,
    pub arm_measure: bool,
    pub up_air_measure: bool,
    pub unit_setting: bool,
    pub mutable_upload: bool,
    pub backlight_setting: bool,
    pub clock_display_setting: bool,
    pub repeated_measure: bool,
    pub hsd: bool,
}

impl FeatureFlags {
    pub fn to_bits(&self) -> u16 {
        [
            self.offline,
            self.cuff_loose_detection,
            self.body_movement_detection,
            self.angle_sensor,
            self.angle_setting,
            self.self_update,
            self.arm_measure,
            self.up_air_measure,
            self.unit_setting,
            self.mutable_upload,
            self.backlight_setting,
            self.clock_display_setting,
            self.repeated_measure,
            self.hsd,
        ]
        .iter()
        .enumerate()
        .fold(0u16, |bits, (i, set)| if *set { bits | (1 << i) } else { bits })
    }

    pub fn from_bits(bits: u16) -> Self {
        let bit = |i: u16| bits & (1 << i) != 0;
        Self {
            offline: bit(0),
            cuff_loose_detection: bit(1),
            body_movement_detection: bit(2),
            angle_sensor: bit(3),
            angle_setting: bit(4),
            self_update: bit(5),
            arm_measure: bit(6),
            up_air_measure: bit(7),
            unit_setting: bit(8),
            mutable_upload: bit(9),
            backlight_setting: bit(10),
            clock_display_setting: bit(11),
            repeated_measure: bit(12),
            hsd: bit(13),
        }
    }
}

/// Capability snapshot returned by the function query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub current_user: u8,
    pub user_slots: u8,
    pub unit: PressureUnit,
    pub is_24_hour: bool,
    pub memory_groups: u8,
    pub max_memory_capacity: u16,
    pub device_time: Option<NaiveDateTime>,
    pub firmware_version: String,
    pub hardware_version: String,
    pub features: FeatureFlags,
}

/// Per-record status bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFlags {
    pub irregular_heartbeat: bool,
    pub body_movement: bool,
    pub cuff_loose: bool,
}

impl RecordFlags {
    pub fn to_bits(&self) -> u8 {
        (self.irregular_heartbeat as u8)
            | (self.body_movement as u8) << 1
            | (self.cuff_loose as u8) << 2
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            irregular_heartbeat: bits & 0x01 != 0,
            body_movement: bits & 0x02 != 0,
            cuff_loose: bits & 0x04 != 0,
        }
    }
}

/// One measurement stored in device memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineRecord {
    pub measured_at: NaiveDateTime,
    pub systolic: u16,
    pub diastolic: u8,
    pub pulse: u8,
    pub user: u8,
    pub flags: RecordFlags,
}

/// Identification block reported by KN550LT devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdpsInfo {
    pub protocol: String,
    pub accessory_name: String,
    pub firmware_version: String,
    pub hardware_version: String,
    pub manufacturer: String,
    pub model_number: String,
    pub serial_number: String,
}

/// Host-to-device command.
///
/// Memory commands always name a concrete group; the session expands
/// [`MemoryGroup::All`] before anything reaches a codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SyncTime(NaiveDateTime),
    QueryFunction,
    MemoryCount(MemoryGroup),
    FetchPage {
        group: MemoryGroup,
        start: u16,
        max: u8,
    },
    DeleteMemory(MemoryGroup),
    GetIdps,
    Energy,
    GetDeviceDate,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SyncTime(_) => "sync time",
            Self::QueryFunction => "function query",
            Self::MemoryCount(_) => "memory count",
            Self::FetchPage { .. } => "memory page fetch",
            Self::DeleteMemory(_) => "memory delete",
            Self::GetIdps => "IDPS query",
            Self::Energy => "energy query",
            Self::GetDeviceDate => "device date query",
        }
    }
}

/// Device-to-host frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack,
    Nak { code: u8 },
    Capabilities(DeviceCapabilities),
    MemoryCount { group: MemoryGroup, count: u16 },
    Page {
        group: MemoryGroup,
        records: Vec<OfflineRecord>,
        more: bool,
    },
    Idps(IdpsInfo),
    Energy(u8),
    DeviceDate(NaiveDateTime),
}

impl Response {
    /// Whether this frame is a valid answer to `command`.
    pub fn answers(&self, command: &Command) -> bool {
        match (self, command) {
            (Self::Nak { .. }, _) => true,
            (Self::Ack, Command::SyncTime(_) | Command::DeleteMemory(_)) => true,
            (Self::Capabilities(_), Command::QueryFunction) => true,
            (Self::MemoryCount { group, .. }, Command::MemoryCount(asked)) => group == asked,
            (Self::Page { group, .. }, Command::FetchPage { group: asked, .. }) => group == asked,
            (Self::Idps(_), Command::GetIdps) => true,
            (Self::Energy(_), Command::Energy) => true,
            (Self::DeviceDate(_), Command::GetDeviceDate) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ack => "ACK",
            Self::Nak { .. } => "NAK",
            Self::Capabilities(_) => "capabilities",
            Self::MemoryCount { .. } => "memory count",
            Self::Page { .. } => "memory page",
            Self::Idps(_) => "IDPS info",
            Self::Energy(_) => "energy",
            Self::DeviceDate(_) => "device date",
        }
    }
}

/// GATT endpoints used by a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

/// Static facts about one device family.
#[derive(Debug)]
pub struct FamilyDescriptor {
    pub family: DeviceFamily,
    pub groups: &'static [MemoryGroup],
    pub command_timeout: Duration,
    pub page_size: u8,
    pub envelope: frame::Envelope,
    pub gatt: GattProfile,
}

/// Encodes and decodes the frames of one device family.
///
/// Host side uses `encode_command`/`decode_response`; the device side
/// (simulator) uses `decode_command`/`encode_response`.
pub trait FrameCodec: Send + Sync + fmt::Debug {
    fn descriptor(&self) -> &'static FamilyDescriptor;

    fn encode_command(&self, command: &Command) -> Result<Vec<u8>, CodecError>;

    fn decode_response(&self, frame: &[u8]) -> Result<Response, CodecError>;

    fn decode_command(&self, frame: &[u8]) -> Result<Command, CodecError>;

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>, CodecError>;

    fn family(&self) -> DeviceFamily {
        self.descriptor().family
    }
}

/// Codec instance for a family.
pub fn codec_for(family: DeviceFamily) -> Arc<dyn FrameCodec> {
    match family {
        DeviceFamily::Kd5811bt => Arc::new(Kd5811btCodec),
        DeviceFamily::Kn550lt => Arc::new(Kn550ltCodec),
    }
}
