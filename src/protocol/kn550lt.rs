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

//! KN550LT frame codec.
//!
//! Single implicit memory group, no group byte on the wire. Adds the IDPS,
//! battery and device clock queries.

use std::time::Duration;

use super::frame::{self, Checksum, Envelope, PayloadReader, RecordLayout};
use super::{Command, DeviceFamily, FamilyDescriptor, FrameCodec, IdpsInfo, MemoryGroup, Response};
use crate::bluetooth::ble_constants::kn550lt as gatt;
use crate::error::CodecError;

const ENVELOPE: Envelope = Envelope {
    start: 0xB0,
    checksum: Checksum::Xor,
};

const RECORD: RecordLayout = RecordLayout { with_user: false };

/// The only group this family stores records in.
pub const DEFAULT_GROUP: MemoryGroup = MemoryGroup::Group1;

mod opcode {
    pub const IDPS: u8 = 0x20;
    pub const ENERGY: u8 = 0x21;
    pub const FUNCTION: u8 = 0x22;
    pub const MEMORY_COUNT: u8 = 0x23;
    pub const FETCH_PAGE: u8 = 0x24;
    pub const DELETE: u8 = 0x25;
    pub const DEVICE_DATE: u8 = 0x26;
    pub const SYNC_TIME: u8 = 0x27;

    pub const IDPS_DATA: u8 = 0xA0;
    pub const ENERGY_DATA: u8 = 0xA1;
    pub const FUNCTION_DATA: u8 = 0xA2;
    pub const MEMORY_COUNT_DATA: u8 = 0xA3;
    pub const PAGE_DATA: u8 = 0xA4;
    pub const DEVICE_DATE_DATA: u8 = 0xA6;
    pub const ACK: u8 = 0xE0;
    pub const NAK: u8 = 0xE1;
}

static DESCRIPTOR: FamilyDescriptor = FamilyDescriptor {
    family: DeviceFamily::Kn550lt,
    groups: &[DEFAULT_GROUP],
    command_timeout: Duration::from_secs(4),
    page_size: 16,
    envelope: ENVELOPE,
    gatt: gatt::PROFILE,
};

/// Codec for the KN550LT family.
#[derive(Debug, Clone, Copy, Default)]
pub struct Kn550ltCodec;

fn require_default(group: MemoryGroup) -> Result<(), CodecError> {
    if group == DEFAULT_GROUP {
        Ok(())
    } else {
        Err(CodecError::Unsupported("memory groups other than the default"))
    }
}

impl FrameCodec for Kn550ltCodec {
    fn descriptor(&self) -> &'static FamilyDescriptor {
        &DESCRIPTOR
    }

    fn encode_command(&self, command: &Command) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::new();
        let opcode = match command {
            Command::GetIdps => opcode::IDPS,
            Command::Energy => opcode::ENERGY,
            Command::QueryFunction => opcode::FUNCTION,
            Command::GetDeviceDate => opcode::DEVICE_DATE,
            Command::SyncTime(now) => {
                frame::put_datetime(&mut payload, now)?;
                opcode::SYNC_TIME
            }
            Command::MemoryCount(group) => {
                require_default(*group)?;
                opcode::MEMORY_COUNT
            }
            Command::FetchPage { group, start, max } => {
                require_default(*group)?;
                frame::put_u16(&mut payload, *start);
                payload.push(*max);
                opcode::FETCH_PAGE
            }
            Command::DeleteMemory(group) => {
                require_default(*group)?;
                opcode::DELETE
            }
        };
        ENVELOPE.encode(opcode, &payload)
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<Response, CodecError> {
        let (op, payload) = ENVELOPE.decode(bytes)?;
        let mut reader = PayloadReader::new(payload);
        let response = match op {
            opcode::ACK => Response::Ack,
            opcode::NAK => Response::Nak { code: reader.u8()? },
            opcode::IDPS_DATA => Response::Idps(IdpsInfo {
                protocol: reader.string()?,
                accessory_name: reader.string()?,
                firmware_version: reader.string()?,
                hardware_version: reader.string()?,
                manufacturer: reader.string()?,
                model_number: reader.string()?,
                serial_number: reader.string()?,
            }),
            opcode::ENERGY_DATA => {
                let level = reader.u8()?;
                if level > 100 {
                    return Err(CodecError::InvalidPayload(format!(
                        "battery level {level} out of range"
                    )));
                }
                Response::Energy(level)
            }
            opcode::FUNCTION_DATA => Response::Capabilities(frame::read_capabilities(&mut reader)?),
            opcode::MEMORY_COUNT_DATA => Response::MemoryCount {
                group: DEFAULT_GROUP,
                count: reader.u16_le()?,
            },
            opcode::PAGE_DATA => {
                let more = reader.bool()?;
                let n = reader.u8()? as usize;
                let records = (0..n)
                    .map(|_| RECORD.read(&mut reader))
                    .collect::<Result<Vec<_>, _>>()?;
                Response::Page {
                    group: DEFAULT_GROUP,
                    records,
                    more,
                }
            }
            opcode::DEVICE_DATE_DATA => Response::DeviceDate(reader.required_datetime()?),
            other => return Err(CodecError::UnknownOpcode(other)),
        };
        reader.finish()?;
        Ok(response)
    }

    fn decode_command(&self, bytes: &[u8]) -> Result<Command, CodecError> {
        let (op, payload) = ENVELOPE.decode(bytes)?;
        let mut reader = PayloadReader::new(payload);
        let command = match op {
            opcode::IDPS => Command::GetIdps,
            opcode::ENERGY => Command::Energy,
            opcode::FUNCTION => Command::QueryFunction,
            opcode::DEVICE_DATE => Command::GetDeviceDate,
            opcode::SYNC_TIME => Command::SyncTime(reader.required_datetime()?),
            opcode::MEMORY_COUNT => Command::MemoryCount(DEFAULT_GROUP),
            opcode::FETCH_PAGE => Command::FetchPage {
                group: DEFAULT_GROUP,
                start: reader.u16_le()?,
                max: reader.u8()?,
            },
            opcode::DELETE => Command::DeleteMemory(DEFAULT_GROUP),
            other => return Err(CodecError::UnknownOpcode(other)),
        };
        reader.finish()?;
        Ok(command)
    }

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::new();
        let opcode = match response {
            Response::Ack => opcode::ACK,
            Response::Nak { code } => {
                payload.push(*code);
                opcode::NAK
            }
            Response::Idps(info) => {
                for field in [
                    &info.protocol,
                    &info.accessory_name,
                    &info.firmware_version,
                    &info.hardware_version,
                    &info.manufacturer,
                    &info.model_number,
                    &info.serial_number,
                ] {
                    frame::put_string(&mut payload, field)?;
                }
                opcode::IDPS_DATA
            }
            Response::Energy(level) => {
                payload.push(*level);
                opcode::ENERGY_DATA
            }
            Response::Capabilities(caps) => {
                frame::put_capabilities(&mut payload, caps)?;
                opcode::FUNCTION_DATA
            }
            Response::MemoryCount { group, count } => {
                require_default(*group)?;
                frame::put_u16(&mut payload, *count);
                opcode::MEMORY_COUNT_DATA
            }
            Response::Page {
                group,
                records,
                more,
            } => {
                require_default(*group)?;
                let n = u8::try_from(records.len()).map_err(|_| {
                    CodecError::InvalidPayload(format!("page too large: {}", records.len()))
                })?;
                payload.push(*more as u8);
                payload.push(n);
                for record in records {
                    RECORD.put(&mut payload, record)?;
                }
                opcode::PAGE_DATA
            }
            Response::DeviceDate(date) => {
                frame::put_datetime(&mut payload, date)?;
                opcode::DEVICE_DATE_DATA
            }
        };
        ENVELOPE.encode(opcode, &payload)
    }
}
