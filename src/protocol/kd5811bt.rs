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

//! KD5811BT frame codec.
//!
//! Two memory groups addressed by an explicit group byte; records carry the
//! user slot.

use std::time::Duration;

use super::frame::{self, Checksum, Envelope, PayloadReader, RecordLayout};
use super::{Command, DeviceFamily, FamilyDescriptor, FrameCodec, MemoryGroup, Response};
use crate::bluetooth::ble_constants::kd5811bt as gatt;
use crate::error::CodecError;

const ENVELOPE: Envelope = Envelope {
    start: 0xA0,
    checksum: Checksum::Sum,
};

const RECORD: RecordLayout = RecordLayout { with_user: true };

mod opcode {
    pub const SYNC_TIME: u8 = 0x10;
    pub const FUNCTION: u8 = 0x11;
    pub const MEMORY_COUNT: u8 = 0x12;
    pub const FETCH_PAGE: u8 = 0x13;
    pub const DELETE: u8 = 0x14;

    pub const FUNCTION_DATA: u8 = 0x91;
    pub const MEMORY_COUNT_DATA: u8 = 0x92;
    pub const PAGE_DATA: u8 = 0x93;
    pub const ACK: u8 = 0xF0;
    pub const NAK: u8 = 0xF1;
}

static DESCRIPTOR: FamilyDescriptor = FamilyDescriptor {
    family: DeviceFamily::Kd5811bt,
    groups: &[MemoryGroup::Group1, MemoryGroup::Group2],
    command_timeout: Duration::from_secs(5),
    page_size: 10,
    envelope: ENVELOPE,
    gatt: gatt::PROFILE,
};

/// Codec for the KD5811BT family.
#[derive(Debug, Clone, Copy, Default)]
pub struct Kd5811btCodec;

fn group_byte(group: MemoryGroup) -> Result<u8, CodecError> {
    match group {
        MemoryGroup::All => Err(CodecError::Unsupported("combined group addressing")),
        group => Ok(group.wire_id()),
    }
}

fn read_group(reader: &mut PayloadReader<'_>) -> Result<MemoryGroup, CodecError> {
    let id = reader.u8()?;
    match MemoryGroup::from_wire_id(id) {
        Some(MemoryGroup::All) | None => {
            Err(CodecError::InvalidPayload(format!("invalid group {id:#04x}")))
        }
        Some(group) => Ok(group),
    }
}

impl FrameCodec for Kd5811btCodec {
    fn descriptor(&self) -> &'static FamilyDescriptor {
        &DESCRIPTOR
    }

    fn encode_command(&self, command: &Command) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::new();
        let opcode = match command {
            Command::SyncTime(now) => {
                frame::put_datetime(&mut payload, now)?;
                opcode::SYNC_TIME
            }
            Command::QueryFunction => opcode::FUNCTION,
            Command::MemoryCount(group) => {
                payload.push(group_byte(*group)?);
                opcode::MEMORY_COUNT
            }
            Command::FetchPage { group, start, max } => {
                payload.push(group_byte(*group)?);
                frame::put_u16(&mut payload, *start);
                payload.push(*max);
                opcode::FETCH_PAGE
            }
            Command::DeleteMemory(group) => {
                payload.push(group_byte(*group)?);
                opcode::DELETE
            }
            Command::GetIdps => return Err(CodecError::Unsupported("IDPS query")),
            Command::Energy => return Err(CodecError::Unsupported("energy query")),
            Command::GetDeviceDate => return Err(CodecError::Unsupported("device date query")),
        };
        ENVELOPE.encode(opcode, &payload)
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<Response, CodecError> {
        let (op, payload) = ENVELOPE.decode(bytes)?;
        let mut reader = PayloadReader::new(payload);
        let response = match op {
            opcode::ACK => Response::Ack,
            opcode::NAK => Response::Nak { code: reader.u8()? },
            opcode::FUNCTION_DATA => Response::Capabilities(frame::read_capabilities(&mut reader)?),
            opcode::MEMORY_COUNT_DATA => Response::MemoryCount {
                group: read_group(&mut reader)?,
                count: reader.u16_le()?,
            },
            opcode::PAGE_DATA => {
                let group = read_group(&mut reader)?;
                let more = reader.bool()?;
                let n = reader.u8()? as usize;
                let records = (0..n)
                    .map(|_| RECORD.read(&mut reader))
                    .collect::<Result<Vec<_>, _>>()?;
                Response::Page {
                    group,
                    records,
                    more,
                }
            }
            other => return Err(CodecError::UnknownOpcode(other)),
        };
        reader.finish()?;
        Ok(response)
    }

    fn decode_command(&self, bytes: &[u8]) -> Result<Command, CodecError> {
        let (op, payload) = ENVELOPE.decode(bytes)?;
        let mut reader = PayloadReader::new(payload);
        let command = match op {
            opcode::SYNC_TIME => Command::SyncTime(reader.required_datetime()?),
            opcode::FUNCTION => Command::QueryFunction,
            opcode::MEMORY_COUNT => Command::MemoryCount(read_group(&mut reader)?),
            opcode::FETCH_PAGE => Command::FetchPage {
                group: read_group(&mut reader)?,
                start: reader.u16_le()?,
                max: reader.u8()?,
            },
            opcode::DELETE => Command::DeleteMemory(read_group(&mut reader)?),
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
            Response::Capabilities(caps) => {
                frame::put_capabilities(&mut payload, caps)?;
                opcode::FUNCTION_DATA
            }
            Response::MemoryCount { group, count } => {
                payload.push(group_byte(*group)?);
                frame::put_u16(&mut payload, *count);
                opcode::MEMORY_COUNT_DATA
            }
            Response::Page {
                group,
                records,
                more,
            } => {
                let n = u8::try_from(records.len()).map_err(|_| {
                    CodecError::InvalidPayload(format!("page too large: {}", records.len()))
                })?;
                payload.push(group_byte(*group)?);
                payload.push(*more as u8);
                payload.push(n);
                for record in records {
                    RECORD.put(&mut payload, record)?;
                }
                opcode::PAGE_DATA
            }
            Response::Idps(_) => return Err(CodecError::Unsupported("IDPS info")),
            Response::Energy(_) => return Err(CodecError::Unsupported("energy")),
            Response::DeviceDate(_) => return Err(CodecError::Unsupported("device date")),
        };
        ENVELOPE.encode(opcode, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OfflineRecord, RecordFlags};
    use chrono::NaiveDate;

    fn record(minute: u32, systolic: u16) -> OfflineRecord {
        OfflineRecord {
            measured_at: NaiveDate::from_ymd_opt(2024, 8, 19)
                .and_then(|d| d.and_hms_opt(8, minute, 0))
                .unwrap(),
            systolic,
            diastolic: 80,
            pulse: 66,
            user: 2,
            flags: RecordFlags {
                cuff_loose: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_memory_count_frame() {
        let codec = Kd5811btCodec;
        let frame = codec
            .encode_command(&Command::MemoryCount(MemoryGroup::Group2))
            .unwrap();
        assert_eq!(frame[0], 0xA0);
        assert_eq!(frame[3], opcode::MEMORY_COUNT);
        assert_eq!(frame[4], 0x01);
        assert_eq!(
            codec.decode_command(&frame).unwrap(),
            Command::MemoryCount(MemoryGroup::Group2)
        );
    }

    #[test]
    fn test_all_group_never_reaches_the_wire() {
        let codec = Kd5811btCodec;
        assert!(matches!(
            codec.encode_command(&Command::DeleteMemory(MemoryGroup::All)),
            Err(CodecError::Unsupported(_))
        ));
    }

    #[test]
    fn test_page_keeps_record_order() {
        let codec = Kd5811btCodec;
        let page = Response::Page {
            group: MemoryGroup::Group1,
            records: vec![record(1, 120), record(2, 135), record(3, 118)],
            more: true,
        };
        let frame = codec.encode_response(&page).unwrap();
        assert_eq!(frame.len(), 5 + 3 + 3 * RECORD.len());
        assert_eq!(codec.decode_response(&frame).unwrap(), page);
    }

    #[test]
    fn test_nak_and_unknown_opcode() {
        let codec = Kd5811btCodec;
        let nak = codec.encode_response(&Response::Nak { code: 0x07 }).unwrap();
        assert_eq!(
            codec.decode_response(&nak).unwrap(),
            Response::Nak { code: 0x07 }
        );

        let bogus = ENVELOPE.encode(0x55, &[]).unwrap();
        assert_eq!(
            codec.decode_response(&bogus),
            Err(CodecError::UnknownOpcode(0x55))
        );
    }

    #[test]
    fn test_kn550lt_only_commands_are_rejected() {
        let codec = Kd5811btCodec;
        assert!(codec.encode_command(&Command::Energy).is_err());
        assert!(codec.encode_command(&Command::GetIdps).is_err());
        assert!(codec.encode_command(&Command::GetDeviceDate).is_err());
    }

    #[test]
    fn test_trailing_bytes_are_protocol_errors() {
        let codec = Kd5811btCodec;
        let frame = ENVELOPE.encode(opcode::ACK, &[0x00]).unwrap();
        assert!(matches!(
            codec.decode_response(&frame),
            Err(CodecError::InvalidPayload(_))
        ));
    }
}
