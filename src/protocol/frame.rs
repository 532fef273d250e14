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

//! Frame envelope and payload field layouts shared by the family codecs.
//!
//! ```text
//! ┌──────────┬─────────────┬──────────┬─────────────┬──────────┐
//! │ Start(1) │ Len(2, LE)  │ Opcode(1)│ Payload(..) │ Check(1) │
//! └──────────┴─────────────┴──────────┴─────────────┴──────────┘
//! ```
//!
//! `Len` counts the opcode plus payload. The check byte covers everything
//! between the start byte and itself.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use super::{DeviceCapabilities, FeatureFlags, OfflineRecord, PressureUnit, RecordFlags};
use crate::error::CodecError;

/// Envelope overhead: start, length, opcode, checksum.
pub const ENVELOPE_OVERHEAD: usize = 5;

/// Upper bound on a frame a device may send.
pub const MAX_FRAME_LEN: usize = 1024;

/// Size of an encoded calendar timestamp.
pub const DATETIME_LEN: usize = 6;

/// Checksum algorithm used by a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    /// Additive sum modulo 256.
    Sum,
    /// Running XOR.
    Xor,
}

impl Checksum {
    pub fn compute(&self, bytes: &[u8]) -> u8 {
        match self {
            Self::Sum => bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)),
            Self::Xor => bytes.iter().fold(0u8, |acc, b| acc ^ b),
        }
    }
}

/// Envelope parameters for one family.
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    pub start: u8,
    pub checksum: Checksum,
}

impl Envelope {
    /// Wrap an opcode and payload into a complete frame.
    pub fn encode(&self, opcode: u8, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        let len = payload.len() + 1;
        let len = u16::try_from(len)
            .map_err(|_| CodecError::InvalidPayload(format!("payload too large: {len} bytes")))?;

        let mut frame = Vec::with_capacity(payload.len() + ENVELOPE_OVERHEAD);
        frame.push(self.start);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.push(opcode);
        frame.extend_from_slice(payload);
        let check = self.checksum.compute(&frame[1..]);
        frame.push(check);
        Ok(frame)
    }

    /// Total length of the frame starting at `head[0]`.
    ///
    /// `Ok(None)` until the length field has arrived.
    pub fn frame_len(&self, head: &[u8]) -> Result<Option<usize>, CodecError> {
        match head.first() {
            None => return Ok(None),
            Some(&b) if b != self.start => return Err(CodecError::BadStart(b)),
            Some(_) => {}
        }
        if head.len() < 3 {
            return Ok(None);
        }
        let declared = u16::from_le_bytes([head[1], head[2]]) as usize;
        let total = declared + 4;
        if declared == 0 || total > MAX_FRAME_LEN {
            return Err(CodecError::BadLength(declared));
        }
        Ok(Some(total))
    }

    /// Validate a frame and split it into opcode and payload.
    pub fn decode<'a>(&self, frame: &'a [u8]) -> Result<(u8, &'a [u8]), CodecError> {
        if frame.len() < ENVELOPE_OVERHEAD {
            return Err(CodecError::Truncated {
                need: ENVELOPE_OVERHEAD,
                got: frame.len(),
            });
        }
        if frame[0] != self.start {
            return Err(CodecError::BadStart(frame[0]));
        }

        let declared = u16::from_le_bytes([frame[1], frame[2]]) as usize;
        let actual = frame.len() - 4;
        if declared != actual {
            return Err(CodecError::LengthMismatch { declared, actual });
        }

        let body_end = frame.len() - 1;
        let expected = self.checksum.compute(&frame[1..body_end]);
        let actual = frame[body_end];
        if expected != actual {
            return Err(CodecError::Checksum { expected, actual });
        }

        Ok((frame[3], &frame[4..body_end]))
    }
}

/// Sequential reader over a frame payload.
pub struct PayloadReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(CodecError::Truncated {
                need: end,
                got: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_le(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.u8()? != 0)
    }

    /// Six-byte calendar timestamp. All zero bytes mean "not set".
    pub fn datetime(&mut self) -> Result<Option<NaiveDateTime>, CodecError> {
        let b = self.take(DATETIME_LEN)?;
        if b.iter().all(|x| *x == 0) {
            return Ok(None);
        }
        NaiveDate::from_ymd_opt(2000 + b[0] as i32, b[1] as u32, b[2] as u32)
            .and_then(|d| d.and_hms_opt(b[3] as u32, b[4] as u32, b[5] as u32))
            .map(Some)
            .ok_or_else(|| CodecError::InvalidPayload(format!("invalid timestamp {}", hex::encode(b))))
    }

    pub fn required_datetime(&mut self) -> Result<NaiveDateTime, CodecError> {
        self.datetime()?
            .ok_or_else(|| CodecError::InvalidPayload("missing timestamp".to_string()))
    }

    /// Length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CodecError::InvalidPayload(format!("invalid UTF-8: {e}")))
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Fail if trailing bytes are left over.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::InvalidPayload(format!("{n} trailing bytes"))),
        }
    }
}

pub fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_datetime(buf: &mut Vec<u8>, value: &NaiveDateTime) -> Result<(), CodecError> {
    let year = value.year() - 2000;
    if !(0..=255).contains(&year) {
        return Err(CodecError::InvalidPayload(format!(
            "year {} out of range",
            value.year()
        )));
    }
    buf.extend_from_slice(&[
        year as u8,
        value.month() as u8,
        value.day() as u8,
        value.hour() as u8,
        value.minute() as u8,
        value.second() as u8,
    ]);
    Ok(())
}

pub fn put_optional_datetime(
    buf: &mut Vec<u8>,
    value: Option<&NaiveDateTime>,
) -> Result<(), CodecError> {
    match value {
        Some(value) => put_datetime(buf, value),
        None => {
            buf.extend_from_slice(&[0u8; DATETIME_LEN]);
            Ok(())
        }
    }
}

pub fn put_string(buf: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
    let len = u8::try_from(value.len())
        .map_err(|_| CodecError::InvalidPayload(format!("string too long: {}", value.len())))?;
    buf.push(len);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

pub fn put_capabilities(buf: &mut Vec<u8>, caps: &DeviceCapabilities) -> Result<(), CodecError> {
    buf.push(caps.current_user);
    buf.push(caps.user_slots);
    buf.push(match caps.unit {
        PressureUnit::MmHg => 0,
        PressureUnit::KPa => 1,
    });
    buf.push(caps.is_24_hour as u8);
    buf.push(caps.memory_groups);
    put_u16(buf, caps.max_memory_capacity);
    put_u16(buf, caps.features.to_bits());
    put_optional_datetime(buf, caps.device_time.as_ref())?;
    put_string(buf, &caps.firmware_version)?;
    put_string(buf, &caps.hardware_version)
}

pub fn read_capabilities(reader: &mut PayloadReader<'_>) -> Result<DeviceCapabilities, CodecError> {
    let current_user = reader.u8()?;
    let user_slots = reader.u8()?;
    let unit = match reader.u8()? {
        0 => PressureUnit::MmHg,
        1 => PressureUnit::KPa,
        other => {
            return Err(CodecError::InvalidPayload(format!("unknown unit {other}")));
        }
    };
    Ok(DeviceCapabilities {
        current_user,
        user_slots,
        unit,
        is_24_hour: reader.bool()?,
        memory_groups: reader.u8()?,
        max_memory_capacity: reader.u16_le()?,
        features: FeatureFlags::from_bits(reader.u16_le()?),
        device_time: reader.datetime()?,
        firmware_version: reader.string()?,
        hardware_version: reader.string()?,
    })
}

/// Record layout: timestamp, systolic (u16), diastolic, pulse, optional
/// user slot, flags.
#[derive(Debug, Clone, Copy)]
pub struct RecordLayout {
    pub with_user: bool,
}

impl RecordLayout {
    pub fn len(&self) -> usize {
        if self.with_user {
            DATETIME_LEN + 6
        } else {
            DATETIME_LEN + 5
        }
    }

    pub fn put(&self, buf: &mut Vec<u8>, record: &OfflineRecord) -> Result<(), CodecError> {
        put_datetime(buf, &record.measured_at)?;
        put_u16(buf, record.systolic);
        buf.push(record.diastolic);
        buf.push(record.pulse);
        if self.with_user {
            buf.push(record.user);
        }
        buf.push(record.flags.to_bits());
        Ok(())
    }

    pub fn read(&self, reader: &mut PayloadReader<'_>) -> Result<OfflineRecord, CodecError> {
        Ok(OfflineRecord {
            measured_at: reader.required_datetime()?,
            systolic: reader.u16_le()?,
            diastolic: reader.u8()?,
            pulse: reader.u8()?,
            user: if self.with_user { reader.u8()? } else { 1 },
            flags: RecordFlags::from_bits(reader.u8()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENVELOPE: Envelope = Envelope {
        start: 0xA0,
        checksum: Checksum::Sum,
    };

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 30)
            .and_then(|d| d.and_hms_opt(h, m, 13))
            .unwrap()
    }

    #[test]
    fn test_envelope_layout() {
        let frame = ENVELOPE.encode(0x12, &[0x01]).unwrap();
        // start, len=2, opcode, payload, sum(02 00 12 01)
        assert_eq!(frame, vec![0xA0, 0x02, 0x00, 0x12, 0x01, 0x15]);

        let (opcode, payload) = ENVELOPE.decode(&frame).unwrap();
        assert_eq!(opcode, 0x12);
        assert_eq!(payload, &[0x01]);
    }

    #[test]
    fn test_envelope_rejects_corruption() {
        let mut frame = ENVELOPE.encode(0x12, &[0x01]).unwrap();
        frame[4] = 0x02;
        assert!(matches!(
            ENVELOPE.decode(&frame),
            Err(CodecError::Checksum { .. })
        ));

        let frame = ENVELOPE.encode(0x12, &[0x01]).unwrap();
        assert!(matches!(
            ENVELOPE.decode(&frame[..frame.len() - 1]),
            Err(CodecError::LengthMismatch { .. })
        ));

        let mut wrong_start = frame.clone();
        wrong_start[0] = 0xB0;
        assert_eq!(ENVELOPE.decode(&wrong_start), Err(CodecError::BadStart(0xB0)));

        assert!(matches!(
            ENVELOPE.decode(&[0xA0, 0x01]),
            Err(CodecError::Truncated { need: 5, got: 2 })
        ));
    }

    #[test]
    fn test_frame_len_from_header() {
        let frame = ENVELOPE.encode(0x12, &[0x01, 0x02]).unwrap();
        assert_eq!(ENVELOPE.frame_len(&frame[..1]), Ok(None));
        assert_eq!(ENVELOPE.frame_len(&frame[..3]), Ok(Some(frame.len())));
        assert_eq!(ENVELOPE.frame_len(&[0xB0, 0x01]), Err(CodecError::BadStart(0xB0)));
        assert_eq!(
            ENVELOPE.frame_len(&[0xA0, 0x00, 0x00]),
            Err(CodecError::BadLength(0))
        );
        assert_eq!(
            ENVELOPE.frame_len(&[0xA0, 0x00, 0x10]),
            Err(CodecError::BadLength(0x1000))
        );
    }

    #[test]
    fn test_xor_checksum() {
        assert_eq!(Checksum::Xor.compute(&[0x0F, 0xF0, 0x01]), 0xFE);
        assert_eq!(Checksum::Sum.compute(&[0xFF, 0x02]), 0x01);
    }

    #[test]
    fn test_datetime_fields() {
        let mut buf = Vec::new();
        put_datetime(&mut buf, &at(16, 59)).unwrap();
        assert_eq!(buf, vec![24, 6, 30, 16, 59, 13]);

        let mut reader = PayloadReader::new(&buf);
        assert_eq!(reader.datetime().unwrap(), Some(at(16, 59)));
        reader.finish().unwrap();

        let mut unset = PayloadReader::new(&[0u8; 6]);
        assert_eq!(unset.datetime().unwrap(), None);

        let mut invalid = PayloadReader::new(&[24, 13, 1, 0, 0, 0]);
        assert!(invalid.datetime().is_err());
    }

    #[test]
    fn test_record_layout_without_user() {
        let layout = RecordLayout { with_user: false };
        let record = OfflineRecord {
            measured_at: at(8, 10),
            systolic: 128,
            diastolic: 82,
            pulse: 71,
            user: 1,
            flags: RecordFlags {
                irregular_heartbeat: true,
                ..Default::default()
            },
        };
        let mut buf = Vec::new();
        layout.put(&mut buf, &record).unwrap();
        assert_eq!(buf.len(), layout.len());

        let mut reader = PayloadReader::new(&buf);
        assert_eq!(layout.read(&mut reader).unwrap(), record);
    }

    #[test]
    fn test_reader_reports_truncation() {
        let mut reader = PayloadReader::new(&[0x01]);
        assert_eq!(
            reader.u16_le(),
            Err(CodecError::Truncated { need: 2, got: 1 })
        );

        let mut reader = PayloadReader::new(&[0x05, b'a', b'b']);
        assert!(reader.string().is_err());
    }
}
