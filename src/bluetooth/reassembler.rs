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

//! Carries codec frames across BLE writes and notifications.
//!
//! The monitors put raw frames on the wire, cut at the ATT payload size.
//! Frame boundaries come from the family envelope: a start byte followed by
//! a length field.

use tracing::{debug, warn};

use super::ble_constants::config;
use crate::error::CodecError;
use crate::protocol::frame::Envelope;

/// Rebuilds frames from a stream of notification payloads.
#[derive(Debug)]
pub struct FrameAssembler {
    envelope: Envelope,
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            buffer: Vec::with_capacity(256),
        }
    }

    /// Append one notification and return every frame it completes.
    pub fn push(&mut self, packet: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(packet);

        let mut frames = Vec::new();
        loop {
            match self.envelope.frame_len(&self.buffer) {
                Ok(Some(len)) if self.buffer.len() >= len => {
                    let frame: Vec<u8> = self.buffer.drain(..len).collect();
                    debug!("Frame assembled: {} bytes", frame.len());
                    frames.push(frame);
                }
                Ok(_) => break,
                Err(e) => self.resync(&e),
            }
        }
        frames
    }

    /// Skip to the next candidate start byte.
    fn resync(&mut self, cause: &CodecError) {
        let skip = self.buffer[1..]
            .iter()
            .position(|&b| b == self.envelope.start)
            .map_or(self.buffer.len(), |pos| pos + 1);
        warn!("Discarding {} bytes ({})", skip, cause);
        self.buffer.drain(..skip);
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes held for a frame that has not completed yet.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// Cut a frame into writes that fit one ATT payload.
pub fn split_frame(frame: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    frame
        .chunks(config::payload_size(mtu))
        .map(<[u8]>::to_vec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::Checksum;

    const ENVELOPE: Envelope = Envelope {
        start: 0xA0,
        checksum: Checksum::Sum,
    };

    fn frame(payload_len: usize) -> Vec<u8> {
        let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
        ENVELOPE.encode(0x21, &payload).unwrap()
    }

    #[test]
    fn test_single_notification_frame() {
        let mut assembler = FrameAssembler::new(ENVELOPE);
        let ack = frame(1);

        assert_eq!(assembler.push(&ack), vec![ack]);
        assert_eq!(assembler.pending_bytes(), 0);
    }

    #[test]
    fn test_frame_spread_over_notifications() {
        let mut assembler = FrameAssembler::new(ENVELOPE);
        let long = frame(60);
        let packets = split_frame(&long, config::DEFAULT_MTU);
        assert_eq!(packets.len(), 4);

        let (last, rest) = packets.split_last().unwrap();
        for packet in rest {
            assert!(assembler.push(packet).is_empty());
        }
        assert_eq!(assembler.push(last), vec![long]);
    }

    #[test]
    fn test_length_field_split_across_notifications() {
        let mut assembler = FrameAssembler::new(ENVELOPE);
        let full = frame(3);

        assert!(assembler.push(&full[..2]).is_empty());
        assert_eq!(assembler.pending_bytes(), 2);
        assert_eq!(assembler.push(&full[2..]), vec![full]);
    }

    #[test]
    fn test_back_to_back_frames_in_one_notification() {
        let mut assembler = FrameAssembler::new(ENVELOPE);
        let first = frame(2);
        let second = frame(5);
        let joined = [first.clone(), second.clone()].concat();

        assert_eq!(assembler.push(&joined), vec![first, second]);
    }

    #[test]
    fn test_leading_noise_is_skipped() {
        let mut assembler = FrameAssembler::new(ENVELOPE);
        let good = frame(4);
        let mut noisy = vec![0x13, 0x37];
        noisy.extend_from_slice(&good);

        assert_eq!(assembler.push(&noisy), vec![good]);
    }

    #[test]
    fn test_implausible_length_resyncs() {
        let mut assembler = FrameAssembler::new(ENVELOPE);
        let good = frame(1);
        let mut stream = vec![0xA0, 0xFF, 0xFF];
        stream.extend_from_slice(&good);

        assert_eq!(assembler.push(&stream), vec![good]);
        assert_eq!(assembler.pending_bytes(), 0);
    }

    #[test]
    fn test_reset_drops_partial_frame() {
        let mut assembler = FrameAssembler::new(ENVELOPE);
        let long = frame(40);
        assert!(assembler.push(&long[..10]).is_empty());

        assembler.reset();
        assert_eq!(assembler.pending_bytes(), 0);

        let next = frame(1);
        assert_eq!(assembler.push(&next), vec![next]);
    }

    #[test]
    fn test_split_uses_att_payload() {
        let long = frame(400);
        let packets = split_frame(&long, 185);

        assert!(packets.iter().all(|p| p.len() <= 182));
        assert_eq!(packets.concat(), long);
        assert!(split_frame(&[], 23).is_empty());
    }
}
