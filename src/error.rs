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

//! Error types shared by the codec, transport and session layers.

use std::time::Duration;
use thiserror::Error;

use crate::protocol::{DeviceFamily, DeviceIdentifier};

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("unexpected start byte {0:#04x}")]
    BadStart(u8),

    #[error("declared length {declared} does not match frame length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("implausible frame length {0}")]
    BadLength(usize),

    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0} is not supported by this device family")]
    Unsupported(&'static str),
}

/// Errors raised by a transport channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("link lost: {0}")]
    LinkLost(String),
}

/// Errors delivered to the caller of a session command.
///
/// Every command completes with exactly one `Ok` or one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Link lost or a send failed. Always ends the session.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No correlated response arrived before the deadline.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The device answered with an explicit NAK.
    #[error("device rejected the command (code {code:#04x})")]
    DeviceRejected { code: u8 },

    /// Malformed, mismatched or unsolicited frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Another command is already in flight on this session.
    #[error("another command is in flight")]
    Busy,

    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Device signalled completion before the queried count was reached.
    #[error("short transfer: expected {expected} records, received {received}")]
    ShortTransfer { expected: usize, received: usize },

    /// The session is disconnected; the transport was not touched.
    #[error("session closed")]
    Closed,

    /// The command was cancelled by a local disconnect.
    #[error("command cancelled")]
    Cancelled,

    /// The handle outlived its session.
    #[error("device {0} is gone")]
    Gone(DeviceIdentifier),

    #[error("{what} is not supported by {family}")]
    Unsupported {
        what: &'static str,
        family: DeviceFamily,
    },
}

impl SessionError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Closed | Self::Gone(_))
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result alias for session commands.
pub type SessionResult<T> = Result<T, SessionError>;
