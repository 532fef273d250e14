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

//! Bluetooth transport layer.
//!
//! Carries codec frames over BLE writes and notifications and hides the radio behind
//! the [`Transport`] trait.

pub mod ble_constants;
pub mod memory;
pub mod reassembler;
pub mod transport;

#[cfg(feature = "bluez")]
mod bluez;

#[cfg(feature = "bluez")]
pub use bluez::BluezConnector;
pub use memory::DevicePeer;
pub use reassembler::{split_frame, FrameAssembler};
pub use transport::{Connector, Link, Transport, TransportEvent};
