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

//! Command protocol engine for Bluetooth blood-pressure monitors.
//!
//! A [`CommandSession`] drives one connected device through its
//! request/response protocol; a [`DeviceRegistry`] per family tracks the
//! live sessions. [`Kd5811bt`] and [`Kn550lt`] are the family-specific
//! front ends.

pub mod bluetooth;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod sim;
pub mod sync;

pub use device::{Controller, Kd5811bt, Kd5811btController, Kn550lt, Kn550ltController};
pub use error::{CodecError, SessionError, SessionResult, TransportError};
pub use events::RegistryEvent;
pub use protocol::{
    DeviceCapabilities, DeviceFamily, DeviceIdentifier, IdpsInfo, MemoryGroup, OfflineRecord,
};
pub use registry::{share_controller, DeviceHandle, DeviceRegistry};
pub use session::{CommandSession, SessionConfig, SessionState};
pub use sync::{sync_offline, SyncOptions, SyncReport};
