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

//! BLE service and characteristic UUIDs for the supported monitors.

use uuid::Uuid;

use crate::protocol::GattProfile;

/// KD5811BT GATT endpoints.
pub mod kd5811bt {
    use super::*;

    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x636f6d2e_6a69_7561_6e2e_425056323530);

    /// Host writes command packets here.
    /// Properties: Write, Write Without Response
    pub const WRITE_UUID: Uuid = Uuid::from_u128(0x7365642e_6a69_7561_6e2e_425056323530);

    /// Device notifies response packets here.
    /// Properties: Notify
    pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x7265632e_6a69_7561_6e2e_425056323530);

    pub const PROFILE: GattProfile = GattProfile {
        service: SERVICE_UUID,
        write: WRITE_UUID,
        notify: NOTIFY_UUID,
    };
}

/// KN550LT GATT endpoints.
pub mod kn550lt {
    use super::*;

    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x636f6d2e_6a69_7561_6e2e_425056333120);

    /// Properties: Write, Write Without Response
    pub const WRITE_UUID: Uuid = Uuid::from_u128(0x7365642e_6a69_7561_6e2e_425056333120);

    /// Properties: Notify
    pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x7265632e_6a69_7561_6e2e_425056333120);

    pub const PROFILE: GattProfile = GattProfile {
        service: SERVICE_UUID,
        write: WRITE_UUID,
        notify: NOTIFY_UUID,
    };
}

/// BLE configuration constants.
pub mod config {
    /// Default MTU (minimum for all BLE devices).
    pub const DEFAULT_MTU: usize = 23;

    /// ATT protocol overhead (3 bytes).
    pub const ATT_OVERHEAD: usize = 3;

    /// Frame bytes that fit one write or notification.
    ///
    /// MTUs below the BLE minimum are treated as the minimum.
    pub fn payload_size(mtu: usize) -> usize {
        mtu.max(DEFAULT_MTU) - ATT_OVERHEAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_are_distinct() {
        assert_ne!(kd5811bt::SERVICE_UUID, kn550lt::SERVICE_UUID);
        assert_ne!(kd5811bt::PROFILE.write, kd5811bt::PROFILE.notify);
        assert_eq!(
            kd5811bt::SERVICE_UUID.to_string(),
            "636f6d2e-6a69-7561-6e2e-425056323530"
        );
    }

    #[test]
    fn test_payload_size() {
        assert_eq!(config::payload_size(23), 20);
        assert_eq!(config::payload_size(185), 182);

        // Below the minimum is clamped
        assert_eq!(config::payload_size(5), 20);
    }
}
