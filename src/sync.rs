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

//! Offline data sync: count, transfer, then optionally delete.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SessionResult;
use crate::protocol::{DeviceFamily, DeviceIdentifier, MemoryGroup, OfflineRecord};
use crate::session::CommandSession;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Erase the group once every counted record arrived.
    pub delete_after_transfer: bool,
}

/// Outcome of one [`sync_offline`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub device: DeviceIdentifier,
    pub family: DeviceFamily,
    pub group: MemoryGroup,
    pub count: u32,
    pub records: Vec<OfflineRecord>,
    pub deleted: bool,
}

/// Pull all offline records of `group` from the device.
pub async fn sync_offline(
    session: &CommandSession,
    group: MemoryGroup,
    options: SyncOptions,
) -> SessionResult<SyncReport> {
    let count = session.get_memory_count(group).await?;
    let records = session.transfer_memory_data(group).await?;

    let complete = records.len() == count as usize;
    let deleted = if options.delete_after_transfer && complete && count > 0 {
        session.delete_memory_data(group).await?;
        true
    } else {
        false
    };

    info!(
        "Synced {} records from {} ({:?}), deleted: {}",
        records.len(),
        session.id(),
        group,
        deleted
    );

    Ok(SyncReport {
        device: session.id().clone(),
        family: session.family(),
        group,
        count,
        records,
        deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::protocol::codec_for;
    use crate::session::SessionConfig;
    use crate::sim::{sample_records, SimulatedDevice, SimulatorProfile};
    use std::sync::Arc;

    fn start(family: DeviceFamily, profile: SimulatorProfile) -> (Arc<CommandSession>, SimulatedDevice) {
        let codec = codec_for(family);
        let config = SessionConfig::for_family(codec.descriptor());
        let (link, device) = SimulatedDevice::spawn(codec.clone(), profile, 23);
        let session = CommandSession::start(DeviceIdentifier::from("dev"), codec, link, config, None);
        (session, device)
    }

    #[tokio::test]
    async fn test_sync_keeps_records_by_default() {
        let profile = SimulatorProfile {
            group1: sample_records(3, 1),
            ..Default::default()
        };
        let (session, device) = start(DeviceFamily::Kd5811bt, profile);

        let report = sync_offline(&session, MemoryGroup::Group1, SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(report.count, 3);
        assert_eq!(report.records, device.records(MemoryGroup::Group1));
        assert!(!report.deleted);
    }

    #[tokio::test]
    async fn test_sync_deletes_after_complete_transfer() {
        let profile = SimulatorProfile {
            group1: sample_records(20, 1),
            ..Default::default()
        };
        let (session, device) = start(DeviceFamily::Kn550lt, profile);
        let options = SyncOptions {
            delete_after_transfer: true,
        };

        let report = sync_offline(&session, MemoryGroup::Group1, options).await.unwrap();

        assert_eq!(report.records.len(), 20);
        assert!(report.deleted);
        assert!(device.records(MemoryGroup::Group1).is_empty());
    }

    #[tokio::test]
    async fn test_short_transfer_never_deletes() {
        let profile = SimulatorProfile {
            group1: sample_records(4, 1),
            ..Default::default()
        };
        let (session, device) = start(DeviceFamily::Kd5811bt, profile);
        device.short_by(1);

        let result = sync_offline(
            &session,
            MemoryGroup::Group1,
            SyncOptions {
                delete_after_transfer: true,
            },
        )
        .await;

        assert!(matches!(result, Err(SessionError::ShortTransfer { .. })));
        assert_eq!(device.records(MemoryGroup::Group1).len(), 4);
    }
}
