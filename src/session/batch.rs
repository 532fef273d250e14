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

//! Paged retrieval of offline records.

use tracing::{debug, info, warn};

use super::{unexpected, CommandSession};
use crate::error::{SessionError, SessionResult};
use crate::protocol::{Command, MemoryGroup, OfflineRecord, Response};

/// Pull every record counted for `group`.
///
/// The session is held exclusively for the whole transfer. Any failure
/// aborts it and no partial result is returned.
pub(super) async fn transfer(
    session: &CommandSession,
    group: MemoryGroup,
) -> SessionResult<Vec<OfflineRecord>> {
    let groups = session.concrete_groups(group)?;
    let _exclusive = session.begin_exclusive()?;

    let plan = groups
        .into_iter()
        .map(|g| {
            session
                .cached_count(g)
                .map(|count| (g, usize::from(count)))
                .ok_or_else(|| {
                    SessionError::Precondition(format!(
                        "memory count for {g:?} must be queried before transfer"
                    ))
                })
        })
        .collect::<SessionResult<Vec<_>>>()?;

    let total: usize = plan.iter().map(|(_, count)| count).sum();
    if total == 0 {
        debug!("No offline records on {}", session.id());
        return Ok(Vec::new());
    }

    let mut records = Vec::with_capacity(total);
    for (group, expected) in plan {
        if expected == 0 {
            continue;
        }
        match fetch_group(session, group, expected).await {
            Ok(batch) => records.extend(batch),
            Err(SessionError::ShortTransfer { received, .. }) => {
                return Err(SessionError::ShortTransfer {
                    expected: total,
                    received: records.len() + received,
                });
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        "Transferred {} offline records from {}",
        records.len(),
        session.id()
    );
    Ok(records)
}

async fn fetch_group(
    session: &CommandSession,
    group: MemoryGroup,
    expected: usize,
) -> SessionResult<Vec<OfflineRecord>> {
    let page_size = usize::from(session.config().page_size.max(1));
    let mut received: Vec<OfflineRecord> = Vec::with_capacity(expected);

    loop {
        let start = u16::try_from(received.len())
            .map_err(|_| SessionError::Protocol("record index out of range".to_string()))?;
        let max = (expected - received.len()).min(page_size) as u8;

        let command = Command::FetchPage { group, start, max };
        let (records, more) = match session.exchange(command.clone(), true).await? {
            Response::Page { records, more, .. } => (records, more),
            other => return Err(unexpected(&other, &command)),
        };

        if records.len() > usize::from(max) {
            return Err(SessionError::Protocol(format!(
                "page of {} records exceeds requested {}",
                records.len(),
                max
            )));
        }
        if records.is_empty() && more {
            return Err(SessionError::Protocol(
                "empty page without end-of-data".to_string(),
            ));
        }

        debug!(
            "{:?} page at {}: {} records, more={}",
            group,
            start,
            records.len(),
            more
        );
        received.extend(records);

        if received.len() == expected {
            if more {
                debug!("Device holds more than the queried count; stopping at {}", expected);
            }
            return Ok(received);
        }
        if !more {
            warn!(
                "Device ended {:?} after {} of {} records",
                group,
                received.len(),
                expected
            );
            return Err(SessionError::ShortTransfer {
                expected,
                received: received.len(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameCodec, Kd5811btCodec};
    use crate::session::SessionConfig;
    use crate::sim::{sample_records, SimulatedDevice, SimulatorProfile};
    use crate::DeviceIdentifier;
    use std::sync::Arc;
    use std::time::Duration;

    fn session_with(
        profile: SimulatorProfile,
        page_size: u8,
    ) -> (Arc<CommandSession>, SimulatedDevice) {
        let codec: Arc<dyn FrameCodec> = Arc::new(Kd5811btCodec);
        let (link, device) = SimulatedDevice::spawn(codec.clone(), profile, 23);
        let session = CommandSession::start(
            DeviceIdentifier::from("AA:BB:CC:DD:EE:FF"),
            codec,
            link,
            SessionConfig {
                command_timeout: Duration::from_millis(500),
                page_size,
            },
            None,
        );
        (session, device)
    }

    #[tokio::test]
    async fn test_transfer_requires_count() {
        let (session, device) = session_with(SimulatorProfile::default(), 4);
        assert!(matches!(
            session.transfer_memory_data(MemoryGroup::Group1).await,
            Err(SessionError::Precondition(_))
        ));
        assert_eq!(device.commands_received(), 0);
    }

    #[tokio::test]
    async fn test_empty_memory_needs_no_round_trip() {
        let (session, device) = session_with(SimulatorProfile::default(), 4);
        assert_eq!(session.get_memory_count(MemoryGroup::Group1).await, Ok(0));
        let before = device.commands_received();

        assert_eq!(
            session.transfer_memory_data(MemoryGroup::Group1).await,
            Ok(Vec::new())
        );
        assert_eq!(device.commands_received(), before);
    }

    #[tokio::test]
    async fn test_multi_page_transfer_preserves_order() {
        let stored = sample_records(10, 1);
        let profile = SimulatorProfile {
            group1: stored.clone(),
            ..Default::default()
        };
        let (session, device) = session_with(profile, 4);

        assert_eq!(session.get_memory_count(MemoryGroup::Group1).await, Ok(10));
        let before = device.commands_received();
        let records = session
            .transfer_memory_data(MemoryGroup::Group1)
            .await
            .unwrap();

        assert_eq!(records, stored);
        // Pages of 4, 4 and 2.
        assert_eq!(device.commands_received() - before, 3);
        // Retrieval never deletes.
        assert_eq!(device.records(MemoryGroup::Group1).len(), 10);
    }

    #[tokio::test]
    async fn test_short_transfer_is_reported() {
        let profile = SimulatorProfile {
            group1: sample_records(5, 1),
            ..Default::default()
        };
        let (session, device) = session_with(profile, 4);
        session.get_memory_count(MemoryGroup::Group1).await.unwrap();

        device.short_by(2);
        assert_eq!(
            session.transfer_memory_data(MemoryGroup::Group1).await,
            Err(SessionError::ShortTransfer {
                expected: 5,
                received: 3
            })
        );
    }

    #[tokio::test]
    async fn test_all_groups_concatenated() {
        let group1 = sample_records(3, 1);
        let group2 = sample_records(2, 2);
        let profile = SimulatorProfile {
            group1: group1.clone(),
            group2: group2.clone(),
            ..Default::default()
        };
        let (session, _device) = session_with(profile, 10);

        assert_eq!(session.get_memory_count(MemoryGroup::All).await, Ok(5));
        let records = session.transfer_memory_data(MemoryGroup::All).await.unwrap();

        let expected: Vec<_> = group1.into_iter().chain(group2).collect();
        assert_eq!(records, expected);
    }

    #[tokio::test]
    async fn test_count_only_covers_queried_group() {
        let profile = SimulatorProfile {
            group1: sample_records(2, 1),
            group2: sample_records(2, 2),
            ..Default::default()
        };
        let (session, _device) = session_with(profile, 10);

        session.get_memory_count(MemoryGroup::Group1).await.unwrap();
        assert!(matches!(
            session.transfer_memory_data(MemoryGroup::All).await,
            Err(SessionError::Precondition(_))
        ));
    }
}
