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

//! Device registry: identifier to session table, one per family.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bluetooth::Link;
use crate::error::{SessionError, SessionResult};
use crate::events::{RegistryEvent, EVENT_CHANNEL_CAPACITY};
use crate::protocol::{codec_for, DeviceFamily, DeviceIdentifier, FrameCodec};
use crate::session::{CommandSession, SessionConfig, SessionNotice, SessionObserver};

type SessionTable = HashMap<DeviceIdentifier, Arc<CommandSession>>;

/// Non-owning reference to a registered session.
///
/// The registry owns sessions; a handle only observes one. Once the
/// session is gone every call through the handle fails with
/// [`SessionError::Gone`] or [`SessionError::Closed`].
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    id: DeviceIdentifier,
    session: Weak<CommandSession>,
}

impl DeviceHandle {
    pub(crate) fn new(session: &Arc<CommandSession>) -> Self {
        Self {
            id: session.id().clone(),
            session: Arc::downgrade(session),
        }
    }

    pub fn id(&self) -> &DeviceIdentifier {
        &self.id
    }

    /// Resolve the backing session.
    pub fn session(&self) -> SessionResult<Arc<CommandSession>> {
        self.session
            .upgrade()
            .ok_or_else(|| SessionError::Gone(self.id.clone()))
    }

    /// Whether the backing session is still alive and connected.
    pub fn is_live(&self) -> bool {
        self.session
            .upgrade()
            .is_some_and(|session| session.is_connected())
    }
}

/// Tracks the live sessions of one device family.
pub struct DeviceRegistry {
    family: DeviceFamily,
    codec: Arc<dyn FrameCodec>,
    config: RwLock<SessionConfig>,
    sessions: Arc<RwLock<SessionTable>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("family", &self.family)
            .field("sessions", &self.len())
            .finish()
    }
}

impl DeviceRegistry {
    /// Create a new registry using the family's default session settings.
    pub fn new(family: DeviceFamily) -> Self {
        let codec = codec_for(family);
        let config = SessionConfig::for_family(codec.descriptor());
        Self::with_config(family, config)
    }

    pub fn with_config(family: DeviceFamily, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            family,
            codec: codec_for(family),
            config: RwLock::new(config),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn family(&self) -> DeviceFamily {
        self.family
    }

    /// Settings applied to sessions created from now on.
    pub fn set_session_config(&self, config: SessionConfig) {
        *self.config.write() = config;
    }

    pub fn session_config(&self) -> SessionConfig {
        *self.config.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Return the live session for `id`, or bind a new one to `link`.
    ///
    /// When a live session already exists the surplus link is dropped.
    pub fn get_or_create_session(&self, id: DeviceIdentifier, link: Link) -> DeviceHandle {
        let mut sessions = self.sessions.write();

        if let Some(existing) = sessions.get(&id) {
            if existing.is_connected() {
                debug!("Reusing live session for {}", id);
                return DeviceHandle::new(existing);
            }
            // Closed but its removal has not landed yet.
            sessions.remove(&id);
        }

        let session = CommandSession::start(
            id.clone(),
            self.codec.clone(),
            link,
            *self.config.read(),
            Some(self.observer()),
        );
        let handle = DeviceHandle::new(&session);
        sessions.insert(id.clone(), session);
        drop(sessions);

        info!("Registered {} device {}", self.family, id);
        let _ = self.events.send(RegistryEvent::Connected {
            family: self.family,
            id,
        });
        handle
    }

    /// Look up a live session.
    pub fn get_instance(&self, id: &DeviceIdentifier) -> Option<DeviceHandle> {
        self.sessions
            .read()
            .get(id)
            .filter(|session| session.is_connected())
            .map(DeviceHandle::new)
    }

    /// Snapshot of every live session at call time.
    pub fn get_all_instances(&self) -> impl Iterator<Item = DeviceHandle> {
        let snapshot: Vec<DeviceHandle> = self
            .sessions
            .read()
            .values()
            .filter(|session| session.is_connected())
            .map(DeviceHandle::new)
            .collect();
        snapshot.into_iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Disconnect and drop every session.
    pub async fn clear(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        if !sessions.is_empty() {
            info!("Clearing {} {} sessions", sessions.len(), self.family);
        }
        for session in sessions {
            session.disconnect_device().await;
        }
    }

    /// Session hook: deregister on close, publish protocol errors.
    fn observer(&self) -> SessionObserver {
        let family = self.family;
        let sessions = Arc::downgrade(&self.sessions);
        let events = self.events.clone();

        Arc::new(move |session: &CommandSession, notice: SessionNotice| match notice {
            SessionNotice::Closed { reason } => {
                if let Some(sessions) = sessions.upgrade() {
                    let mut sessions = sessions.write();
                    // A reconnect may already have replaced this session.
                    if sessions
                        .get(session.id())
                        .is_some_and(|s| s.instance() == session.instance())
                    {
                        sessions.remove(session.id());
                        debug!("Deregistered {}", session.id());
                    }
                }
                let _ = events.send(RegistryEvent::Disconnected {
                    family,
                    id: session.id().clone(),
                    reason,
                });
            }
            SessionNotice::Unsolicited { detail } => {
                warn!("Protocol error on {}: {}", session.id(), detail);
                let _ = events.send(RegistryEvent::ProtocolError {
                    family,
                    id: session.id().clone(),
                    detail,
                });
            }
        })
    }
}

static KD5811BT_REGISTRY: OnceLock<DeviceRegistry> = OnceLock::new();
static KN550LT_REGISTRY: OnceLock<DeviceRegistry> = OnceLock::new();

/// Process-wide registry for `family`, created on first use.
pub fn share_controller(family: DeviceFamily) -> &'static DeviceRegistry {
    let cell = match family {
        DeviceFamily::Kd5811bt => &KD5811BT_REGISTRY,
        DeviceFamily::Kn550lt => &KN550LT_REGISTRY,
    };
    cell.get_or_init(|| DeviceRegistry::new(family))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedDevice, SimulatorProfile};

    fn connect(registry: &DeviceRegistry, id: &str) -> (DeviceHandle, SimulatedDevice) {
        let (link, device) =
            SimulatedDevice::spawn(codec_for(registry.family()), SimulatorProfile::default(), 23);
        (
            registry.get_or_create_session(DeviceIdentifier::from(id), link),
            device,
        )
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = DeviceRegistry::new(DeviceFamily::Kd5811bt);
        let (first, _d1) = connect(&registry, "AA");
        let (second, _d2) = connect(&registry, "AA");

        assert_eq!(registry.len(), 1);
        assert_eq!(
            first.session().unwrap().instance(),
            second.session().unwrap().instance()
        );
    }

    #[tokio::test]
    async fn test_disconnect_deregisters() {
        let registry = DeviceRegistry::new(DeviceFamily::Kd5811bt);
        let mut events = registry.subscribe();
        let (handle, _device) = connect(&registry, "AA");
        assert!(registry.get_instance(handle.id()).is_some());

        handle.session().unwrap().disconnect_device().await;

        assert!(registry.get_instance(handle.id()).is_none());
        assert!(registry.is_empty());
        assert!(!handle.is_live());
        assert!(matches!(
            handle.session(),
            Err(SessionError::Gone(_))
        ));

        assert!(matches!(events.recv().await, Ok(RegistryEvent::Connected { .. })));
        assert!(matches!(
            events.recv().await,
            Ok(RegistryEvent::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_does_not_follow_later_changes() {
        let registry = DeviceRegistry::new(DeviceFamily::Kn550lt);
        let (_a, _da) = connect(&registry, "A");
        let snapshot = registry.get_all_instances();
        let (_b, _db) = connect(&registry, "B");

        assert_eq!(snapshot.count(), 1);
        assert_eq!(registry.get_all_instances().count(), 2);
    }

    #[tokio::test]
    async fn test_clear_disconnects_everything() {
        let registry = DeviceRegistry::new(DeviceFamily::Kd5811bt);
        let (a, _da) = connect(&registry, "A");
        let (b, _db) = connect(&registry, "B");
        let session_a = a.session().unwrap();

        registry.clear().await;

        assert!(registry.is_empty());
        assert!(!session_a.is_connected());
        assert!(!b.is_live());
    }

    #[test]
    fn test_share_controller_is_per_family() {
        let kd = share_controller(DeviceFamily::Kd5811bt);
        let kn = share_controller(DeviceFamily::Kn550lt);
        assert!(std::ptr::eq(kd, share_controller(DeviceFamily::Kd5811bt)));
        assert_eq!(kd.family(), DeviceFamily::Kd5811bt);
        assert_eq!(kn.family(), DeviceFamily::Kn550lt);
    }
}
