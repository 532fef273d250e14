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

//! Per-family device handles and controllers.
//!
//! Both families share one session engine but keep their own surface:
//! KD5811BT addresses memory groups explicitly, KN550LT always works on
//! its single default group and adds IDPS, battery and clock queries.
//!
//! Every command exists twice: an `async fn` returning a result, and a
//! `command_*` variant taking a success and an error continuation. The
//! continuation variants spawn onto the current tokio runtime and call
//! exactly one of the two.

use chrono::NaiveDateTime;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::bluetooth::{Connector, Link};
use crate::error::{SessionError, SessionResult};
use crate::protocol::kn550lt::DEFAULT_GROUP;
use crate::protocol::{
    DeviceCapabilities, DeviceFamily, DeviceIdentifier, IdpsInfo, MemoryGroup, OfflineRecord,
};
use crate::registry::{share_controller, DeviceHandle, DeviceRegistry};
use crate::session::CommandSession;
use crate::sync::{sync_offline, SyncOptions, SyncReport};

/// Run `op` on the handle's session and deliver the outcome to one continuation.
fn dispatch<T, F, Fut>(
    handle: &DeviceHandle,
    op: F,
    on_success: impl FnOnce(T) + Send + 'static,
    on_error: impl FnOnce(SessionError) + Send + 'static,
) where
    T: Send + 'static,
    F: FnOnce(Arc<CommandSession>) -> Fut + Send + 'static,
    Fut: Future<Output = SessionResult<T>> + Send + 'static,
{
    let handle = handle.clone();
    tokio::spawn(async move {
        let result = match handle.session() {
            Ok(session) => op(session).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(value) => on_success(value),
            Err(e) => on_error(e),
        }
    });
}

/// A device family with its own handle type.
pub trait FamilyDevice: Sized {
    const FAMILY: DeviceFamily;

    fn from_handle(handle: DeviceHandle) -> Self;
}

/// KD5811BT monitor with two user memory groups.
#[derive(Debug, Clone)]
pub struct Kd5811bt {
    handle: DeviceHandle,
}

impl FamilyDevice for Kd5811bt {
    const FAMILY: DeviceFamily = DeviceFamily::Kd5811bt;

    fn from_handle(handle: DeviceHandle) -> Self {
        Self { handle }
    }
}

impl Kd5811bt {
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn identifier(&self) -> &DeviceIdentifier {
        self.handle.id()
    }

    pub async fn synchronize_time(&self) -> SessionResult<()> {
        self.handle.session()?.synchronize_time().await
    }

    pub async fn query_function(&self) -> SessionResult<DeviceCapabilities> {
        self.handle.session()?.query_function().await
    }

    pub async fn get_memory_count(&self, group: MemoryGroup) -> SessionResult<u32> {
        self.handle.session()?.get_memory_count(group).await
    }

    pub async fn transfer_memory_data(&self, group: MemoryGroup) -> SessionResult<Vec<OfflineRecord>> {
        self.handle.session()?.transfer_memory_data(group).await
    }

    pub async fn delete_memory_data(&self, group: MemoryGroup) -> SessionResult<()> {
        self.handle.session()?.delete_memory_data(group).await
    }

    pub async fn sync_offline(
        &self,
        group: MemoryGroup,
        options: SyncOptions,
    ) -> SessionResult<SyncReport> {
        sync_offline(&*self.handle.session()?, group, options).await
    }

    /// Last capability snapshot, if queried.
    pub fn capabilities(&self) -> Option<DeviceCapabilities> {
        self.handle.session().ok()?.capabilities()
    }

    pub async fn disconnect_device(&self) {
        if let Ok(session) = self.handle.session() {
            session.disconnect_device().await;
        }
    }

    pub fn command_synchronize_time(
        &self,
        on_success: impl FnOnce() + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            |s| async move { s.synchronize_time().await },
            move |()| on_success(),
            on_error,
        );
    }

    pub fn command_function(
        &self,
        on_capabilities: impl FnOnce(DeviceCapabilities) + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            |s| async move { s.query_function().await },
            on_capabilities,
            on_error,
        );
    }

    pub fn command_get_memory_count(
        &self,
        group: MemoryGroup,
        on_count: impl FnOnce(u32) + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            move |s| async move { s.get_memory_count(group).await },
            on_count,
            on_error,
        );
    }

    pub fn command_transfer_memory_data(
        &self,
        group: MemoryGroup,
        on_records: impl FnOnce(Vec<OfflineRecord>) + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            move |s| async move { s.transfer_memory_data(group).await },
            on_records,
            on_error,
        );
    }

    pub fn command_delete_memory_data(
        &self,
        group: MemoryGroup,
        on_success: impl FnOnce() + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            move |s| async move { s.delete_memory_data(group).await },
            move |()| on_success(),
            on_error,
        );
    }

    pub fn command_disconnect_device(&self) {
        let device = self.clone();
        tokio::spawn(async move { device.disconnect_device().await });
    }
}

/// KN550LT monitor with a single implicit memory group.
#[derive(Debug, Clone)]
pub struct Kn550lt {
    handle: DeviceHandle,
}

impl FamilyDevice for Kn550lt {
    const FAMILY: DeviceFamily = DeviceFamily::Kn550lt;

    fn from_handle(handle: DeviceHandle) -> Self {
        Self { handle }
    }
}

impl Kn550lt {
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn identifier(&self) -> &DeviceIdentifier {
        self.handle.id()
    }

    pub async fn synchronize_time(&self) -> SessionResult<()> {
        self.handle.session()?.synchronize_time().await
    }

    pub async fn query_function(&self) -> SessionResult<DeviceCapabilities> {
        self.handle.session()?.query_function().await
    }

    pub async fn get_memory_count(&self) -> SessionResult<u32> {
        self.handle.session()?.get_memory_count(DEFAULT_GROUP).await
    }

    pub async fn transfer_memory_data(&self) -> SessionResult<Vec<OfflineRecord>> {
        self.handle.session()?.transfer_memory_data(DEFAULT_GROUP).await
    }

    pub async fn delete_memory_data(&self) -> SessionResult<()> {
        self.handle.session()?.delete_memory_data(DEFAULT_GROUP).await
    }

    pub async fn get_idps_info(&self) -> SessionResult<IdpsInfo> {
        self.handle.session()?.get_idps_info().await
    }

    /// Battery level in percent.
    pub async fn energy(&self) -> SessionResult<u8> {
        self.handle.session()?.energy().await
    }

    pub async fn get_device_date(&self) -> SessionResult<NaiveDateTime> {
        self.handle.session()?.get_device_date().await
    }

    pub async fn sync_offline(&self, options: SyncOptions) -> SessionResult<SyncReport> {
        sync_offline(&*self.handle.session()?, DEFAULT_GROUP, options).await
    }

    pub fn capabilities(&self) -> Option<DeviceCapabilities> {
        self.handle.session().ok()?.capabilities()
    }

    pub async fn disconnect_device(&self) {
        if let Ok(session) = self.handle.session() {
            session.disconnect_device().await;
        }
    }

    pub fn command_synchronize_time(
        &self,
        on_success: impl FnOnce() + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            |s| async move { s.synchronize_time().await },
            move |()| on_success(),
            on_error,
        );
    }

    pub fn command_function(
        &self,
        on_capabilities: impl FnOnce(DeviceCapabilities) + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            |s| async move { s.query_function().await },
            on_capabilities,
            on_error,
        );
    }

    pub fn command_get_memory_count(
        &self,
        on_count: impl FnOnce(u32) + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            |s| async move { s.get_memory_count(DEFAULT_GROUP).await },
            on_count,
            on_error,
        );
    }

    pub fn command_transfer_memory_data(
        &self,
        on_records: impl FnOnce(Vec<OfflineRecord>) + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            |s| async move { s.transfer_memory_data(DEFAULT_GROUP).await },
            on_records,
            on_error,
        );
    }

    pub fn command_delete_memory_data(
        &self,
        on_success: impl FnOnce() + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            |s| async move { s.delete_memory_data(DEFAULT_GROUP).await },
            move |()| on_success(),
            on_error,
        );
    }

    pub fn command_get_idps_info(
        &self,
        on_info: impl FnOnce(IdpsInfo) + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            |s| async move { s.get_idps_info().await },
            on_info,
            on_error,
        );
    }

    pub fn command_energy(
        &self,
        on_energy: impl FnOnce(u8) + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            |s| async move { s.energy().await },
            on_energy,
            on_error,
        );
    }

    pub fn command_get_device_date(
        &self,
        on_date: impl FnOnce(NaiveDateTime) + Send + 'static,
        on_error: impl FnOnce(SessionError) + Send + 'static,
    ) {
        dispatch(
            &self.handle,
            |s| async move { s.get_device_date().await },
            on_date,
            on_error,
        );
    }

    pub fn command_disconnect_device(&self) {
        let device = self.clone();
        tokio::spawn(async move { device.disconnect_device().await });
    }
}

/// Family-typed view of the shared registry.
pub struct Controller<D> {
    registry: &'static DeviceRegistry,
    _device: PhantomData<fn() -> D>,
}

pub type Kd5811btController = Controller<Kd5811bt>;
pub type Kn550ltController = Controller<Kn550lt>;

impl<D> Clone for Controller<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for Controller<D> {}

impl<D> std::fmt::Debug for Controller<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Controller").field(self.registry).finish()
    }
}

impl<D: FamilyDevice> Controller<D> {
    /// Process-wide controller for the family.
    pub fn share() -> Self {
        Self {
            registry: share_controller(D::FAMILY),
            _device: PhantomData,
        }
    }

    pub fn registry(&self) -> &'static DeviceRegistry {
        self.registry
    }

    pub fn get_all_current_instances(&self) -> impl Iterator<Item = D> {
        self.registry.get_all_instances().map(D::from_handle)
    }

    pub fn get_instance_with_identifier(&self, id: &DeviceIdentifier) -> Option<D> {
        self.registry.get_instance(id).map(D::from_handle)
    }

    /// Register a device reachable over an already connected link.
    pub fn attach(&self, id: DeviceIdentifier, link: Link) -> D {
        D::from_handle(self.registry.get_or_create_session(id, link))
    }

    /// Connect through `connector` unless a live session already exists.
    pub async fn connect(&self, connector: &dyn Connector, id: DeviceIdentifier) -> SessionResult<D> {
        if let Some(handle) = self.registry.get_instance(&id) {
            return Ok(D::from_handle(handle));
        }
        let link = connector.connect(&id).await?;
        Ok(self.attach(id, link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::protocol::codec_for;
    use crate::sim::{sample_records, SimulatedDevice, SimulatorProfile};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    /// Hands out a fresh simulated KD5811BT per connect.
    #[derive(Default)]
    struct SimConnector {
        devices: Mutex<Vec<SimulatedDevice>>,
    }

    #[async_trait]
    impl Connector for SimConnector {
        async fn connect(&self, _id: &DeviceIdentifier) -> Result<Link, TransportError> {
            let (link, device) = SimulatedDevice::spawn(
                codec_for(DeviceFamily::Kd5811bt),
                SimulatorProfile::default(),
                23,
            );
            self.devices.lock().push(device);
            Ok(link)
        }
    }

    fn orphaned_kd(id: &str) -> (Kd5811bt, SimulatedDevice) {
        let (link, device) = SimulatedDevice::spawn(
            codec_for(DeviceFamily::Kd5811bt),
            SimulatorProfile::default(),
            23,
        );
        // The registry and its sessions drop here, leaving the handle dangling.
        let handle = DeviceRegistry::new(DeviceFamily::Kd5811bt)
            .get_or_create_session(DeviceIdentifier::from(id), link);
        (Kd5811bt::from_handle(handle), device)
    }

    #[tokio::test]
    async fn test_callback_delivers_success_once() {
        let controller = Kd5811btController::share();
        let profile = SimulatorProfile {
            group2: sample_records(2, 2),
            ..Default::default()
        };
        let (link, _device) =
            SimulatedDevice::spawn(codec_for(DeviceFamily::Kd5811bt), profile, 23);
        let device = controller.attach(DeviceIdentifier::from("cb-success"), link);

        let (tx, rx) = oneshot::channel();
        device.command_get_memory_count(
            MemoryGroup::Group2,
            move |count| {
                let _ = tx.send(count);
            },
            move |e| panic!("unexpected error: {e}"),
        );
        assert_eq!(rx.await.unwrap(), 2);

        device.disconnect_device().await;
        assert!(controller
            .get_instance_with_identifier(&DeviceIdentifier::from("cb-success"))
            .is_none());
    }

    #[tokio::test]
    async fn test_callback_on_gone_handle_reports_error() {
        let (device, _sim) = orphaned_kd("orphan");

        let (tx, rx) = oneshot::channel();
        device.command_synchronize_time(
            || panic!("session should be gone"),
            move |e| {
                let _ = tx.send(e);
            },
        );
        assert!(matches!(rx.await.unwrap(), SessionError::Gone(_)));
    }

    #[tokio::test]
    async fn test_kn550lt_extras() {
        let controller = Kn550ltController::share();
        let (link, sim) = SimulatedDevice::spawn(
            codec_for(DeviceFamily::Kn550lt),
            SimulatorProfile::default(),
            23,
        );
        let device = controller.attach(DeviceIdentifier::from("kn-extras"), link);

        assert_eq!(device.energy().await, Ok(sim.battery()));
        assert_eq!(device.get_idps_info().await.unwrap().model_number, "SIM-1");

        device.synchronize_time().await.unwrap();
        assert_eq!(device.get_device_date().await.ok(), sim.clock());

        device.disconnect_device().await;
    }

    #[tokio::test]
    async fn test_connect_reuses_live_session() {
        let controller = Kd5811btController::share();
        let connector = SimConnector::default();
        let id = DeviceIdentifier::from("connect-reuse");

        let first = controller.connect(&connector, id.clone()).await.unwrap();
        let again = controller.connect(&connector, id.clone()).await.unwrap();
        assert_eq!(connector.devices.lock().len(), 1);

        let instance = first.handle().session().unwrap().instance();
        assert_eq!(again.handle().session().unwrap().instance(), instance);
        again.synchronize_time().await.unwrap();

        first.disconnect_device().await;
        let fresh = controller.connect(&connector, id).await.unwrap();
        assert_eq!(connector.devices.lock().len(), 2);
        assert_ne!(fresh.handle().session().unwrap().instance(), instance);

        fresh.disconnect_device().await;
    }
}
