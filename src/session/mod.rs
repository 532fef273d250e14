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

//! Per-device command session.
//!
//! One session owns the link to one physical device and runs the
//! request/response state machine over it:
//!
//! ```text
//! Idle ──dispatch──▶ AwaitingResponse ──reply / NAK / timeout──▶ Idle
//!   │                       │
//!   └──────link lost / disconnect_device──────▶ Disconnected (terminal)
//! ```
//!
//! At most one command is in flight. A command issued while another is
//! pending fails with [`SessionError::Busy`] instead of queueing.

mod batch;

use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bluetooth::{split_frame, FrameAssembler, Link, Transport, TransportEvent};
use crate::error::{CodecError, SessionError, SessionResult, TransportError};
use crate::protocol::frame::Envelope;
use crate::protocol::{
    Command, DeviceCapabilities, DeviceFamily, DeviceIdentifier, FamilyDescriptor, FrameCodec,
    IdpsInfo, MemoryGroup, OfflineRecord, Response,
};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Tunables of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bounded wait for each correlated response.
    pub command_timeout: Duration,
    /// Maximum records requested per page during batch transfer.
    pub page_size: u8,
}

impl SessionConfig {
    pub fn for_family(descriptor: &FamilyDescriptor) -> Self {
        Self {
            command_timeout: descriptor.command_timeout,
            page_size: descriptor.page_size,
        }
    }
}

/// Observable state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingResponse,
    Disconnected,
}

/// Out-of-band notifications a session raises to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// The session reached `Disconnected`.
    Closed { reason: String },
    /// A frame arrived while no command was pending, or failed to decode.
    Unsolicited { detail: String },
}

/// Callback invoked for every [`SessionNotice`].
pub type SessionObserver = Arc<dyn Fn(&CommandSession, SessionNotice) + Send + Sync>;

/// An in-flight request awaiting its correlated response.
struct PendingCommand {
    seq: u64,
    command: Command,
    issued_at: Instant,
    reply: oneshot::Sender<SessionResult<Response>>,
}

struct Inner {
    closed: bool,
    pending: Option<PendingCommand>,
    /// Held by multi-step operations (batch transfer, `All` fan-out).
    exclusive: bool,
    next_seq: u64,
    counts: HashMap<MemoryGroup, u16>,
    capabilities: Option<DeviceCapabilities>,
}

/// Live protocol context for one connected device.
pub struct CommandSession {
    id: DeviceIdentifier,
    instance: u64,
    codec: Arc<dyn FrameCodec>,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    inner: Mutex<Inner>,
    observer: Option<SessionObserver>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for CommandSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSession")
            .field("id", &self.id)
            .field("family", &self.family())
            .field("state", &self.state())
            .finish()
    }
}

impl CommandSession {
    /// Bind a session to a connected link and start reading from it.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        id: DeviceIdentifier,
        codec: Arc<dyn FrameCodec>,
        link: Link,
        config: SessionConfig,
        observer: Option<SessionObserver>,
    ) -> Arc<Self> {
        let Link { transport, events } = link;

        let session = Arc::new(Self {
            id,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            codec,
            transport,
            config,
            inner: Mutex::new(Inner {
                closed: false,
                pending: None,
                exclusive: false,
                next_seq: 0,
                counts: HashMap::new(),
                capabilities: None,
            }),
            observer,
            reader: Mutex::new(None),
        });

        let envelope = session.codec.descriptor().envelope;
        let reader = tokio::spawn(read_loop(Arc::downgrade(&session), envelope, events));
        *session.reader.lock() = Some(reader);

        info!(
            "{} session started for {} (MTU {})",
            session.family(),
            session.id,
            session.transport.mtu()
        );
        session
    }

    pub fn id(&self) -> &DeviceIdentifier {
        &self.id
    }

    /// Process-unique number distinguishing sessions for the same device.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn family(&self) -> DeviceFamily {
        self.codec.family()
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    pub fn state(&self) -> SessionState {
        let inner = self.inner.lock();
        if inner.closed {
            SessionState::Disconnected
        } else if inner.pending.is_some() || inner.exclusive {
            SessionState::AwaitingResponse
        } else {
            SessionState::Idle
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.lock().closed
    }

    /// Last capability snapshot, if one was queried.
    pub fn capabilities(&self) -> Option<DeviceCapabilities> {
        self.inner.lock().capabilities.clone()
    }

    /// Count cached by the last successful `get_memory_count` for `group`.
    pub fn cached_count(&self, group: MemoryGroup) -> Option<u16> {
        self.inner.lock().counts.get(&group).copied()
    }

    /// Push host wall-clock time to the device.
    pub async fn synchronize_time(&self) -> SessionResult<()> {
        self.synchronize_time_to(Local::now().naive_local()).await
    }

    pub async fn synchronize_time_to(&self, now: NaiveDateTime) -> SessionResult<()> {
        let command = Command::SyncTime(now);
        match self.exchange(command.clone(), false).await? {
            Response::Ack => {
                info!("Time synchronized on {} to {}", self.id, now);
                Ok(())
            }
            other => Err(unexpected(&other, &command)),
        }
    }

    /// Query the capability snapshot and cache it.
    pub async fn query_function(&self) -> SessionResult<DeviceCapabilities> {
        let command = Command::QueryFunction;
        match self.exchange(command.clone(), false).await? {
            Response::Capabilities(caps) => {
                debug!("Capabilities of {}: {:?}", self.id, caps);
                self.inner.lock().capabilities = Some(caps.clone());
                Ok(caps)
            }
            other => Err(unexpected(&other, &command)),
        }
    }

    /// Count stored records in `group`, summing over groups for `All`.
    ///
    /// Caches per-group counts for the batch transfer engine.
    pub async fn get_memory_count(&self, group: MemoryGroup) -> SessionResult<u32> {
        let groups = self.concrete_groups(group)?;
        let _exclusive = self.begin_exclusive()?;

        let mut total = 0u32;
        for group in groups {
            let command = Command::MemoryCount(group);
            let count = match self.exchange(command.clone(), true).await? {
                Response::MemoryCount { count, .. } => count,
                other => return Err(unexpected(&other, &command)),
            };
            debug!("{} holds {} records in {:?}", self.id, count, group);
            self.inner.lock().counts.insert(group, count);
            total += u32::from(count);
        }
        Ok(total)
    }

    /// Retrieve every stored record of `group` in device storage order.
    ///
    /// Requires a prior `get_memory_count` covering `group`.
    pub async fn transfer_memory_data(&self, group: MemoryGroup) -> SessionResult<Vec<OfflineRecord>> {
        batch::transfer(self, group).await
    }

    /// Erase stored records of `group`. The device offers no undo.
    pub async fn delete_memory_data(&self, group: MemoryGroup) -> SessionResult<()> {
        let groups = self.concrete_groups(group)?;
        let _exclusive = self.begin_exclusive()?;

        for group in groups {
            let command = Command::DeleteMemory(group);
            match self.exchange(command.clone(), true).await? {
                Response::Ack => {
                    // The old count no longer describes the device.
                    self.inner.lock().counts.remove(&group);
                    info!("Deleted offline records in {:?} on {}", group, self.id);
                }
                other => return Err(unexpected(&other, &command)),
            }
        }
        Ok(())
    }

    pub async fn get_idps_info(&self) -> SessionResult<IdpsInfo> {
        let command = Command::GetIdps;
        match self.exchange(command.clone(), false).await? {
            Response::Idps(info) => Ok(info),
            other => Err(unexpected(&other, &command)),
        }
    }

    /// Remaining battery percentage.
    pub async fn energy(&self) -> SessionResult<u8> {
        let command = Command::Energy;
        match self.exchange(command.clone(), false).await? {
            Response::Energy(level) => Ok(level),
            other => Err(unexpected(&other, &command)),
        }
    }

    pub async fn get_device_date(&self) -> SessionResult<NaiveDateTime> {
        let command = Command::GetDeviceDate;
        match self.exchange(command.clone(), false).await? {
            Response::DeviceDate(date) => Ok(date),
            other => Err(unexpected(&other, &command)),
        }
    }

    /// Tear down the link. Any pending command completes with
    /// [`SessionError::Cancelled`].
    pub async fn disconnect_device(&self) {
        if !self.mark_closed(SessionError::Cancelled) {
            return;
        }
        info!("Disconnecting {}", self.id);
        self.release_link(true).await;
        self.notify(SessionNotice::Closed {
            reason: "disconnected by host".to_string(),
        });
    }

    fn concrete_groups(&self, group: MemoryGroup) -> SessionResult<Vec<MemoryGroup>> {
        self.ensure_open()?;
        let supported = self.codec.descriptor().groups;
        if group != MemoryGroup::All && !supported.contains(&group) {
            return Err(SessionError::Unsupported {
                what: "this memory group",
                family: self.family(),
            });
        }
        Ok(group.expand(supported))
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.inner.lock().closed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn begin_exclusive(&self) -> SessionResult<ExclusiveGuard<'_>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SessionError::Closed);
        }
        if inner.pending.is_some() || inner.exclusive {
            return Err(SessionError::Busy);
        }
        inner.exclusive = true;
        Ok(ExclusiveGuard { session: self })
    }

    fn encode(&self, command: &Command) -> SessionResult<Vec<u8>> {
        self.codec.encode_command(command).map_err(|e| match e {
            CodecError::Unsupported(what) => SessionError::Unsupported {
                what,
                family: self.family(),
            },
            other => other.into(),
        })
    }

    /// Send one command and wait for its correlated response.
    ///
    /// `owns_exclusive` lets a multi-step operation dispatch while it holds
    /// the session.
    async fn exchange(&self, command: Command, owns_exclusive: bool) -> SessionResult<Response> {
        self.ensure_open()?;
        let frame = self.encode(&command)?;
        let (reply_tx, mut reply_rx) = oneshot::channel();
        let deadline = Instant::now() + self.config.command_timeout;

        let seq = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SessionError::Closed);
            }
            if inner.pending.is_some() || (inner.exclusive && !owns_exclusive) {
                return Err(SessionError::Busy);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.pending = Some(PendingCommand {
                seq,
                command: command.clone(),
                issued_at: Instant::now(),
                reply: reply_tx,
            });
            seq
        };
        let _pending = PendingGuard { session: self, seq };

        debug!("{} -> {}: {}", self.id, command.name(), hex::encode(&frame));
        for packet in split_frame(&frame, self.transport.mtu()) {
            if let Err(e) = self.transport.send(packet).await {
                error!("Send to {} failed: {}", self.id, e);
                self.fail_link(e.clone()).await;
                // Closing always takes the pending command and settles it,
                // possibly from a concurrent disconnect.
                return reply_rx.await.unwrap_or(Err(SessionError::Transport(e)));
            }
        }

        match tokio::time::timeout_at(deadline, &mut reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Cancelled),
            Err(_) => {
                let expired = {
                    let mut inner = self.inner.lock();
                    if inner.pending.as_ref().is_some_and(|p| p.seq == seq) {
                        inner.pending.take()
                    } else {
                        None
                    }
                };
                match expired {
                    Some(_) => {
                        warn!(
                            "{} timed out on {} after {:?}",
                            self.id,
                            command.name(),
                            self.config.command_timeout
                        );
                        Err(SessionError::Timeout(self.config.command_timeout))
                    }
                    // Whoever took the command is about to settle it.
                    None => reply_rx.await.unwrap_or(Err(SessionError::Cancelled)),
                }
            }
        }
    }

    /// Route one reassembled frame to the pending command.
    fn handle_frame(&self, frame: &[u8]) {
        let decoded = self.codec.decode_response(frame);

        let pending = self.inner.lock().pending.take();
        let Some(pending) = pending else {
            let detail = match &decoded {
                Ok(response) => format!("unsolicited {} frame", response.name()),
                Err(e) => format!("undecodable frame while idle: {e}"),
            };
            warn!("{}: {} ({})", self.id, detail, hex::encode(frame));
            self.notify(SessionNotice::Unsolicited { detail });
            return;
        };

        let result = match decoded {
            Ok(Response::Nak { code }) => {
                warn!("{} rejected {} with code {:#04x}", self.id, pending.command.name(), code);
                Err(SessionError::DeviceRejected { code })
            }
            Ok(response) if response.answers(&pending.command) => Ok(response),
            Ok(response) => Err(SessionError::Protocol(format!(
                "{} frame in reply to {}",
                response.name(),
                pending.command.name()
            ))),
            Err(e) => {
                warn!("{}: bad reply to {}: {}", self.id, pending.command.name(), e);
                Err(e.into())
            }
        };

        debug!(
            "{} <- {} after {:?}",
            self.id,
            pending.command.name(),
            pending.issued_at.elapsed()
        );
        let _ = pending.reply.send(result);
    }

    /// Transition to `Disconnected`, failing the pending command with `error`.
    ///
    /// Returns false if the session was already closed.
    fn mark_closed(&self, error: SessionError) -> bool {
        let pending = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.closed = true;
            inner.counts.clear();
            inner.pending.take()
        };
        if let Some(pending) = pending {
            let _ = pending.reply.send(Err(error));
        }
        true
    }

    async fn release_link(&self, abort_reader: bool) {
        let reader = self.reader.lock().take();
        if let (true, Some(reader)) = (abort_reader, reader) {
            reader.abort();
        }
        self.transport.disconnect().await;
    }

    async fn fail_link(&self, error: TransportError) {
        if !self.mark_closed(SessionError::Transport(error.clone())) {
            return;
        }
        self.release_link(true).await;
        self.notify(SessionNotice::Closed {
            reason: error.to_string(),
        });
    }

    async fn link_lost(&self, reason: String) {
        let error = TransportError::LinkLost(reason.clone());
        if !self.mark_closed(SessionError::Transport(error)) {
            return;
        }
        warn!("Link to {} lost: {}", self.id, reason);
        self.release_link(false).await;
        self.notify(SessionNotice::Closed { reason });
    }

    fn notify(&self, notice: SessionNotice) {
        if let Some(observer) = &self.observer {
            observer(self, notice);
        }
    }
}

impl Drop for CommandSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

/// Clears the pending slot if the owning future is dropped early.
struct PendingGuard<'a> {
    session: &'a CommandSession,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.session.inner.lock();
        if inner.pending.as_ref().is_some_and(|p| p.seq == self.seq) {
            inner.pending = None;
        }
    }
}

struct ExclusiveGuard<'a> {
    session: &'a CommandSession,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.session.inner.lock().exclusive = false;
    }
}

fn unexpected(response: &Response, command: &Command) -> SessionError {
    SessionError::Protocol(format!(
        "{} frame in reply to {}",
        response.name(),
        command.name()
    ))
}

async fn read_loop(
    session: Weak<CommandSession>,
    envelope: Envelope,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    let mut assembler = FrameAssembler::new(envelope);

    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Packet(packet) => {
                for frame in assembler.push(&packet) {
                    session.handle_frame(&frame);
                }
            }
            TransportEvent::Disconnected { reason } => {
                session.link_lost(reason).await;
                return;
            }
        }
    }

    if let Some(session) = session.upgrade() {
        session.link_lost("event stream closed".to_string()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Kd5811btCodec, Kn550ltCodec};
    use crate::sim::{SimulatedDevice, SimulatorProfile};

    fn config(timeout_ms: u64) -> SessionConfig {
        SessionConfig {
            command_timeout: Duration::from_millis(timeout_ms),
            page_size: 4,
        }
    }

    fn kd_session(timeout_ms: u64) -> (Arc<CommandSession>, SimulatedDevice) {
        let codec: Arc<dyn FrameCodec> = Arc::new(Kd5811btCodec);
        let (link, device) = SimulatedDevice::spawn(codec.clone(), SimulatorProfile::default(), 23);
        let session = CommandSession::start(
            DeviceIdentifier::from("00:11:22:33:44:55"),
            codec,
            link,
            config(timeout_ms),
            None,
        );
        (session, device)
    }

    #[tokio::test]
    async fn test_sync_time_acknowledged() {
        let (session, device) = kd_session(500);
        session.synchronize_time().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(device.clock().is_some());
    }

    #[tokio::test]
    async fn test_busy_while_awaiting_response() {
        let (session, device) = kd_session(300);
        device.set_silent(true);

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.query_function().await })
        };
        // Let the first command reach AwaitingResponse.
        while session.state() != SessionState::AwaitingResponse {
            tokio::task::yield_now().await;
        }

        assert_eq!(session.synchronize_time().await, Err(SessionError::Busy));
        assert!(matches!(
            first.await.unwrap(),
            Err(SessionError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_returns_to_idle() {
        let (session, device) = kd_session(100);
        device.set_silent(true);

        assert_eq!(
            session.query_function().await,
            Err(SessionError::Timeout(Duration::from_millis(100)))
        );
        assert_eq!(session.state(), SessionState::Idle);

        device.set_silent(false);
        assert!(session.query_function().await.is_ok());
        assert!(session.capabilities().is_some());
    }

    #[tokio::test]
    async fn test_nak_maps_to_device_rejected() {
        let (session, device) = kd_session(500);
        device.reject_next(0x03);
        assert_eq!(
            session.synchronize_time().await,
            Err(SessionError::DeviceRejected { code: 0x03 })
        );
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_command() {
        let (session, device) = kd_session(5_000);
        device.set_silent(true);

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.query_function().await })
        };
        while device.commands_received() == 0 {
            tokio::task::yield_now().await;
        }

        session.disconnect_device().await;
        assert_eq!(pending.await.unwrap(), Err(SessionError::Cancelled));
        assert_eq!(session.state(), SessionState::Disconnected);

        // Closed sessions fail without touching the transport.
        let before = device.commands_received();
        assert_eq!(session.synchronize_time().await, Err(SessionError::Closed));
        assert_eq!(session.energy().await, Err(SessionError::Closed));
        assert_eq!(
            session.get_memory_count(MemoryGroup::All).await,
            Err(SessionError::Closed)
        );
        assert_eq!(device.commands_received(), before);
    }

    #[tokio::test]
    async fn test_closed_takes_precedence_over_unsupported_group() {
        let codec: Arc<dyn FrameCodec> = Arc::new(Kn550ltCodec);
        let (link, _device) =
            SimulatedDevice::spawn(codec.clone(), SimulatorProfile::default(), 23);
        let session =
            CommandSession::start(DeviceIdentifier::from("KN-2"), codec, link, config(500), None);

        session.disconnect_device().await;
        assert_eq!(
            session.delete_memory_data(MemoryGroup::Group2).await,
            Err(SessionError::Closed)
        );
    }

    #[tokio::test]
    async fn test_reply_settled_after_deadline_is_delivered() {
        let (session, device) = kd_session(100);
        device.set_silent(true);

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.synchronize_time().await })
        };
        while device.commands_received() == 0 {
            tokio::task::yield_now().await;
        }

        // The reader claims the command before the deadline but settles it after.
        let claimed = session.inner.lock().pending.take().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = claimed.reply.send(Ok(Response::Ack));

        assert_eq!(pending.await.unwrap(), Ok(()));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_link_loss_fails_pending_with_transport_error() {
        let (session, device) = kd_session(5_000);
        device.set_silent(true);

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.query_function().await })
        };
        while device.commands_received() == 0 {
            tokio::task::yield_now().await;
        }

        device.drop_link("out of range").await;
        assert!(matches!(
            pending.await.unwrap(),
            Err(SessionError::Transport(TransportError::LinkLost(_)))
        ));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_unsupported_command_for_family() {
        let (session, device) = kd_session(500);
        assert!(matches!(
            session.energy().await,
            Err(SessionError::Unsupported {
                family: DeviceFamily::Kd5811bt,
                ..
            })
        ));
        assert_eq!(device.commands_received(), 0);
    }

    #[tokio::test]
    async fn test_unsolicited_frame_is_reported() {
        let notices = Arc::new(Mutex::new(Vec::<SessionNotice>::new()));
        let observer: SessionObserver = {
            let notices = notices.clone();
            Arc::new(move |_session: &CommandSession, notice: SessionNotice| {
                notices.lock().push(notice)
            })
        };

        let codec: Arc<dyn FrameCodec> = Arc::new(Kn550ltCodec);
        let (link, device) =
            SimulatedDevice::spawn(codec.clone(), SimulatorProfile::default(), 23);
        let session = CommandSession::start(
            DeviceIdentifier::from("KN-1"),
            codec,
            link,
            config(500),
            Some(observer),
        );

        device.push_unsolicited(Response::Energy(40)).await;
        // A round trip guarantees the unsolicited frame was processed first.
        assert_eq!(session.energy().await, Ok(device.battery()));

        let notices = notices.lock();
        assert!(matches!(
            notices.first(),
            Some(SessionNotice::Unsolicited { detail }) if detail.contains("energy")
        ));
    }
}
