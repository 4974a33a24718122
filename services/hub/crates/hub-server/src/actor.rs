//! Device connection actor.
//!
//! One task per device, the only writer of that device's [`ConnectionState`].
//! It owns the live socket (through an outbound channel), authenticates it,
//! queues and delivers commands, caches telemetry and persists a snapshot
//! before it hibernates.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_protocol::{
    ApplyStatus, Auth, AuthFail, AuthOk, Command, CommandKind, CommandOutcome, CommandStatus,
    ErrorCode, ErrorPayload, Frame, Message, PROTOCOL_VERSION,
};
use hub_api_types::ConnectionView;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, HubError, StoreError};
use crate::events::DeviceEvent;
use crate::hub::{ActorView, ConnId, HubInner, Outbound, Shared, close_codes};
use crate::registry::{self, AuthVerdict};
use crate::snapshot::{ConnectionState, Snapshot};

/// Terminal commands kept in memory for polling.
const RECENT_COMMANDS: usize = 64;

const RESTORE_ATTEMPTS: u32 = 5;
const RESTORE_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) enum ActorMsg {
    Attach {
        conn: ConnId,
        owner_id: Option<String>,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    Frame {
        conn: ConnId,
        text: String,
    },
    Detach {
        conn: ConnId,
        reason: String,
    },
    Dispatch {
        command: Command,
        reply: oneshot::Sender<Result<Command, DispatchError>>,
    },
    View {
        reply: oneshot::Sender<Result<ActorView, HubError>>,
    },
    CommandRecord {
        command_id: String,
        reply: oneshot::Sender<Result<Option<Command>, HubError>>,
    },
    Delete {
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Hibernate {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Authenticating { deadline: Instant },
    Ready,
}

struct LiveConnection {
    id: ConnId,
    owner_id: Option<String>,
    tx: mpsc::UnboundedSender<Outbound>,
    phase: Phase,
    opened_at: DateTime<Utc>,
    last_frame_at: Instant,
}

impl LiveConnection {
    fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::Ready)
    }

    /// Queue a frame for the socket writer. False if the writer is gone.
    fn send(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(text) => self.tx.send(Outbound::Text(text)).is_ok(),
            Err(e) => {
                error!(kind = %frame.kind(), error = %e, "failed to encode outbound frame");
                false
            }
        }
    }

    fn close(&self, code: u16, reason: &str) {
        // The writer may already be gone; closing twice is harmless.
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Actor task entry point: restore state, then serve messages until retired.
pub(crate) async fn run(
    device_id: String,
    generation: u64,
    shared: Arc<Shared>,
    hub: Weak<HubInner>,
    mut rx: mpsc::UnboundedReceiver<ActorMsg>,
) {
    let state = match restore(&shared, &device_id).await {
        Ok(state) => state,
        Err(err) => {
            error!(device_id, error = %err, "failed to restore device state");
            refuse_all(&device_id, generation, &shared, &hub, &mut rx, &err).await;
            return;
        }
    };

    let actor = DeviceActor {
        device_id,
        generation,
        shared,
        hub,
        state,
        live: None,
        recent: VecDeque::new(),
        dirty: false,
        last_activity: Instant::now(),
    };
    actor.serve(rx).await;
}

async fn restore(shared: &Shared, device_id: &str) -> Result<ConnectionState, StoreError> {
    let mut delay = RESTORE_BACKOFF;
    let mut attempt = 1;
    loop {
        match shared.store.load_snapshot(device_id).await {
            Ok(Some(snapshot)) => {
                let state = snapshot.into_state();
                debug!(
                    device_id,
                    pending = state.pending_commands.len(),
                    "restored device state"
                );
                return Ok(state);
            }
            Ok(None) => return Ok(ConnectionState::new(device_id, Utc::now())),
            Err(err) if err.is_transient() && attempt < RESTORE_ATTEMPTS => {
                warn!(device_id, attempt, error = %err, "snapshot load failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Answer everything queued for a device whose state could not be loaded,
/// then leave the arena so the next request retries the load.
async fn refuse_all(
    device_id: &str,
    generation: u64,
    shared: &Shared,
    hub: &Weak<HubInner>,
    rx: &mut mpsc::UnboundedReceiver<ActorMsg>,
    err: &StoreError,
) {
    let reason = err.to_string();
    loop {
        while let Ok(msg) = rx.try_recv() {
            refuse(device_id, shared, msg, &reason).await;
        }
        let Some(hub) = hub.upgrade() else { return };
        if hub.retire(device_id, generation, rx) {
            return;
        }
        drop(hub);
        match rx.recv().await {
            Some(msg) => refuse(device_id, shared, msg, &reason).await,
            None => return,
        }
    }
}

async fn refuse(device_id: &str, shared: &Shared, msg: ActorMsg, reason: &str) {
    let unavailable = || HubError::StateUnavailable(reason.to_string());
    match msg {
        ActorMsg::Attach { outbound, .. } => {
            let _ = outbound.send(Outbound::Close {
                code: close_codes::INTERNAL,
                reason: "device state unavailable".to_string(),
            });
        }
        ActorMsg::Frame { .. } | ActorMsg::Detach { .. } => {}
        ActorMsg::Dispatch { reply, .. } => {
            let _ = reply.send(Err(unavailable().into()));
        }
        ActorMsg::View { reply } => {
            let _ = reply.send(Err(unavailable()));
        }
        ActorMsg::CommandRecord { reply, .. } => {
            let _ = reply.send(Err(unavailable()));
        }
        // Deleting is the way out of an unreadable snapshot.
        ActorMsg::Delete { reply } => {
            let result = shared.store.delete_snapshot(device_id).await;
            if result.is_ok() {
                info!(device_id, "deleted unreadable device state");
            }
            let _ = reply.send(result.map_err(HubError::from));
        }
        ActorMsg::Hibernate { reply } => {
            let _ = reply.send(());
        }
    }
}

struct DeviceActor {
    device_id: String,
    generation: u64,
    shared: Arc<Shared>,
    hub: Weak<HubInner>,
    state: ConnectionState,
    live: Option<LiveConnection>,
    recent: VecDeque<Command>,
    /// State differs from the last snapshot written.
    dirty: bool,
    last_activity: Instant,
}

impl DeviceActor {
    async fn serve(mut self, mut rx: mpsc::UnboundedReceiver<ActorMsg>) {
        let mut ticker = tokio::time::interval(self.shared.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wants_retire = tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.last_activity = Instant::now();
                    self.handle(msg).await
                }
                _ = ticker.tick() => self.on_tick().await,
            };
            if wants_retire && self.try_retire(&rx).await {
                return;
            }
        }

        // Channel closed: drained by shutdown or the hub was dropped.
        if self.dirty {
            if let Err(err) = self.persist().await {
                error!(device_id = %self.device_id, error = %err, "state lost at actor exit");
            }
        }
        debug!(device_id = %self.device_id, "device actor stopped");
    }

    /// Returns true when the actor should try to retire.
    async fn handle(&mut self, msg: ActorMsg) -> bool {
        match msg {
            ActorMsg::Attach {
                conn,
                owner_id,
                outbound,
            } => self.attach(conn, owner_id, outbound),
            ActorMsg::Frame { conn, text } => self.on_frame(conn, &text).await,
            ActorMsg::Detach { conn, reason } => self.detach(conn, &reason),
            ActorMsg::Dispatch { command, reply } => {
                let result = self.dispatch(command).await;
                let _ = reply.send(result);
            }
            ActorMsg::View { reply } => {
                let _ = reply.send(Ok(self.view()));
            }
            ActorMsg::CommandRecord { command_id, reply } => {
                let result = self.command_record(&command_id).await;
                let _ = reply.send(result);
            }
            ActorMsg::Delete { reply } => {
                let result = self.delete().await;
                let deleted = result.is_ok();
                let _ = reply.send(result);
                return deleted;
            }
            ActorMsg::Hibernate { reply } => {
                self.hibernate().await;
                let _ = reply.send(());
            }
        }
        false
    }

    async fn try_retire(&mut self, rx: &mpsc::UnboundedReceiver<ActorMsg>) -> bool {
        if self.live.is_some() {
            return false;
        }
        if self.dirty && self.persist().await.is_err() {
            return false;
        }
        let Some(hub) = self.hub.upgrade() else {
            return true;
        };
        let retired = hub.retire(&self.device_id, self.generation, rx);
        if retired {
            info!(
                device_id = %self.device_id,
                pending = self.state.pending_commands.len(),
                "device actor hibernated"
            );
        }
        retired
    }

    // ---------------------------------------------------------------
    // Socket lifecycle
    // ---------------------------------------------------------------

    fn attach(
        &mut self,
        conn: ConnId,
        owner_id: Option<String>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) {
        if let Some(old) = &self.live {
            info!(
                device_id = %self.device_id,
                old_conn = old.id,
                new_conn = conn,
                "replacing existing agent connection"
            );
        }
        self.drop_connection(close_codes::REPLACED, "replaced by a newer connection");

        let now = Instant::now();
        self.live = Some(LiveConnection {
            id: conn,
            owner_id,
            tx: outbound,
            phase: Phase::Authenticating {
                deadline: now + self.shared.settings.auth_timeout,
            },
            opened_at: Utc::now(),
            last_frame_at: now,
        });
        debug!(device_id = %self.device_id, conn, "socket attached, awaiting AUTH");
    }

    fn detach(&mut self, conn: ConnId, reason: &str) {
        if self.live.as_ref().is_some_and(|live| live.id == conn) {
            self.live = None;
            self.mark_unauthenticated();
            info!(device_id = %self.device_id, conn, reason, "agent disconnected");
            self.requeue_in_flight();
        }
    }

    fn drop_connection(&mut self, code: u16, reason: &str) {
        if let Some(live) = self.live.take() {
            live.close(code, reason);
            debug!(device_id = %self.device_id, conn = live.id, code, reason, "closing agent socket");
            self.mark_unauthenticated();
            self.requeue_in_flight();
        }
    }

    /// Idempotent commands sent on a socket that is now gone go back to
    /// pending, in place, for the next authenticated socket to resend.
    fn requeue_in_flight(&mut self) {
        let now = Utc::now();
        let mut requeued = 0usize;
        for cmd in &mut self.state.pending_commands {
            if cmd.requeue(now) {
                requeued += 1;
            }
        }
        if requeued > 0 {
            self.dirty = true;
            debug!(device_id = %self.device_id, requeued, "in-flight commands requeued for redelivery");
        }
    }

    fn mark_unauthenticated(&mut self) {
        if self.state.authenticated {
            self.state.authenticated = false;
            self.dirty = true;
        }
    }

    fn send(&self, frame: &Frame) -> bool {
        self.live.as_ref().is_some_and(|live| live.send(frame))
    }

    fn send_error(&self, code: ErrorCode, message: String, ref_id: &str) {
        self.send(&Frame::new(Message::error(code, message, Some(ref_id))));
    }

    // ---------------------------------------------------------------
    // Inbound frames
    // ---------------------------------------------------------------

    async fn on_frame(&mut self, conn: ConnId, text: &str) {
        let Some(live) = self.live.as_mut().filter(|live| live.id == conn) else {
            debug!(device_id = %self.device_id, conn, "dropping frame from stale socket");
            return;
        };
        live.last_frame_at = Instant::now();
        let ready = live.is_ready();

        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(device_id = %self.device_id, error = %err, "rejected inbound frame");
                if let Some(reply) = err.error_reply() {
                    self.send(&reply);
                }
                return;
            }
        };

        let kind = frame.kind();
        if !kind.accepted_by_cloud() {
            self.send_error(
                ErrorCode::UnexpectedDirection,
                format!("{kind} is not accepted by the hub"),
                &frame.id,
            );
            return;
        }

        if ready {
            self.state.last_seen = Some(Utc::now());
            self.dirty = true;
            self.on_ready_frame(frame).await;
            return;
        }
        match frame.message {
            Message::Auth(auth) => self.authenticate(&frame.id, auth).await,
            _ => self.send_error(
                ErrorCode::NotAuthenticated,
                format!("{kind} received before AUTH"),
                &frame.id,
            ),
        }
    }

    async fn authenticate(&mut self, request_id: &str, auth: Auth) {
        let owner_id = self.live.as_ref().and_then(|live| live.owner_id.clone());
        let verdict = if auth.device_id == self.device_id {
            match self.shared.registry.lookup(&self.device_id).await {
                Ok(record) => registry::verify(record.as_ref(), &auth.api_key, owner_id.as_deref()),
                Err(err) => {
                    error!(device_id = %self.device_id, error = %err, "registry lookup failed during AUTH");
                    self.drop_connection(close_codes::INTERNAL, "registry unavailable");
                    return;
                }
            }
        } else {
            AuthVerdict::DeviceMismatch
        };

        if verdict != AuthVerdict::Accepted {
            warn!(
                security = true,
                device_id = %self.device_id,
                claimed_device_id = %auth.device_id,
                reason = %verdict,
                "agent authentication failed"
            );
            self.send(&Frame::reply(
                request_id,
                Message::AuthFail(AuthFail {
                    error: verdict.public_reason().to_string(),
                }),
            ));
            self.drop_connection(close_codes::POLICY, "authentication failed");
            return;
        }

        let now = Utc::now();
        if let Some(live) = self.live.as_mut() {
            live.phase = Phase::Ready;
        }
        self.state.authenticated = true;
        self.state.protocol_version = Some(auth.protocol_version);
        self.state.firmware_version = Some(auth.firmware_version.clone());
        self.state.mode = Some(auth.mode);
        self.state.last_seen = Some(now);
        self.dirty = true;
        if let Err(err) = self.persist().await {
            warn!(device_id = %self.device_id, error = %err, "failed to persist authentication, will retry");
        }

        self.send(&Frame::reply(
            request_id,
            Message::AuthOk(AuthOk {
                server_time: now,
                protocol_version: PROTOCOL_VERSION,
            }),
        ));
        info!(
            device_id = %self.device_id,
            firmware_version = %auth.firmware_version,
            protocol_version = auth.protocol_version,
            mode = %auth.mode,
            "agent authenticated"
        );
        self.flush(now).await;
    }

    async fn on_ready_frame(&mut self, frame: Frame) {
        let now = Utc::now();
        if let Some(outcome) = frame.message.command_outcome() {
            if let Message::ModeAck(ack) = &frame.message {
                if ack.status == ApplyStatus::Applied {
                    self.state.mode = Some(ack.mode);
                }
            }
            self.complete(outcome, now).await;
            return;
        }

        match frame.message {
            Message::Status(telemetry) => {
                let status = telemetry.into_value();
                if self.ack_status_requests(&status, now) {
                    self.settle().await;
                }
                self.state.last_status = Some(status);
                self.record_telemetry("status").await;
                self.send(&Frame::reply(&frame.id, Message::StatusOk));
            }
            Message::Metrics(telemetry) => {
                self.state.last_metrics = Some(telemetry.into_value());
                self.record_telemetry("metrics").await;
            }
            Message::Ping => {
                self.send(&Frame::reply(&frame.id, Message::Pong));
            }
            Message::Pong => {}
            Message::Log(entry) => {
                self.publish(DeviceEvent::Log {
                    received_at: now,
                    entry,
                })
                .await;
            }
            Message::Alert(alert) => {
                self.publish(DeviceEvent::Alert {
                    received_at: now,
                    alert,
                })
                .await;
            }
            Message::Error(payload) => self.on_agent_error(payload, now).await,
            Message::Auth(_) => self.send_error(
                ErrorCode::AlreadyAuthenticated,
                "connection is already authenticated".to_string(),
                &frame.id,
            ),
            other => self.send_error(
                ErrorCode::UnexpectedDirection,
                format!("{} is not accepted by the hub", other.kind()),
                &frame.id,
            ),
        }
    }

    /// Cache writes are best effort; a failure leaves the state dirty and
    /// the write is retried with the next message or tick.
    async fn record_telemetry(&mut self, what: &'static str) {
        self.dirty = true;
        if let Err(err) = self.persist().await {
            warn!(device_id = %self.device_id, what, error = %err, "failed to persist telemetry, will retry");
        }
    }

    fn ack_status_requests(&mut self, status: &Value, now: DateTime<Utc>) -> bool {
        let mut acked = false;
        for cmd in self
            .state
            .pending_commands
            .iter_mut()
            .filter(|c| c.kind == CommandKind::StatusRequest && c.status == CommandStatus::Sent)
        {
            let outcome = CommandOutcome {
                command_id: cmd.command_id.clone(),
                status: CommandStatus::Acked,
                result: status.clone(),
            };
            cmd.complete(outcome, now);
            acked = true;
        }
        acked
    }

    async fn complete(&mut self, outcome: CommandOutcome, now: DateTime<Utc>) {
        let Some(cmd) = self
            .state
            .pending_commands
            .iter_mut()
            .find(|c| c.command_id == outcome.command_id && c.status == CommandStatus::Sent)
        else {
            warn!(
                device_id = %self.device_id,
                command_id = %outcome.command_id,
                "result for unknown or settled command ignored"
            );
            return;
        };
        cmd.complete(outcome, now);
        self.settle().await;
        if let Err(err) = self.persist().await {
            warn!(device_id = %self.device_id, error = %err, "failed to persist command result, will retry");
        }
    }

    async fn on_agent_error(&mut self, payload: ErrorPayload, now: DateTime<Utc>) {
        let target = payload.ref_id.as_deref().and_then(|ref_id| {
            self.state
                .pending_commands
                .iter_mut()
                .find(|c| c.command_id == ref_id && c.status == CommandStatus::Sent)
        });
        let Some(cmd) = target else {
            warn!(
                device_id = %self.device_id,
                code = ?payload.code,
                ref_id = ?payload.ref_id,
                message = %payload.message,
                "agent reported a protocol error"
            );
            return;
        };
        cmd.fail(
            CommandStatus::Failed,
            format!("agent rejected command: {}", payload.message),
            now,
        );
        self.settle().await;
        if let Err(err) = self.persist().await {
            warn!(device_id = %self.device_id, error = %err, "failed to persist command result, will retry");
        }
    }

    async fn publish(&self, event: DeviceEvent) {
        match &event {
            DeviceEvent::Log { entry, .. } => info!(
                device_id = %self.device_id,
                level = ?entry.level,
                source = entry.source.as_deref().unwrap_or("-"),
                message = %entry.message,
                "agent log"
            ),
            DeviceEvent::Alert { alert, .. } => warn!(
                device_id = %self.device_id,
                severity = ?alert.severity,
                code = %alert.code,
                message = %alert.message,
                "agent alert"
            ),
        }
        if let Err(err) = self.shared.events.publish(&self.device_id, &event).await {
            warn!(device_id = %self.device_id, error = %err, "event sink write failed");
        }
    }

    // ---------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------

    async fn dispatch(&mut self, mut command: Command) -> Result<Command, DispatchError> {
        let now = Utc::now();
        self.expire(now).await;

        let depth = self.state.pending_commands.len();
        if depth >= self.shared.settings.max_queue_depth {
            warn!(device_id = %self.device_id, depth, "command queue full");
            return Err(DispatchError::QueueFull { depth });
        }

        self.state.pending_commands.push_back(command.clone());
        if let Err(source) = self.persist().await {
            self.state.pending_commands.pop_back();
            error!(
                device_id = %self.device_id,
                command_id = %command.command_id,
                error = %source,
                "failed to persist queued command"
            );
            command.fail(
                CommandStatus::Failed,
                format!("queue write failed: {source}"),
                now,
            );
            if let Err(err) = self.shared.store.save_command(&self.device_id, &command).await {
                debug!(device_id = %self.device_id, error = %err, "failed command record not stored");
            }
            self.remember(command.clone());
            return Err(DispatchError::Storage {
                command: Box::new(command),
                source,
            });
        }

        info!(
            device_id = %self.device_id,
            command_id = %command.command_id,
            kind = ?command.kind,
            ready = self.live.as_ref().is_some_and(LiveConnection::is_ready),
            "command queued"
        );
        self.flush(now).await;
        Ok(self
            .find_command(&command.command_id)
            .cloned()
            .unwrap_or(command))
    }

    /// Push every pending command, oldest first, down a ready socket.
    async fn flush(&mut self, now: DateTime<Utc>) {
        self.expire(now).await;
        let Some(live) = self.live.as_ref().filter(|live| live.is_ready()) else {
            return;
        };

        let mut changed = false;
        for cmd in self
            .state
            .pending_commands
            .iter_mut()
            .filter(|c| c.status == CommandStatus::Pending)
        {
            match cmd.to_frame() {
                Ok(frame) => {
                    if !live.send(&frame) {
                        break;
                    }
                    cmd.mark_sent(now);
                    debug!(device_id = %self.device_id, command_id = %cmd.command_id, "command sent");
                }
                Err(err) => cmd.fail(CommandStatus::Failed, err.to_string(), now),
            }
            changed = true;
        }

        if changed {
            self.settle().await;
            if let Err(err) = self.persist().await {
                warn!(device_id = %self.device_id, error = %err, "failed to persist sent commands, will retry");
            }
        }
    }

    async fn expire(&mut self, now: DateTime<Utc>) {
        let mut expired = 0usize;
        for cmd in self
            .state
            .pending_commands
            .iter_mut()
            .filter(|c| c.is_expired(now))
        {
            let reason = if cmd.status == CommandStatus::Pending {
                "expired before delivery"
            } else {
                "no result before expiry"
            };
            cmd.fail(CommandStatus::TimedOut, reason, now);
            expired += 1;
        }
        if expired > 0 {
            info!(device_id = %self.device_id, expired, "commands timed out");
            self.settle().await;
        }
    }

    /// Move terminal commands out of the queue and record them.
    async fn settle(&mut self) {
        let (done, keep): (VecDeque<Command>, VecDeque<Command>) =
            std::mem::take(&mut self.state.pending_commands)
                .into_iter()
                .partition(|c| c.status.is_terminal());
        self.state.pending_commands = keep;
        if done.is_empty() {
            return;
        }
        self.dirty = true;
        for cmd in done {
            info!(
                device_id = %self.device_id,
                command_id = %cmd.command_id,
                kind = ?cmd.kind,
                status = ?cmd.status,
                "command settled"
            );
            if let Err(err) = self.shared.store.save_command(&self.device_id, &cmd).await {
                warn!(device_id = %self.device_id, command_id = %cmd.command_id, error = %err, "failed to store command record");
            }
            self.remember(cmd);
        }
    }

    fn remember(&mut self, command: Command) {
        self.recent.push_back(command);
        while self.recent.len() > RECENT_COMMANDS {
            self.recent.pop_front();
        }
    }

    fn find_command(&self, command_id: &str) -> Option<&Command> {
        self.state
            .pending_commands
            .iter()
            .chain(self.recent.iter().rev())
            .find(|c| c.command_id == command_id)
    }

    async fn command_record(&self, command_id: &str) -> Result<Option<Command>, HubError> {
        if let Some(cmd) = self.find_command(command_id) {
            return Ok(Some(cmd.clone()));
        }
        Ok(self
            .shared
            .store
            .load_command(&self.device_id, command_id)
            .await?)
    }

    // ---------------------------------------------------------------
    // State
    // ---------------------------------------------------------------

    fn view(&self) -> ActorView {
        let ready = self.live.as_ref().is_some_and(LiveConnection::is_ready);
        let window = self.shared.settings.liveness_window;
        let recently_seen = self.state.last_seen.is_some_and(|seen| {
            // A clock step backwards counts as recent.
            !(Utc::now() - seen).to_std().is_ok_and(|age| age >= window)
        });
        ActorView {
            connection: ConnectionView {
                ready,
                online: ready || recently_seen,
                authenticated: self.state.authenticated,
                protocol_version: self.state.protocol_version,
                firmware_version: self.state.firmware_version.clone(),
                mode: self.state.mode,
                last_seen: self.state.last_seen,
                connected_since: self.live.as_ref().map(|live| live.opened_at),
                created_at: self.state.created_at,
                pending_commands: self.state.pending_commands.len(),
            },
            status: self.state.last_status.clone(),
            metrics: self.state.last_metrics.clone(),
        }
    }

    async fn persist(&mut self) -> Result<(), StoreError> {
        match self
            .shared
            .store
            .save_snapshot(&Snapshot::capture(&self.state))
            .await
        {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(err) => {
                self.dirty = true;
                Err(err)
            }
        }
    }

    async fn delete(&mut self) -> Result<(), HubError> {
        let now = Utc::now();
        self.shared.store.delete_snapshot(&self.device_id).await?;
        self.drop_connection(close_codes::NORMAL, "device deleted");
        for cmd in &mut self.state.pending_commands {
            cmd.fail(CommandStatus::Failed, "device deleted", now);
        }
        self.settle().await;
        self.state = ConnectionState::new(&self.device_id, now);
        self.dirty = false;
        info!(device_id = %self.device_id, "device state deleted");
        Ok(())
    }

    async fn hibernate(&mut self) {
        self.drop_connection(close_codes::RESTART, "hub restarting");
        if let Err(err) = self.persist().await {
            error!(device_id = %self.device_id, error = %err, "failed to persist state at shutdown");
        }
    }

    /// Returns true when the actor is idle long enough to hibernate.
    async fn on_tick(&mut self) -> bool {
        let now = Instant::now();
        let settings = &self.shared.settings;
        let timed_out = self.live.as_ref().and_then(|live| match live.phase {
            Phase::Authenticating { deadline } if now >= deadline => {
                warn!(security = true, device_id = %self.device_id, conn = live.id, "no AUTH within the authentication window");
                Some((close_codes::AUTH_TIMEOUT, "authentication timeout"))
            }
            Phase::Ready if now.duration_since(live.last_frame_at) >= settings.liveness_window => {
                warn!(device_id = %self.device_id, conn = live.id, "liveness window elapsed without traffic");
                Some((close_codes::LIVENESS, "liveness timeout"))
            }
            _ => None,
        });
        if let Some((code, reason)) = timed_out {
            self.drop_connection(code, reason);
        }

        self.expire(Utc::now()).await;
        if self.dirty {
            if let Err(err) = self.persist().await {
                debug!(device_id = %self.device_id, error = %err, "snapshot retry failed");
            }
        }
        self.live.is_none() && self.last_activity.elapsed() >= self.shared.settings.idle_hibernate
    }
}
