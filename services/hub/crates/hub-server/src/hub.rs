//! Arena of per-device actors.
//!
//! The arena maps `device_id` to the sending half of that device's actor
//! channel. The map lock is a plain mutex held only for lookup, insert and
//! remove; every message is enqueued while it is held so an actor can
//! retire (hibernate) only when nothing is in flight to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fleet_protocol::{Command, CommandKind, defaults, limits, validate_device_id};
use hub_api_types::ConnectionView;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::actor::{self, ActorMsg};
use crate::error::{DispatchError, HubError};
use crate::events::EventSink;
use crate::registry::DeviceRegistry;
use crate::store::SnapshotStore;

/// WebSocket close codes sent to agents.
pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const POLICY: u16 = 1008;
    pub const INTERNAL: u16 = 1011;
    pub const RESTART: u16 = 1012;
    pub const REPLACED: u16 = 4000;
    pub const AUTH_TIMEOUT: u16 = 4001;
    pub const LIVENESS: u16 = 4002;
}

/// Identifies one accepted socket.
pub type ConnId = u64;

/// What an actor asks the socket writer to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Tunables for device actors.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub auth_timeout: Duration,
    pub liveness_window: Duration,
    pub max_queue_depth: usize,
    /// Idle time without a socket before an actor hibernates.
    pub idle_hibernate: Duration,
    pub tick_interval: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(defaults::AUTH_TIMEOUT_SECS),
            liveness_window: Duration::from_secs(defaults::LIVENESS_WINDOW_SECS),
            max_queue_depth: limits::MAX_QUEUE_DEPTH,
            idle_hibernate: Duration::from_secs(300),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Collaborators shared by every actor.
pub(crate) struct Shared {
    pub settings: HubSettings,
    pub store: Arc<dyn SnapshotStore>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub events: Arc<dyn EventSink>,
}

struct ActorEntry {
    generation: u64,
    tx: mpsc::UnboundedSender<ActorMsg>,
}

pub(crate) struct HubInner {
    actors: Mutex<HashMap<String, ActorEntry>>,
    shared: Arc<Shared>,
    next_conn: AtomicU64,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
}

/// An accepted agent socket: its id and the frames the actor wants written.
pub struct AgentConnection {
    pub id: ConnId,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

/// Read-only state of one device as seen by its actor.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorView {
    pub connection: ConnectionView,
    pub status: Option<Value>,
    pub metrics: Option<Value>,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    #[must_use]
    pub fn new(
        settings: HubSettings,
        store: Arc<dyn SnapshotStore>,
        registry: Arc<dyn DeviceRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                actors: Mutex::new(HashMap::new()),
                shared: Arc::new(Shared {
                    settings,
                    store,
                    registry,
                    events,
                }),
                next_conn: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &HubSettings {
        &self.inner.shared.settings
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.inner.shared.registry
    }

    /// Number of actors currently resident (not hibernated).
    #[must_use]
    pub fn live_actors(&self) -> usize {
        self.inner.actors().len()
    }

    /// Bind a new socket to a device. Any older socket for the device is
    /// closed by the actor before this one is accepted.
    pub fn open_connection(
        &self,
        device_id: &str,
        owner_id: Option<String>,
    ) -> Result<AgentConnection, HubError> {
        let id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, outbound) = mpsc::unbounded_channel();
        self.send(
            device_id,
            ActorMsg::Attach {
                conn: id,
                owner_id,
                outbound: tx,
            },
        )?;
        Ok(AgentConnection { id, outbound })
    }

    /// Forward one inbound text frame.
    pub fn inbound(&self, device_id: &str, conn: ConnId, text: String) -> Result<(), HubError> {
        self.send(device_id, ActorMsg::Frame { conn, text })
    }

    /// Report that a socket has gone away. Safe to call more than once.
    pub fn close_connection(&self, device_id: &str, conn: ConnId, reason: &str) {
        if let Err(e) = self.send(
            device_id,
            ActorMsg::Detach {
                conn,
                reason: reason.to_string(),
            },
        ) {
            tracing::debug!(device_id, conn, error = %e, "detach not delivered");
        }
    }

    /// Queue a command for a device and push it if the device is ready.
    pub async fn dispatch(
        &self,
        device_id: &str,
        kind: CommandKind,
        payload: Value,
        ttl: chrono::Duration,
    ) -> Result<Command, DispatchError> {
        validate_device_id(device_id).map_err(HubError::InvalidDeviceId)?;
        let command = Command::new(kind, payload, ttl, chrono::Utc::now())?;
        let (reply, rx) = oneshot::channel();
        self.send(device_id, ActorMsg::Dispatch { command, reply })?;
        rx.await.map_err(|_| HubError::ActorStopped)?
    }

    pub async fn view(&self, device_id: &str) -> Result<ActorView, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(device_id, ActorMsg::View { reply })?;
        rx.await.map_err(|_| HubError::ActorStopped)?
    }

    /// A command record, whether still queued or already terminal.
    pub async fn command(
        &self,
        device_id: &str,
        command_id: &str,
    ) -> Result<Option<Command>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            device_id,
            ActorMsg::CommandRecord {
                command_id: command_id.to_string(),
                reply,
            },
        )?;
        rx.await.map_err(|_| HubError::ActorStopped)?
    }

    /// Destroy a device's connection state and fail its queued commands.
    pub async fn delete(&self, device_id: &str) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(device_id, ActorMsg::Delete { reply })?;
        rx.await.map_err(|_| HubError::ActorStopped)?
    }

    /// Hibernate every resident actor. Sockets are closed with 1012 so
    /// agents reconnect to the next instance. New work is refused afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let entries: Vec<(String, ActorEntry)> = self.inner.actors().drain().collect();
        tracing::info!(actors = entries.len(), "hibernating device actors");

        let mut waiting = Vec::with_capacity(entries.len());
        for (device_id, entry) in entries {
            let (reply, rx) = oneshot::channel();
            if entry.tx.send(ActorMsg::Hibernate { reply }).is_ok() {
                waiting.push((device_id, rx));
            }
        }
        for (device_id, rx) in waiting {
            if rx.await.is_err() {
                tracing::warn!(device_id, "actor stopped before confirming hibernation");
            }
        }
    }

    /// Enqueue a message, starting (restoring) the actor if it is not resident.
    fn send(&self, device_id: &str, msg: ActorMsg) -> Result<(), HubError> {
        validate_device_id(device_id).map_err(HubError::InvalidDeviceId)?;
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(HubError::ShuttingDown);
        }
        let mut actors = self.inner.actors();
        let msg = match actors.get(device_id) {
            Some(entry) => match entry.tx.send(msg) {
                Ok(()) => return Ok(()),
                // Actor task ended without retiring; replace it below.
                Err(mpsc::error::SendError(msg)) => msg,
            },
            None => msg,
        };
        let entry = self.spawn_actor(device_id);
        entry
            .tx
            .send(msg)
            .map_err(|_| HubError::ActorStopped)?;
        actors.insert(device_id.to_string(), entry);
        Ok(())
    }

    fn spawn_actor(&self, device_id: &str) -> ActorEntry {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(actor::run(
            device_id.to_string(),
            generation,
            Arc::clone(&self.inner.shared),
            Arc::downgrade(&self.inner),
            rx,
        ));
        tracing::debug!(device_id, generation, "device actor started");
        ActorEntry { generation, tx }
    }
}

impl HubInner {
    fn actors(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActorEntry>> {
        self.actors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove an actor from the arena if it is still the registered
    /// generation and nothing is queued for it. Returns whether it retired.
    pub(crate) fn retire(
        &self,
        device_id: &str,
        generation: u64,
        rx: &mpsc::UnboundedReceiver<ActorMsg>,
    ) -> bool {
        let mut actors = self.actors();
        match actors.get(device_id) {
            Some(entry) if entry.generation == generation => {
                if !rx.is_empty() {
                    return false;
                }
                actors.remove(device_id);
                true
            }
            // Drained by shutdown: keep running until the channel closes.
            _ => false,
        }
    }
}
