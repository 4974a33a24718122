//! Agent connection manager: one socket to the hub, redialled with backoff.
//!
//! A single task owns the read half and every timer. Writes go through one
//! unbounded channel to a writer task, so heartbeats, telemetry and command
//! results never interleave on the wire. Firmware work runs on the
//! dispatcher's pool and comes back through the results channel.

use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{ApplyStatus, Auth, ErrorCode, Frame, Message, ModeAck, PROTOCOL_VERSION};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::AgentConfig;
use crate::dispatcher::{Dispatcher, FirmwareCommand};
use crate::firmware::Firmware;
use crate::pool::WorkerPool;
use crate::session::{AgentSession, SessionEvent, SocketState};
use crate::telemetry::ProcProbe;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// How a connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    /// Redial after backoff.
    Retry,
    Shutdown,
}

/// Outgoing half of a live socket.
struct Outbox {
    tx: mpsc::UnboundedSender<WsMessage>,
    task: JoinHandle<()>,
}

impl Outbox {
    fn spawn(mut sink: futures_util::stream::SplitSink<WsStream, WsMessage>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, WsMessage::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "socket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        Self { tx, task }
    }

    fn send(&self, frame: &Frame) {
        match frame.encode() {
            Ok(text) => {
                if self.tx.send(WsMessage::text(text)).is_err() {
                    debug!(kind = %frame.kind(), "writer gone, frame dropped");
                }
            }
            Err(e) => warn!(kind = %frame.kind(), error = %e, "failed to encode frame"),
        }
    }

    /// Send a close frame and wait briefly for the writer to flush it.
    async fn close(self, code: CloseCode, reason: &'static str) {
        let _ = self.tx.send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })));
        drop(self.tx);
        let mut task = self.task;
        if tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
            task.abort();
        }
    }
}

/// Wait until shutdown is requested (or its sender is gone).
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub struct ConnectionManager {
    config: AgentConfig,
    session: AgentSession,
    backoff: Backoff,
    dispatcher: Dispatcher,
    results: mpsc::UnboundedReceiver<Frame>,
    probe: ProcProbe,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: AgentConfig, firmware: Arc<Firmware>) -> Self {
        let (results_tx, results) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            firmware,
            WorkerPool::new(config.max_concurrent_ops),
            results_tx,
        );
        let session = AgentSession::new(
            config.device_id.clone(),
            config.owner_id.clone(),
            config.api_key.clone(),
            config.firmware_version.clone(),
            config.mode,
        );
        Self {
            backoff: Backoff::new(config.backoff_base, config.backoff_cap),
            probe: ProcProbe::new(config.proc_root.clone()),
            config,
            session,
            dispatcher,
            results,
        }
    }

    #[must_use]
    pub fn session(&self) -> &AgentSession {
        &self.session
    }

    /// Keep a session to the hub until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            device_id = %self.session.device_id,
            url = %self.config.ws_url(),
            mode = %self.session.mode,
            "connection manager started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.connect_once(&mut shutdown).await == Ended::Shutdown {
                break;
            }

            let delay = self.backoff.next_delay();
            info!(
                attempt = self.backoff.attempt(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnecting after backoff"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = stopped(&mut shutdown) => break,
            }
        }
        self.event(SessionEvent::Shutdown);
        info!("connection manager stopped");
    }

    fn event(&mut self, event: SessionEvent) {
        if let Err(e) = self.session.apply(event) {
            warn!(error = %e, "ignored session event");
        }
    }

    async fn connect_once(&mut self, shutdown: &mut watch::Receiver<bool>) -> Ended {
        self.event(SessionEvent::Dial);
        let url = self.config.ws_url();
        debug!(%url, "dialling hub");

        let connect = tokio::time::timeout(
            self.config.auth_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        let stream = tokio::select! {
            result = connect => match result {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(e)) => {
                    warn!(error = %e, "connect failed");
                    self.event(SessionEvent::ConnectFailed);
                    return Ended::Retry;
                }
                Err(_) => {
                    warn!("connect timed out");
                    self.event(SessionEvent::ConnectFailed);
                    return Ended::Retry;
                }
            },
            () = stopped(shutdown) => {
                self.event(SessionEvent::ConnectFailed);
                return Ended::Shutdown;
            }
        };
        self.event(SessionEvent::Upgraded);

        let (sink, mut reader) = stream.split();
        let outbox = Outbox::spawn(sink);

        let auth = Frame::new(Message::Auth(Auth {
            device_id: self.session.device_id.clone(),
            api_key: self.session.api_key().to_string(),
            firmware_version: self.session.firmware_version.clone(),
            protocol_version: PROTOCOL_VERSION,
            mode: self.session.mode,
        }));
        outbox.send(&auth);

        let verdict = tokio::select! {
            verdict = tokio::time::timeout(self.config.auth_timeout, await_auth(&mut reader, &outbox)) => Some(verdict),
            () = stopped(shutdown) => None,
        };
        let Some(verdict) = verdict else {
            outbox.close(CloseCode::Away, "agent shutting down").await;
            return Ended::Shutdown;
        };
        match verdict {
            Ok(AuthVerdict::Accepted { protocol_version }) => {
                self.event(SessionEvent::AuthAccepted);
                self.backoff.reset();
                info!(protocol_version, "authenticated with hub");
            }
            Ok(AuthVerdict::Rejected(reason)) => {
                warn!(security = true, reason = %reason, "hub rejected authentication");
                self.event(SessionEvent::AuthRejected);
                outbox.close(CloseCode::Policy, "authentication rejected").await;
                return Ended::Retry;
            }
            Ok(AuthVerdict::Lost) => {
                self.event(SessionEvent::TransportLost);
                outbox.close(CloseCode::Normal, "").await;
                return Ended::Retry;
            }
            Err(_) => {
                warn!(timeout_secs = self.config.auth_timeout.as_secs(), "no reply to AUTH");
                self.event(SessionEvent::AuthTimedOut);
                outbox.close(CloseCode::Policy, "authentication timed out").await;
                return Ended::Retry;
            }
        }

        let ended = self.ready(&mut reader, &outbox, shutdown).await;
        let (code, reason) = match ended {
            Ended::Shutdown => (CloseCode::Away, "agent shutting down"),
            Ended::Retry => (CloseCode::Normal, ""),
        };
        outbox.close(code, reason).await;
        ended
    }

    /// The Ready phase: heartbeats, telemetry, inbound frames, results.
    async fn ready(
        &mut self,
        reader: &mut WsReader,
        outbox: &Outbox,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Ended {
        self.send_status(outbox, None).await;

        let start = Instant::now();
        let mut ping = interval_at(start + self.config.ping_interval, self.config.ping_interval);
        let mut status = interval_at(start + self.config.status_interval, self.config.status_interval);
        let mut metrics = interval_at(start + self.config.metrics_interval, self.config.metrics_interval);
        for timer in [&mut ping, &mut status, &mut metrics] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        let mut last_inbound = Instant::now();

        loop {
            let deadline = last_inbound + self.config.liveness_window;
            tokio::select! {
                () = stopped(shutdown) => return Ended::Shutdown,
                inbound = reader.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_inbound = Instant::now();
                        self.on_text(text.as_str(), outbox).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "hub closed the connection");
                        self.event(SessionEvent::TransportLost);
                        return Ended::Retry;
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        last_inbound = Instant::now();
                        warn!("binary frame dropped");
                    }
                    Some(Ok(_)) => last_inbound = Instant::now(),
                    Some(Err(e)) => {
                        warn!(error = %e, "socket error");
                        self.event(SessionEvent::TransportLost);
                        return Ended::Retry;
                    }
                    None => {
                        info!("socket closed");
                        self.event(SessionEvent::TransportLost);
                        return Ended::Retry;
                    }
                },
                Some(result) = self.results.recv() => outbox.send(&result),
                _ = ping.tick() => outbox.send(&Frame::new(Message::Ping)),
                _ = status.tick() => self.send_status(outbox, None).await,
                _ = metrics.tick() => {
                    let metrics = self.probe.metrics().await;
                    outbox.send(&Frame::new(Message::Metrics(metrics)));
                }
                () = sleep_until(deadline) => {
                    warn!(window_secs = self.config.liveness_window.as_secs(), "no traffic from hub within liveness window");
                    self.event(SessionEvent::LivenessExpired);
                    return Ended::Retry;
                }
            }
        }
    }

    async fn send_status(&self, outbox: &Outbox, reply_to: Option<&str>) {
        let status = Message::Status(
            self.probe
                .status(&self.session.firmware_version, self.session.mode)
                .await,
        );
        let frame = match reply_to {
            Some(id) => Frame::reply(id, status),
            None => Frame::new(status),
        };
        outbox.send(&frame);
    }

    async fn on_text(&mut self, text: &str, outbox: &Outbox) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "rejected inbound frame");
                if let Some(reply) = e.error_reply() {
                    outbox.send(&reply);
                }
                return;
            }
        };

        let kind = frame.kind();
        if !kind.accepted_by_agent() {
            outbox.send(&Frame::new(Message::error(
                ErrorCode::UnexpectedDirection,
                format!("{kind} is not accepted by the agent"),
                Some(&frame.id),
            )));
            return;
        }

        let Frame { id, message } = frame;
        match message {
            Message::Ping => outbox.send(&Frame::reply(&id, Message::Pong)),
            Message::Pong | Message::StatusOk => {}
            Message::StatusRequest => self.send_status(outbox, Some(&id)).await,
            Message::ModeUpdate(update) => {
                let previous = self.session.mode;
                self.session.mode = update.mode;
                info!(from = %previous, to = %update.mode, "mode updated");
                outbox.send(&Frame::reply(
                    &id,
                    Message::ModeAck(ModeAck {
                        command_id: update.command_id,
                        mode: update.mode,
                        status: ApplyStatus::Applied,
                    }),
                ));
            }
            Message::AuthOk(_) | Message::AuthFail(_) => {
                debug!(%kind, "auth reply outside the handshake ignored");
            }
            Message::Error(err) => {
                warn!(code = ?err.code, error = %err.message, ref_id = ?err.ref_id, "hub reported an error");
            }
            other => match FirmwareCommand::from_message(other) {
                Ok(command) => self.dispatcher.dispatch(&id, command, self.session.mode),
                Err(other) => outbox.send(&Frame::new(Message::error(
                    ErrorCode::UnexpectedDirection,
                    format!("{} is not accepted by the agent", other.kind()),
                    Some(&id),
                ))),
            },
        }
    }

    #[must_use]
    pub fn state(&self) -> SocketState {
        self.session.state()
    }
}

enum AuthVerdict {
    Accepted { protocol_version: u32 },
    Rejected(String),
    Lost,
}

/// Read frames until the hub answers AUTH. Anything else is dropped.
async fn await_auth(reader: &mut WsReader, outbox: &Outbox) -> AuthVerdict {
    while let Some(inbound) = reader.next().await {
        let text = match inbound {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(frame)) => {
                info!(?frame, "hub closed the connection during AUTH");
                return AuthVerdict::Lost;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "socket error during AUTH");
                return AuthVerdict::Lost;
            }
        };
        match Frame::decode(text.as_str()) {
            Ok(Frame {
                message: Message::AuthOk(ok),
                ..
            }) => {
                return AuthVerdict::Accepted {
                    protocol_version: ok.protocol_version,
                };
            }
            Ok(Frame {
                message: Message::AuthFail(fail),
                ..
            }) => return AuthVerdict::Rejected(fail.error),
            Ok(Frame {
                id,
                message: Message::Ping,
            }) => outbox.send(&Frame::reply(&id, Message::Pong)),
            Ok(frame) => debug!(kind = %frame.kind(), "frame before AUTH_OK dropped"),
            Err(e) => debug!(error = %e, "undecodable frame before AUTH_OK dropped"),
        }
    }
    AuthVerdict::Lost
}
