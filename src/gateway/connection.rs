use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::{self, CloseDisposition, Frame};
use super::session::{ConnectionState, Session};
use super::{EventSink, GatewayConfig};
use crate::backoff::Backoff;
use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::http::{Request, RequestPipeline};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signals from the heartbeat task to the read loop.
#[derive(Debug, PartialEq, Eq)]
enum Control {
    /// A beat came due before the previous one was acknowledged
    Zombie,
    /// The writer task is gone, so beats can no longer be sent
    WriterClosed,
}

/// How one socket's lifetime ended.
enum LinkEnd {
    Shutdown,
    Reconnect {
        resume: bool,
        immediate: bool,
        reason: String,
    },
    Fatal(Error),
}

/// One open websocket: read half, writer task, heartbeat task.
struct Link {
    frames: SplitStream<WsStream>,
    outbound: mpsc::UnboundedSender<Message>,
    control: mpsc::UnboundedReceiver<Control>,
    acked: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn send(&self, frame: &Frame) -> Result<()> {
        let text = frame.to_json()?;
        self.outbound
            .send(Message::text(text))
            .map_err(|_| Error::ConnectionLost {
                attempts: 0,
                reason: "gateway writer stopped".to_string(),
            })
    }

    /// Stop heartbeats and let the writer flush, optionally after a close frame.
    fn finish(self, close: Option<CloseFrame>) {
        self.heartbeat.abort();
        if let Some(frame) = close {
            let _ = self.outbound.send(Message::Close(Some(frame)));
        }
        drop(self.outbound);
        drop(self.writer);
    }
}

/// Cloneable handle that asks a running connection to shut down.
#[derive(Clone)]
pub struct GatewayCloser {
    shutdown: Arc<watch::Sender<bool>>,
}

impl GatewayCloser {
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Durable streaming session to the gateway.
pub struct GatewayConnection {
    config: GatewayConfig,
    credentials: Credentials,
    pipeline: Option<Arc<RequestPipeline>>,
    session: Session,
    /// Last sequence, shared with the heartbeat task. Zero means none yet.
    sequence: Arc<AtomicU64>,
    gateway_url: Option<String>,
    link: Option<Link>,
    /// Events received by `connect` before `run` was given a sink
    pending: Vec<Event>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    backoff: Backoff,
}

/// Collects events while no sink is attached yet.
struct Buffer(Mutex<Vec<Event>>);

impl EventSink for Buffer {
    fn send_event(&self, event: Event) -> bool {
        self.0.lock().unwrap().push(event);
        true
    }
}

impl GatewayConnection {
    /// `pipeline` is used to look up the gateway URL when none is configured.
    pub fn new(
        config: GatewayConfig,
        credentials: Credentials,
        pipeline: Option<Arc<RequestPipeline>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backoff = Backoff::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        );

        Self {
            config,
            credentials,
            pipeline,
            session: Session::default(),
            sequence: Arc::new(AtomicU64::new(0)),
            gateway_url: None,
            link: None,
            pending: Vec::new(),
            state_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            backoff,
        }
    }

    pub fn closer(&self) -> GatewayCloser {
        GatewayCloser {
            shutdown: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Read-only view of the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Open the socket and complete the handshake through READY.
    pub async fn connect(&mut self) -> Result<Session> {
        let mut link = self.open_link().await?;
        let buffer = Buffer(Mutex::new(Vec::new()));

        while self.current_state() != ConnectionState::Connected {
            let step = self.step(&mut link, &buffer).await;
            if let Some(end) = step {
                link.finish(None);
                self.pending.extend(buffer.0.into_inner().unwrap_or_default());
                return Err(match end {
                    LinkEnd::Fatal(e) => e,
                    LinkEnd::Shutdown => Error::ConnectionLost {
                        attempts: 0,
                        reason: "closed during handshake".to_string(),
                    },
                    LinkEnd::Reconnect { reason, .. } => Error::ConnectionLost {
                        attempts: 0,
                        reason,
                    },
                });
            }
        }

        self.pending.extend(buffer.0.into_inner().unwrap_or_default());
        self.link = Some(link);
        Ok(self.session.clone())
    }

    /// Forward events to `sink` until closed or a fatal error.
    ///
    /// Dropped connections are resumed when possible, with at most
    /// `max_reconnect_attempts` consecutive failed attempts.
    pub async fn run<S: EventSink + ?Sized>(&mut self, sink: &S) -> Result<()> {
        for event in self.pending.drain(..) {
            sink.send_event(event);
        }

        let mut attempts = 0u32;
        let mut failed_resumes = 0u32;
        let mut resuming = false;
        let mut immediate = true;
        let mut last_reason = String::from("not connected");

        loop {
            let link = match self.link.take() {
                Some(link) => link,
                None => {
                    if attempts >= self.config.max_reconnect_attempts {
                        self.session.clear();
                        self.set_state(ConnectionState::Closed);
                        warn!(attempts = attempts, reason = %last_reason, "Giving up on gateway");
                        return Err(Error::ConnectionLost {
                            attempts,
                            reason: last_reason,
                        });
                    }
                    attempts += 1;

                    if !immediate {
                        let delay = self.backoff.jittered(attempts);
                        info!(
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            resumable = self.session.is_resumable(),
                            "Reconnecting to gateway"
                        );
                        let mut shutdown = self.shutdown_rx.clone();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = wait_closed(&mut shutdown) => {
                                self.session.clear();
                                self.set_state(ConnectionState::Closed);
                                return Ok(());
                            }
                        }
                    }

                    resuming = self.session.is_resumable();
                    match self.open_link().await {
                        Ok(link) => link,
                        Err(e) if e.is_fatal() || matches!(e, Error::Config(_)) => {
                            self.set_state(ConnectionState::Closed);
                            return Err(e);
                        }
                        Err(e) => {
                            warn!(attempt = attempts, error = %e, "Gateway connect failed");
                            if resuming {
                                self.resume_failed(&mut failed_resumes);
                            }
                            last_reason = e.to_string();
                            immediate = false;
                            continue;
                        }
                    }
                }
            };

            let (end, reached_ready) = self.drive(link, sink).await;
            if reached_ready {
                attempts = 0;
                failed_resumes = 0;
            } else if resuming {
                self.resume_failed(&mut failed_resumes);
            }
            resuming = false;

            match end {
                LinkEnd::Shutdown => {
                    info!("Gateway connection closed");
                    self.session.clear();
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
                LinkEnd::Fatal(e) => {
                    warn!(error = %e, "Gateway failed fatally");
                    self.session.clear();
                    self.set_state(ConnectionState::Closed);
                    return Err(e);
                }
                LinkEnd::Reconnect {
                    resume,
                    immediate: now,
                    reason,
                } => {
                    if !resume {
                        self.forget_session();
                    }
                    warn!(resume = resume, reason = %reason, "Gateway connection lost");
                    self.set_state(ConnectionState::Disconnected);
                    immediate = now;
                    last_reason = reason;
                }
            }
        }
    }

    /// Count a RESUME that never reached RESUMED. Past the limit the session is
    /// dropped and the next connection identifies.
    fn resume_failed(&mut self, failed: &mut u32) {
        *failed += 1;
        if *failed >= self.config.max_resume_attempts.max(1) {
            warn!(failed = *failed, "Resume keeps failing, identifying from scratch");
            self.forget_session();
            *failed = 0;
        }
    }

    fn forget_session(&mut self) {
        self.session.clear();
        self.sequence.store(0, Ordering::SeqCst);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Pump one link until it ends. Also reports whether READY/RESUMED was seen.
    async fn drive<S: EventSink + ?Sized>(&mut self, mut link: Link, sink: &S) -> (LinkEnd, bool) {
        let mut reached_ready = self.current_state() == ConnectionState::Connected;
        loop {
            if let Some(end) = self.step(&mut link, sink).await {
                // A normal close invalidates the session, so resumable drops use 4000
                let close = match &end {
                    LinkEnd::Shutdown => Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    }),
                    LinkEnd::Reconnect { resume: true, .. } => Some(CloseFrame {
                        code: CloseCode::from(4000u16),
                        reason: "resuming".into(),
                    }),
                    _ => None,
                };
                link.finish(close);
                return (end, reached_ready);
            }
            if self.current_state() == ConnectionState::Connected {
                reached_ready = true;
            }
        }
    }

    /// Wait for the next input on `link`. `Some` means the link is done.
    async fn step<S: EventSink + ?Sized>(&mut self, link: &mut Link, sink: &S) -> Option<LinkEnd> {
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            _ = wait_closed(&mut shutdown) => Some(LinkEnd::Shutdown),
            Some(control) = link.control.recv() => match control {
                Control::Zombie => Some(LinkEnd::Reconnect {
                    resume: true,
                    immediate: false,
                    reason: "heartbeat not acknowledged".to_string(),
                }),
                Control::WriterClosed => Some(LinkEnd::Reconnect {
                    resume: true,
                    immediate: false,
                    reason: "gateway writer stopped".to_string(),
                }),
            },
            message = link.frames.next() => match message {
                None => Some(LinkEnd::Reconnect {
                    resume: true,
                    immediate: false,
                    reason: "gateway stream ended".to_string(),
                }),
                Some(Err(e)) => Some(LinkEnd::Reconnect {
                    resume: true,
                    immediate: false,
                    reason: e.to_string(),
                }),
                Some(Ok(message)) => self.handle_message(link, message, sink),
            },
        }
    }

    fn handle_message<S: EventSink + ?Sized>(
        &mut self,
        link: &Link,
        message: Message,
        sink: &S,
    ) -> Option<LinkEnd> {
        let frame = match message {
            Message::Text(text) => protocol::decode_text(text.as_str()),
            Message::Binary(data) => protocol::decode_binary(&data),
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((1005, String::new()));
                info!(code = code, reason = %reason, "Gateway sent close");
                return Some(match protocol::classify_close(code, &reason) {
                    CloseDisposition::Fatal(e) => LinkEnd::Fatal(e),
                    CloseDisposition::Resume => LinkEnd::Reconnect {
                        resume: true,
                        immediate: false,
                        reason: format!("closed with {}", code),
                    },
                    CloseDisposition::Reidentify => LinkEnd::Reconnect {
                        resume: false,
                        immediate: false,
                        reason: format!("closed with {}", code),
                    },
                });
            }
            _ => return None,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Skipping undecodable gateway frame");
                return None;
            }
        };

        match frame.op {
            protocol::DISPATCH => self.handle_dispatch(frame, sink),
            protocol::HEARTBEAT => {
                if let Err(e) = link.send(&Frame::heartbeat(self.session.sequence)) {
                    return Some(LinkEnd::Reconnect {
                        resume: true,
                        immediate: false,
                        reason: e.to_string(),
                    });
                }
                None
            }
            protocol::HEARTBEAT_ACK => {
                link.acked.store(true, Ordering::SeqCst);
                None
            }
            protocol::RECONNECT => Some(LinkEnd::Reconnect {
                resume: true,
                immediate: true,
                reason: "gateway requested reconnect".to_string(),
            }),
            protocol::INVALID_SESSION => {
                let resumable = frame.d.as_bool().unwrap_or(false);
                Some(LinkEnd::Reconnect {
                    resume: resumable,
                    immediate: false,
                    reason: format!("invalid session (resumable: {})", resumable),
                })
            }
            other => {
                debug!(op = other, "Ignoring gateway opcode");
                None
            }
        }
    }

    fn handle_dispatch<S: EventSink + ?Sized>(&mut self, frame: Frame, sink: &S) -> Option<LinkEnd> {
        let Some(sequence) = frame.s else {
            warn!("Dispatch frame without sequence");
            return None;
        };
        self.session.observe(sequence);
        self.sequence.store(sequence, Ordering::SeqCst);

        let name = frame.t.unwrap_or_default();
        match name.as_str() {
            "READY" => {
                self.session.session_id = frame
                    .d
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                self.session.resume_url = frame
                    .d
                    .get("resume_gateway_url")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                info!(
                    session_id = ?self.session.session_id,
                    sequence = sequence,
                    "Gateway session ready"
                );
                self.set_state(ConnectionState::Connected);
            }
            "RESUMED" => {
                info!(sequence = sequence, "Gateway session resumed");
                self.set_state(ConnectionState::Connected);
            }
            _ => {}
        }

        match Event::decode(&name, sequence, frame.d) {
            Ok(event) => {
                if !sink.send_event(event) {
                    warn!("Event sink closed, stopping gateway");
                    return Some(LinkEnd::Shutdown);
                }
            }
            Err(e) => warn!(event = %name, sequence = sequence, error = %e, "Failed to decode event"),
        }
        None
    }

    /// Resolve the gateway URL, fetching it once through the pipeline if needed.
    async fn base_url(&mut self) -> Result<String> {
        if let Some(url) = &self.config.url {
            return Ok(url.clone());
        }
        if let Some(url) = &self.gateway_url {
            return Ok(url.clone());
        }

        let pipeline = self.pipeline.as_ref().ok_or_else(|| {
            Error::Config("gateway.url is unset and no REST pipeline is available".to_string())
        })?;
        let response = pipeline
            .submit("gateway/bot", Request::get("gateway/bot"))
            .await?;
        let url = response
            .body
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Decode("gateway/bot response missing 'url'".to_string()))?
            .to_string();

        self.gateway_url = Some(url.clone());
        Ok(url)
    }

    fn with_query(&self, base: &str) -> String {
        let separator = if base.contains('?') { '&' } else { '?' };
        let base = if base.contains('?') || base.ends_with('/') {
            base.to_string()
        } else {
            format!("{}/", base)
        };
        format!(
            "{}{}v={}&encoding=json",
            base, separator, self.config.api_version
        )
    }

    /// Open a socket, wait for HELLO, start the heartbeat and send RESUME or IDENTIFY.
    async fn open_link(&mut self) -> Result<Link> {
        self.set_state(ConnectionState::Connecting);

        let resuming = self.session.is_resumable();
        let base = match (&self.session.resume_url, resuming) {
            (Some(url), true) => url.clone(),
            _ => self.base_url().await?,
        };
        let url = self.with_query(&base);
        debug!(url = %url, resuming = resuming, "Opening gateway socket");

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::ConnectionLost {
                attempts: 0,
                reason: e.to_string(),
            })?;
        let (mut write, mut frames) = stream.split();

        let hello = tokio::time::timeout(self.config.handshake_timeout(), next_frame(&mut frames))
            .await
            .map_err(|_| Error::ConnectionLost {
                attempts: 0,
                reason: "timed out waiting for HELLO".to_string(),
            })??;
        let interval_ms = hello.heartbeat_interval_ms().ok_or_else(|| {
            Error::ProtocolMismatch(format!("expected HELLO, got op {}", hello.op))
        })?;
        let interval = Duration::from_millis(interval_ms);
        self.session.heartbeat_interval = Some(interval);

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write.send(message).await {
                    debug!(error = %e, "Gateway writer stopped");
                    return;
                }
            }
            let _ = write.close().await;
        });

        let (control_tx, control) = mpsc::unbounded_channel();
        let acked = Arc::new(AtomicBool::new(true));
        let heartbeat = tokio::spawn(heartbeat_loop(
            interval,
            Arc::clone(&self.sequence),
            Arc::clone(&acked),
            outbound.clone(),
            control_tx,
        ));

        let link = Link {
            frames,
            outbound,
            control,
            acked,
            heartbeat,
            writer,
        };

        let handshake = match (&self.session.session_id, self.session.sequence) {
            (Some(session_id), Some(sequence)) if resuming => {
                self.set_state(ConnectionState::Resuming);
                info!(session_id = %session_id, sequence = sequence, "Resuming gateway session");
                Frame::resume(&self.credentials.token, session_id, sequence)
            }
            _ => {
                self.set_state(ConnectionState::Identifying);
                info!(intents = self.config.intents, "Identifying with gateway");
                Frame::identify(&self.credentials.token, self.config.intents)
            }
        };
        link.send(&handshake)?;

        Ok(link)
    }
}

/// Read until the first decodable frame (used for HELLO).
async fn next_frame(frames: &mut SplitStream<WsStream>) -> Result<Frame> {
    while let Some(message) = frames.next().await {
        let message = message.map_err(|e| Error::ConnectionLost {
            attempts: 0,
            reason: e.to_string(),
        })?;
        match message {
            Message::Text(text) => return protocol::decode_text(text.as_str()),
            Message::Binary(data) => return protocol::decode_binary(&data),
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((1005, String::new()));
                return Err(match protocol::classify_close(code, &reason) {
                    CloseDisposition::Fatal(e) => e,
                    _ => Error::ConnectionLost {
                        attempts: 0,
                        reason: format!("closed with {} before HELLO", code),
                    },
                });
            }
            _ => continue,
        }
    }
    Err(Error::ConnectionLost {
        attempts: 0,
        reason: "stream ended before HELLO".to_string(),
    })
}

async fn heartbeat_loop(
    interval: Duration,
    sequence: Arc<AtomicU64>,
    acked: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Message>,
    control: mpsc::UnboundedSender<Control>,
) {
    // First beat is jittered so reconnecting clients do not beat in lockstep
    let jitter = interval.mul_f64(rand::random::<f64>());
    tokio::time::sleep(jitter).await;

    loop {
        if !acked.swap(false, Ordering::SeqCst) {
            warn!("Heartbeat not acknowledged, connection is zombied");
            let _ = control.send(Control::Zombie);
            return;
        }

        let seq = match sequence.load(Ordering::SeqCst) {
            0 => None,
            s => Some(s),
        };
        let Ok(text) = Frame::heartbeat(seq).to_json() else {
            return;
        };
        if outbound.send(Message::text(text)).is_err() {
            let _ = control.send(Control::WriterClosed);
            return;
        }
        debug!(sequence = ?seq, "Heartbeat sent");

        tokio::time::sleep(interval).await;
    }
}

async fn wait_closed(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|closed| *closed).await.is_err() {
        // Sender gone: nobody can ask for shutdown any more
        std::future::pending::<()>().await;
    }
}
