use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use camlink_protocol::ctp::{try_decode_message, Command, ControlPacket, DecodeResult, InboundMessage};

use crate::{SessionConfig, SessionError, SessionEvent};

/// Short read timeout so the reader observes shutdown promptly.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// How long an orderly disconnect waits for the camera's close notification.
const CLOSE_ACK_WAIT: Duration = Duration::from_secs(2);

/// Consecutive read failures tolerated before the session is declared dead.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

struct Inner {
    state: SessionState,
    cmd_tx: Option<mpsc::Sender<ControlPacket>>,
    tasks: Vec<JoinHandle<()>>,
}

/// State shared between the session handle and its background tasks, so that
/// a terminal condition seen by the reader tears the whole session down, not
/// just the reader.
struct Shared {
    events: mpsc::Sender<SessionEvent>,
    running: AtomicBool,
    close_ack: Notify,
    inner: Mutex<Inner>,
}

impl Shared {
    /// Terminal teardown from any state: stop the tasks, drop the command
    /// channel, emit `Disconnected` exactly once. Safe to call repeatedly
    /// and from within a task being torn down (self-abort happens last).
    async fn force_close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let (emit, tasks) = {
            let mut inner = self.inner.lock().await;
            inner.cmd_tx = None;
            let was = inner.state;
            inner.state = SessionState::Disconnected;
            (
                was != SessionState::Disconnected,
                std::mem::take(&mut inner.tasks),
            )
        };
        if emit {
            let _ = self.events.send(SessionEvent::Disconnected).await;
            info!("control session closed");
        }
        for task in tasks {
            task.abort();
        }
    }
}

/// TCP control session with the camera.
///
/// `connect` establishes the session, performs the access handshake, starts
/// the stream and keeps it alive with periodic heartbeats; `disconnect` asks
/// the camera to stop the stream and waits briefly for its acknowledgement
/// before tearing the socket down. A close initiated by the camera, an EOF,
/// or repeated read failures end the session the same way. All outbound
/// frames funnel through a single writer task.
pub struct ControlSession {
    config: SessionConfig,
    shared: Arc<Shared>,
}

impl ControlSession {
    pub fn new(config: SessionConfig, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                events,
                running: AtomicBool::new(false),
                close_ack: Notify::new(),
                inner: Mutex::new(Inner {
                    state: SessionState::Disconnected,
                    cmd_tx: None,
                    tasks: Vec::new(),
                }),
            }),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    /// Connect to the camera and request the live stream. A no-op when a
    /// session is already up.
    pub async fn connect(&self) -> Result<(), SessionError> {
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.state != SessionState::Disconnected {
                warn!(state = ?inner.state, "connect ignored, session already active");
                return Ok(());
            }
            inner.state = SessionState::Connecting;
        }

        let addr = self.config.camera_addr();
        info!(%addr, "connecting to camera");
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                self.shared.inner.lock().await.state = SessionState::Disconnected;
                return Err(SessionError::ConnectTimeout {
                    addr,
                    timeout: self.config.connect_timeout,
                });
            }
            Ok(Err(e)) => {
                self.shared.inner.lock().await.state = SessionState::Disconnected;
                return Err(SessionError::Connect(e));
            }
            Ok(Ok(s)) => s,
        };
        // Control frames are small and latency-sensitive.
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        self.shared.running.store(true, Ordering::SeqCst);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        {
            // Register everything under the lock so a reader that dies
            // instantly cannot race the setup.
            let mut inner = self.shared.inner.lock().await;
            inner.tasks.push(tokio::spawn(writer_loop(
                write_half,
                cmd_rx,
                self.shared.clone(),
            )));
            inner
                .tasks
                .push(tokio::spawn(reader_loop(read_half, self.shared.clone())));
            inner.tasks.push(tokio::spawn(heartbeat_loop(
                cmd_tx.clone(),
                self.shared.clone(),
                self.config.heartbeat_interval,
            )));
            inner.state = SessionState::Connected;
            inner.cmd_tx = Some(cmd_tx.clone());
        }
        let _ = self.shared.events.send(SessionEvent::Connected).await;

        // Access handshake first, then the stream request.
        let open =
            ControlPacket::open_stream(self.config.width, self.config.height, self.config.fps);
        for packet in [ControlPacket::app_access(), open] {
            if cmd_tx.send(packet).await.is_err() {
                warn!("writer task gone before the setup commands could be queued");
                break;
            }
        }
        Ok(())
    }

    /// Queue a command frame for transmission.
    pub async fn send(&self, packet: ControlPacket) -> Result<(), SessionError> {
        let tx = self
            .shared
            .inner
            .lock()
            .await
            .cmd_tx
            .clone()
            .ok_or(SessionError::NotConnected)?;
        tx.send(packet).await.map_err(|_| SessionError::NotConnected)
    }

    /// Orderly shutdown: ask the camera to stop the stream, wait briefly for
    /// its acknowledgement, then close the socket. Safe to call repeatedly
    /// and from any state.
    pub async fn disconnect(&self) {
        let tx = {
            let mut inner = self.shared.inner.lock().await;
            if inner.state == SessionState::Disconnected {
                return;
            }
            inner.state = SessionState::Closing;
            inner.cmd_tx.clone()
        };

        if let Some(tx) = tx {
            if tx.send(ControlPacket::close_stream()).await.is_ok()
                && timeout(CLOSE_ACK_WAIT, self.shared.close_ack.notified())
                    .await
                    .is_err()
            {
                debug!("close acknowledgement timed out, closing anyway");
            }
        }
        self.shared.force_close().await;
    }
}

/// Single writer: serializes every outbound frame onto the socket in queue
/// order.
async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut cmd_rx: mpsc::Receiver<ControlPacket>,
    shared: Arc<Shared>,
) {
    while let Some(packet) = cmd_rx.recv().await {
        let bytes = match packet.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                warn!(command = %packet.command, "failed to encode command: {}", e);
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&bytes).await {
            warn!("control write failed: {}", e);
            let _ = shared
                .events
                .send(SessionEvent::Error(format!("control write failed: {}", e)))
                .await;
            break;
        }
        debug!(command = %packet.command, len = bytes.len(), "command sent");
        let _ = shared
            .events
            .send(SessionEvent::CommandSent {
                command: packet.command,
            })
            .await;
    }
    debug!("control writer stopped");
}

async fn reader_loop(mut read_half: OwnedReadHalf, shared: Arc<Shared>) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut consecutive_errors = 0u32;

    'session: while shared.running.load(Ordering::Relaxed) {
        match timeout(READ_TIMEOUT, read_half.read_buf(&mut buf)).await {
            // Quiet socket: re-check the running flag.
            Err(_) => continue,
            Ok(Ok(0)) => {
                info!("camera closed the control connection");
                let _ = shared
                    .events
                    .send(SessionEvent::Error("connection closed by camera".into()))
                    .await;
                break;
            }
            Ok(Ok(_)) => consecutive_errors = 0,
            Ok(Err(e)) => {
                consecutive_errors += 1;
                warn!(consecutive_errors, "control read failed: {}", e);
                if consecutive_errors > MAX_CONSECUTIVE_ERRORS {
                    let _ = shared
                        .events
                        .send(SessionEvent::Error(format!(
                            "control channel dead after repeated read failures: {}",
                            e
                        )))
                        .await;
                    break;
                }
                continue;
            }
        }

        loop {
            match try_decode_message(&mut buf) {
                DecodeResult::Message(msg) => {
                    if dispatch(&msg, &shared).await == Dispatch::EndSession {
                        break 'session;
                    }
                }
                DecodeResult::NeedMoreData => break,
                // Resynchronize on the next magic.
                DecodeResult::BadMagic => buf.advance(1),
            }
        }
    }

    // Every exit from the loop is terminal for the whole session: the
    // heartbeat and writer must die with the reader.
    shared.force_close().await;
    debug!("control reader stopped");
}

#[derive(PartialEq)]
enum Dispatch {
    Continue,
    EndSession,
}

async fn dispatch(msg: &InboundMessage, shared: &Shared) -> Dispatch {
    debug!(topic = %msg.topic, operation = %msg.operation, "camera message");

    if msg.operation != "NOTIFY" {
        return Dispatch::Continue;
    }
    if msg.topic == Command::OpenRtStream.name() {
        match msg.error_code {
            Some(code) => {
                warn!(code, "camera rejected the stream request");
                let _ = shared
                    .events
                    .send(SessionEvent::Error(format!(
                        "stream request rejected with code {}",
                        code
                    )))
                    .await;
            }
            None => {
                let _ = shared.events.send(SessionEvent::VideoAvailable).await;
            }
        }
    } else if msg.topic == Command::CloseRtStream.name() {
        let _ = shared.events.send(SessionEvent::VideoUnavailable).await;
        shared.close_ack.notify_one();
        return Dispatch::EndSession;
    }
    Dispatch::Continue
}

/// Periodic keep-alive. Send failures are the writer's problem; this loop
/// only stops when the session does.
async fn heartbeat_loop(cmd_tx: mpsc::Sender<ControlPacket>, shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // the first tick completes immediately
    while shared.running.load(Ordering::Relaxed) {
        ticker.tick().await;
        if !shared.running.load(Ordering::Relaxed) {
            break;
        }
        if cmd_tx.send(ControlPacket::keep_alive()).await.is_err() {
            break;
        }
    }
    debug!("heartbeat stopped");
}
