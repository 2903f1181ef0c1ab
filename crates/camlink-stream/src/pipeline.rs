use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use camlink_protocol::fragment::has_stream_signature;

use crate::assembler::{new_reassembler, Dialect, Reassembler};
use crate::pacer::{FramePacer, TARGET_FRAME_INTERVAL};
use crate::pcap::PcapWriter;
use crate::sink::FrameSink;
use crate::StreamError;

/// Receive buffer large enough for any UDP datagram.
const RECV_BUFFER_SIZE: usize = 65_536;

/// Short receive timeout so the receiver observes the stop flag promptly.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Bounded wait when the processor polls the queue.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Default hard cap on a single reassembled frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Local UDP port the camera streams to. 0 binds an ephemeral port.
    pub listen_port: u16,
    pub dialect: Dialect,
    pub max_frame_size: usize,
    /// Datagram queue capacity between the receiver and the processor.
    pub queue_capacity: usize,
    /// Minimum interval between frames handed to the sink.
    pub frame_interval: Duration,
    /// Emit a stats event every this many processed frames.
    pub stats_every: u64,
    /// When set, every raw datagram is also dumped to this pcap file.
    pub pcap_path: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            listen_port: 2224,
            dialect: Dialect::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            queue_capacity: 100,
            frame_interval: TARGET_FRAME_INTERVAL,
            stats_every: 60,
            pcap_path: None,
        }
    }
}

/// Periodic pipeline telemetry snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStats {
    /// Frames decoded-and-displayed (admitted by the pacer).
    pub frames_processed: u64,
    /// Completed frames discarded by pacing.
    pub frames_skipped: u64,
    /// Datagrams shed because the queue was full.
    pub packets_dropped: u64,
    pub queue_depth: usize,
    /// Display rate derived over the last stats window.
    pub fps: u32,
}

/// Events emitted by the video pipeline.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Started,
    Stopped,
    Stats(StreamStats),
    PcapStarted(PathBuf),
    PcapStopped { path: PathBuf, packets: u64 },
    Error(String),
}

#[derive(Default)]
struct Counters {
    frames_processed: AtomicU64,
    frames_skipped: AtomicU64,
    packets_dropped: AtomicU64,
    queue_depth: AtomicUsize,
}

impl Counters {
    fn snapshot(&self, fps: u32) -> StreamStats {
        StreamStats {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            fps,
        }
    }
}

/// Bounded datagram queue between the receiver and the processor. UDP has no
/// flow control to push back on, so a full queue sheds the newest datagram
/// instead of ever blocking the receiver.
struct PacketQueue {
    tx: mpsc::Sender<Bytes>,
    counters: Arc<Counters>,
}

impl PacketQueue {
    fn offer(&self, datagram: Bytes) -> bool {
        match self.tx.try_send(datagram) {
            Ok(()) => {
                self.counters.queue_depth.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Decouples the UDP receive task from the reassemble/decode task and paces
/// completed frames to the target display rate.
pub struct VideoPipeline {
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Default for VideoPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoPipeline {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            tasks: Vec::new(),
            local_addr: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot(0)
    }

    /// Bind the UDP socket and spawn the receiver and processor tasks.
    /// Returns the bound local address. A no-op when already running.
    pub async fn start(
        &mut self,
        config: StreamConfig,
        sink: Arc<dyn FrameSink>,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<SocketAddr, StreamError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("stream already running");
            if let Some(addr) = self.local_addr {
                return Ok(addr);
            }
            return Err(StreamError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "pipeline already running",
            )));
        }

        let socket = match UdpSocket::bind(("0.0.0.0", config.listen_port)).await {
            Ok(s) => s,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = events
                    .send(StreamEvent::Error(format!(
                        "UDP bind on port {} failed: {}",
                        config.listen_port, e
                    )))
                    .await;
                return Err(StreamError::Bind {
                    port: config.listen_port,
                    source: e,
                });
            }
        };
        let local_addr = socket.local_addr()?;
        self.local_addr = Some(local_addr);

        let pcap = match &config.pcap_path {
            Some(path) => match PcapWriter::create(path, config.listen_port) {
                Ok(w) => Some(w),
                Err(e) => {
                    // Diagnostics must not take the stream down with them.
                    warn!(path = %path.display(), "failed to start pcap dump: {}", e);
                    let _ = events
                        .send(StreamEvent::Error(format!("pcap dump disabled: {}", e)))
                        .await;
                    None
                }
            },
            None => None,
        };

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let queue = PacketQueue {
            tx,
            counters: self.counters.clone(),
        };

        let assembler = new_reassembler(config.dialect, config.max_frame_size);
        let pacer = FramePacer::new(config.frame_interval);

        info!(
            port = local_addr.port(),
            dialect = ?config.dialect,
            pcap = pcap.is_some(),
            "video pipeline starting"
        );
        let _ = events.send(StreamEvent::Started).await;

        self.tasks.push(tokio::spawn(receive_loop(
            socket,
            queue,
            self.running.clone(),
            self.counters.clone(),
            pcap,
            events.clone(),
        )));
        self.tasks.push(tokio::spawn(process_loop(
            rx,
            self.running.clone(),
            self.counters.clone(),
            assembler,
            sink,
            pacer,
            config.stats_every,
            events,
        )));

        Ok(local_addr)
    }

    /// Signal both tasks to exit and wait for them. Safe from any state and
    /// safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.local_addr = None;
        self.counters.queue_depth.store(0, Ordering::Relaxed);
        debug!("video pipeline stopped");
    }
}

async fn receive_loop(
    socket: UdpSocket,
    queue: PacketQueue,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    mut pcap: Option<PcapWriter>,
    events: mpsc::Sender<StreamEvent>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    debug!("UDP receiver started");

    if let Some(w) = &pcap {
        let _ = events
            .send(StreamEvent::PcapStarted(w.path().to_path_buf()))
            .await;
    }

    while running.load(Ordering::Relaxed) {
        let (len, src) = match timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await {
            // Timeout window: loop around and re-check the stop flag.
            Err(_) => continue,
            Ok(Err(e)) => {
                if running.load(Ordering::Relaxed) {
                    warn!("UDP receive error: {}", e);
                }
                continue;
            }
            Ok(Ok(r)) => r,
        };
        let data = &buf[..len];

        let mut pcap_failed = false;
        if let Some(w) = pcap.as_mut() {
            if let Err(e) = w.write_datagram(data, src) {
                warn!("pcap dump write failed, disabling: {}", e);
                pcap_failed = true;
            }
        }
        if pcap_failed {
            pcap = None;
        }

        if !has_stream_signature(data) {
            continue;
        }

        if !queue.offer(Bytes::copy_from_slice(data)) {
            let dropped = counters.packets_dropped.load(Ordering::Relaxed);
            if dropped % 50 == 0 {
                warn!(dropped, "queue full, shedding datagrams");
            }
        }
    }

    if let Some(w) = pcap.take() {
        match w.finish() {
            Ok((path, packets)) => {
                let _ = events.send(StreamEvent::PcapStopped { path, packets }).await;
            }
            Err(e) => warn!("pcap dump close failed: {}", e),
        }
    }
    debug!("UDP receiver stopped");
}

#[allow(clippy::too_many_arguments)]
async fn process_loop(
    mut rx: mpsc::Receiver<Bytes>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    mut assembler: Box<dyn Reassembler>,
    sink: Arc<dyn FrameSink>,
    mut pacer: FramePacer,
    stats_every: u64,
    events: mpsc::Sender<StreamEvent>,
) {
    debug!("frame processor started");
    let mut window_start = Instant::now();
    let mut window_base_frames = 0u64;

    while running.load(Ordering::Relaxed) {
        let datagram = match timeout(POLL_TIMEOUT, rx.recv()).await {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(d)) => {
                counters.queue_depth.fetch_sub(1, Ordering::Relaxed);
                d
            }
        };

        for frame in assembler.push_datagram(&datagram, Instant::now()) {
            // Pacing: frames completing inside the target interval are
            // dropped, not queued.
            if !pacer.admit(Instant::now()) {
                counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let processed = counters.frames_processed.fetch_add(1, Ordering::Relaxed) + 1;
            sink.on_frame(frame);

            if processed % stats_every == 0 {
                let now = Instant::now();
                let elapsed = now.duration_since(window_start);
                let delta = processed - window_base_frames;
                let fps = if elapsed.as_millis() > 0 {
                    (delta as f64 / elapsed.as_secs_f64()).round() as u32
                } else {
                    0
                };
                window_start = now;
                window_base_frames = processed;

                let stats = counters.snapshot(fps);
                info!(
                    fps = stats.fps,
                    frames = stats.frames_processed,
                    skipped = stats.frames_skipped,
                    dropped = stats.packets_dropped,
                    queue = stats.queue_depth,
                    "stream stats"
                );
                let _ = events.send(StreamEvent::Stats(stats)).await;
            }
        }
    }

    let _ = events.send(StreamEvent::Stopped).await;
    debug!("frame processor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_protocol::fragment::FRAGMENT_HEADER_SIZE;
    use std::sync::Mutex;

    #[test]
    fn full_queue_sheds_newest_without_blocking() {
        let counters = Arc::new(Counters::default());
        let (tx, _rx) = mpsc::channel(100);
        let queue = PacketQueue {
            tx,
            counters: counters.clone(),
        };

        let mut accepted = 0;
        for _ in 0..150 {
            if queue.offer(Bytes::from_static(&[0u8; 8])) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 100);
        assert_eq!(counters.packets_dropped.load(Ordering::Relaxed), 50);
        assert_eq!(counters.queue_depth.load(Ordering::Relaxed), 100);
    }

    struct CollectingSink {
        frames: Mutex<Vec<Bytes>>,
    }

    impl FrameSink for CollectingSink {
        fn on_frame(&self, frame: Bytes) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    fn record(type_byte: u8, sequence: u32, frame_size: u32, offset: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAGMENT_HEADER_SIZE + payload.len());
        buf.push(type_byte);
        buf.push(0);
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&frame_size.to_le_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(payload);
        buf
    }

    /// A combined datagram whose first record is a full 1452-byte block, so
    /// the datagram carries the expected channel signature bytes.
    fn signed_frame_datagram(sequence: u32) -> (Vec<u8>, Vec<u8>) {
        let total = 1452 + 100;
        let mut frame = vec![0x77u8; total];
        frame[0] = 0xFF;
        frame[1] = 0xD8;
        frame[total - 2] = 0xFF;
        frame[total - 1] = 0xD9;

        let mut datagram = record(0x02, sequence, total as u32, 0, &frame[..1452]);
        datagram.extend_from_slice(&record(0x82, sequence, total as u32, 1452, &frame[1452..]));
        assert!(has_stream_signature(&datagram));
        (datagram, frame)
    }

    #[tokio::test]
    async fn start_is_noop_when_running_and_stop_is_idempotent() {
        let mut pipeline = VideoPipeline::new();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let config = StreamConfig {
            listen_port: 0,
            ..StreamConfig::default()
        };

        assert!(!pipeline.is_running());
        let addr = pipeline
            .start(config.clone(), Arc::new(crate::sink::NullSink), events_tx.clone())
            .await
            .unwrap();
        assert!(pipeline.is_running());
        assert!(matches!(events_rx.recv().await, Some(StreamEvent::Started)));

        // Second start while running is a no-op reporting the live socket.
        let again = pipeline
            .start(config, Arc::new(crate::sink::NullSink), events_tx)
            .await
            .unwrap();
        assert_eq!(again, addr);
        assert!(pipeline.is_running());

        pipeline.stop().await;
        assert!(!pipeline.is_running());
        pipeline.stop().await; // safe to repeat
    }

    #[tokio::test]
    async fn datagrams_flow_to_the_sink() {
        let mut pipeline = VideoPipeline::new();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let sink = Arc::new(CollectingSink {
            frames: Mutex::new(Vec::new()),
        });

        let config = StreamConfig {
            listen_port: 0,
            ..StreamConfig::default()
        };
        let addr = pipeline
            .start(config, sink.clone(), events_tx)
            .await
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        let (datagram, frame) = signed_frame_datagram(1);
        sender.send_to(&datagram, target).await.unwrap();
        // A datagram without the channel signature must be ignored.
        sender.send_to(&[0x99u8; 64], target).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if !sink.frames.lock().unwrap().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "frame never reached the sink");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame[..]);
        drop(frames);

        pipeline.stop().await;
        assert_eq!(pipeline.stats().frames_processed, 1);
    }
}
