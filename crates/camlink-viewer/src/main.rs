use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

mod config;

use camlink_protocol::jpeg;
use camlink_session::{ControlSession, SessionEvent};
use camlink_stream::{FrameSink, StreamEvent, VideoPipeline};
use config::{Quality, ViewerConfig};

#[derive(Parser)]
#[command(name = "camlink-viewer", about = "Dash-cam live stream viewer")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Camera IP address, overrides config
    #[arg(long)]
    camera: Option<std::net::IpAddr>,

    /// TCP control port, overrides config
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Local UDP stream port, overrides config
    #[arg(long)]
    udp_port: Option<u16>,

    /// Stream quality: 480p, 720p or 1080p, overrides config
    #[arg(long)]
    quality: Option<String>,

    /// Dump the raw UDP stream to this pcap file
    #[arg(long)]
    pcap: Option<std::path::PathBuf>,
}

/// Logs the geometry of the first frame, then counts frames quietly. Decoding
/// and display are left to whatever consumes the viewer as a library.
struct FrameProbe {
    frames: AtomicU64,
}

impl FrameSink for FrameProbe {
    fn on_frame(&self, frame: Bytes) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed);
        if n == 0 {
            match jpeg::dimensions(&frame) {
                Some((w, h)) => info!(width = w, height = h, "first frame received"),
                None => warn!(len = frame.len(), "first frame has no parseable geometry"),
            }
        }
        debug!(len = frame.len(), "frame");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camlink_viewer=info,camlink_session=info,camlink_stream=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)?
    } else {
        ViewerConfig::default()
    };

    // CLI overrides
    if let Some(ip) = args.camera {
        config.camera_ip = ip;
    }
    if let Some(port) = args.tcp_port {
        config.tcp_port = port;
    }
    if let Some(port) = args.udp_port {
        config.udp_port = port;
    }
    if let Some(quality) = &args.quality {
        config.quality = Quality::parse(quality)
            .with_context(|| format!("unknown quality {:?}, expected 480p/720p/1080p", quality))?;
    }
    if let Some(path) = args.pcap {
        config.pcap_path = Some(path);
    }

    info!(
        camera = %config.camera_ip,
        tcp_port = config.tcp_port,
        udp_port = config.udp_port,
        quality = ?config.quality,
        "camlink viewer starting"
    );

    let (session_tx, mut session_rx) = mpsc::channel(32);
    let (stream_tx, mut stream_rx) = mpsc::channel(32);

    let session = ControlSession::new(config.session_config(), session_tx);
    let mut pipeline = VideoPipeline::new();
    let sink: Arc<dyn FrameSink> = Arc::new(FrameProbe {
        frames: AtomicU64::new(0),
    });
    let stream_config = config.stream_config();

    session
        .connect()
        .await
        .with_context(|| format!("cannot reach camera at {}", config.camera_ip))?;

    loop {
        tokio::select! {
            event = session_rx.recv() => match event {
                Some(SessionEvent::VideoAvailable) => {
                    info!("camera started the stream");
                    if !pipeline.is_running() {
                        if let Err(e) = pipeline
                            .start(stream_config.clone(), sink.clone(), stream_tx.clone())
                            .await
                        {
                            error!("cannot start the video pipeline: {}", e);
                            break;
                        }
                    }
                }
                Some(SessionEvent::VideoUnavailable) => {
                    info!("camera stopped the stream");
                    pipeline.stop().await;
                }
                Some(SessionEvent::Connected) => info!("control session established"),
                Some(SessionEvent::CommandSent { command }) => debug!(%command, "sent"),
                Some(SessionEvent::Error(e)) => error!("session error: {}", e),
                Some(SessionEvent::Disconnected) | None => {
                    info!("control session ended");
                    break;
                }
            },
            event = stream_rx.recv() => match event {
                Some(StreamEvent::Stats(stats)) => {
                    info!(
                        fps = stats.fps,
                        frames = stats.frames_processed,
                        skipped = stats.frames_skipped,
                        dropped = stats.packets_dropped,
                        "stream stats"
                    );
                }
                Some(StreamEvent::PcapStarted(path)) => info!(path = %path.display(), "pcap dump started"),
                Some(StreamEvent::PcapStopped { path, packets }) => {
                    info!(path = %path.display(), packets, "pcap dump finished");
                }
                Some(StreamEvent::Error(e)) => warn!("stream error: {}", e),
                Some(StreamEvent::Started) | Some(StreamEvent::Stopped) | None => {}
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                session.disconnect().await;
                pipeline.stop().await;
                break;
            }
        }
    }

    pipeline.stop().await;
    Ok(())
}
