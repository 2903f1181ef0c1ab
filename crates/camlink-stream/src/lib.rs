//! UDP video path: fragment reassembly, the receive/decode pipeline with
//! frame pacing, and the pcap diagnostics writer.

pub mod assembler;
pub mod pacer;
pub mod pcap;
pub mod pipeline;
pub mod sink;

pub use assembler::{new_reassembler, Dialect, Reassembler};
pub use pacer::FramePacer;
pub use pipeline::{StreamConfig, StreamEvent, StreamStats, VideoPipeline};
pub use sink::FrameSink;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
