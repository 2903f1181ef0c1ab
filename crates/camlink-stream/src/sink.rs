use bytes::Bytes;

/// Consumer of completed JPEG frames.
///
/// Decode and display are platform capabilities outside the link core; the
/// pipeline hands over ownership of each paced frame and keeps no reference.
/// Called from the frame-processor task, so implementations must not block
/// for long — hand off to a decoder thread/channel if decoding is slow.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: Bytes);
}

/// Discards all frames. Useful for headless diagnostics runs.
pub struct NullSink;

impl FrameSink for NullSink {
    fn on_frame(&self, _frame: Bytes) {}
}
