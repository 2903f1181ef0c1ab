use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use serde_json::Value;
use tracing::warn;

use crate::error::ProtocolError;

/// Magic prefix of every control frame.
pub const CTP_MAGIC: &[u8; 4] = b"CTP:";

/// Maximum accepted JSON content size: 5 MiB.
/// Larger declared lengths are device/attacker controlled and are never allocated.
pub const MAX_CONTENT_SIZE: usize = 5 * 1024 * 1024;

/// Commands understood by the camera, with their fixed suffix bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    AppAccess,
    OpenRtStream,
    CloseRtStream,
    VideoParam,
    VideoCtrl,
    DateTime,
    Language,
    KeepAlive,
}

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Self::AppAccess => "APP_ACCESS",
            Self::OpenRtStream => "OPEN_RT_STREAM",
            Self::CloseRtStream => "CLOSE_RT_STREAM",
            Self::VideoParam => "VIDEO_PARAM",
            Self::VideoCtrl => "VIDEO_CTRL",
            Self::DateTime => "DATE_TIME",
            Self::Language => "LANGUAGE",
            Self::KeepAlive => "CTP_KEEP_ALIVE",
        }
    }
}

/// Fixed per-command suffix byte written after the command name. Unknown
/// commands get 0x00.
pub fn suffix_for(command: &str) -> u8 {
    match command {
        "APP_ACCESS" => 0x2f,
        "OPEN_RT_STREAM" => 0x42,
        "CLOSE_RT_STREAM" => 0x23,
        "VIDEO_PARAM" => 0x00,
        "VIDEO_CTRL" => 0x26,
        "DATE_TIME" => 0x2e,
        "LANGUAGE" => 0x23,
        "CTP_KEEP_ALIVE" => 0x17,
        _ => 0x00,
    }
}

/// Operation field of a control frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Put,
    Get,
    Notify,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Put => "PUT",
            Self::Get => "GET",
            Self::Notify => "NOTIFY",
        }
    }
}

/// An outbound command frame.
///
/// Wire format (little-endian lengths):
/// ```text
/// [4] magic "CTP:"
/// [2] command name length (LE u16)
/// [N] command name (UTF-8)
/// [1] suffix byte (fixed per-command table)
/// [3] zero padding
/// [M] UTF-8 JSON: {"op":"<PUT|GET|NOTIFY>","param":{"k":"v",...}}
/// ```
///
/// The channel is asymmetric: camera-to-app frames use the same layout but
/// carry a real LE u32 content length in those four bytes, which
/// [`try_decode_message`] reads.
#[derive(Debug, Clone)]
pub struct ControlPacket {
    pub command: String,
    pub operation: Operation,
    /// Parameters in insertion order; the device is sensitive to key order.
    pub params: Vec<(String, String)>,
}

impl ControlPacket {
    pub fn new(command: Command, operation: Operation) -> Self {
        Self {
            command: command.name().to_string(),
            operation,
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Build the OPEN_RT_STREAM request for the given video parameters.
    pub fn open_stream(width: u32, height: u32, fps: u32) -> Self {
        Self::new(Command::OpenRtStream, Operation::Put)
            .with_param("w", width.to_string())
            .with_param("h", height.to_string())
            .with_param("format", "0")
            .with_param("fps", fps.to_string())
    }

    /// Build the CLOSE_RT_STREAM request.
    pub fn close_stream() -> Self {
        Self::new(Command::CloseRtStream, Operation::Put).with_param("status", "1")
    }

    /// Build a keep-alive heartbeat.
    pub fn keep_alive() -> Self {
        Self::new(Command::KeepAlive, Operation::Put)
    }

    /// Build the initial APP_ACCESS handshake.
    pub fn app_access() -> Self {
        Self::new(Command::AppAccess, Operation::Put)
    }

    /// Query the current video parameters.
    pub fn video_param() -> Self {
        Self::new(Command::VideoParam, Operation::Get)
    }

    /// Toggle recording on the camera.
    pub fn video_ctrl(recording: bool) -> Self {
        Self::new(Command::VideoCtrl, Operation::Put)
            .with_param("recording", if recording { "1" } else { "0" })
    }

    /// Build a DATE_TIME sync carrying the phone's clock.
    pub fn date_time(date: impl Into<String>, time: impl Into<String>) -> Self {
        Self::new(Command::DateTime, Operation::Put)
            .with_param("date", date)
            .with_param("time", time)
    }

    /// Serialize to bytes for TCP transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut param = serde_json::Map::new();
        for (k, v) in &self.params {
            param.insert(k.clone(), Value::String(v.clone()));
        }
        let body = serde_json::json!({
            "op": self.operation.as_str(),
            "param": param,
        });
        let json = serde_json::to_vec(&body)?;

        let cmd = self.command.as_bytes();
        let mut buf = Vec::with_capacity(4 + 2 + cmd.len() + 4 + json.len());
        buf.extend_from_slice(CTP_MAGIC);
        buf.extend_from_slice(&(cmd.len() as u16).to_le_bytes());
        buf.extend_from_slice(cmd);
        buf.push(suffix_for(&self.command));
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&json);
        Ok(buf)
    }
}

/// Decoded form of a received control frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    /// Command name the frame refers to.
    pub topic: String,
    /// "PUT", "GET" or "NOTIFY"; empty if the body could not be parsed.
    pub operation: String,
    /// Optional device error code from the body.
    pub error_code: Option<i32>,
    pub params: HashMap<String, String>,
}

impl InboundMessage {
    fn empty(topic: String) -> Self {
        Self {
            topic,
            ..Self::default()
        }
    }
}

/// Outcome of one decode attempt against a receive buffer.
#[derive(Debug)]
pub enum DecodeResult {
    /// A complete frame was consumed from the buffer.
    Message(InboundMessage),
    /// Not enough buffered bytes yet; read more and retry.
    NeedMoreData,
    /// The buffer does not start with the CTP magic. The caller must discard
    /// one byte and retry, which bounds a garbage stream to O(n) resync cost.
    BadMagic,
}

/// Attempt to decode one control frame from the front of `buf`.
///
/// Consumes the frame on success. Oversized content lengths are answered with
/// a synthesized empty message instead of an allocation; the unread body bytes
/// are then discarded by the caller's magic resynchronization.
pub fn try_decode_message(buf: &mut BytesMut) -> DecodeResult {
    if buf.len() < 4 {
        return DecodeResult::NeedMoreData;
    }
    if &buf[..4] != CTP_MAGIC {
        return DecodeResult::BadMagic;
    }
    if buf.len() < 6 {
        return DecodeResult::NeedMoreData;
    }

    let topic_len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
    if topic_len == 0 {
        warn!("control frame with empty topic");
        buf.advance(6);
        return DecodeResult::Message(InboundMessage::empty(String::new()));
    }

    let header_len = 4 + 2 + topic_len + 4;
    if buf.len() < header_len {
        return DecodeResult::NeedMoreData;
    }

    let topic = String::from_utf8_lossy(&buf[6..6 + topic_len]).into_owned();
    let content_len = u32::from_le_bytes([
        buf[6 + topic_len],
        buf[6 + topic_len + 1],
        buf[6 + topic_len + 2],
        buf[6 + topic_len + 3],
    ]) as usize;

    if content_len == 0 {
        buf.advance(header_len);
        return DecodeResult::Message(InboundMessage::empty(topic));
    }
    if content_len >= MAX_CONTENT_SIZE {
        warn!(topic = %topic, content_len, "oversized control content, synthesizing empty message");
        buf.advance(header_len);
        return DecodeResult::Message(InboundMessage::empty(topic));
    }

    if buf.len() < header_len + content_len {
        return DecodeResult::NeedMoreData;
    }

    buf.advance(header_len);
    let content = buf.split_to(content_len);
    DecodeResult::Message(parse_body(topic, &content))
}

/// Lenient body parse: the device protocol is undocumented and best-effort,
/// so any JSON failure yields an empty message rather than an error.
fn parse_body(topic: String, content: &[u8]) -> InboundMessage {
    let root: Value = match serde_json::from_slice(content) {
        Ok(v) => v,
        Err(e) => {
            warn!(topic = %topic, "unparseable control body: {}", e);
            return InboundMessage::empty(topic);
        }
    };

    let operation = root
        .get("op")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let error_code = root
        .get("err")
        .and_then(Value::as_i64)
        .map(|v| v as i32)
        .filter(|&v| v != 0);

    let mut params = HashMap::new();
    if let Some(Value::Object(map)) = root.get("param") {
        for (k, v) in map {
            let s = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            params.insert(k.clone(), s);
        }
    }

    InboundMessage {
        topic,
        operation,
        error_code,
        params,
    }
}
