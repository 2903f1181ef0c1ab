//! Wire formats for the camera link: the CTP control channel carried over
//! TCP and the fragmented MJPEG video framing carried over UDP.

pub mod ctp;
pub mod error;
pub mod fragment;
pub mod jpeg;

pub use error::ProtocolError;
