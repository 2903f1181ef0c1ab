/// Notifications emitted by the control session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    /// The camera confirmed the live stream is being sent.
    VideoAvailable,
    /// The camera confirmed the live stream has stopped.
    VideoUnavailable,
    /// A command frame was written to the socket.
    CommandSent { command: String },
    Error(String),
}
