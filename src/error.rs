#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The capture driver failed to initialize (or was never probed
    /// successfully). Sockets in this state are permanently unusable.
    #[error("capture driver not initialized")]
    DriverNotInitialized,
    /// The operation requires a bound socket.
    #[error("socket not bound")]
    NotBound,
    /// The deadline passed without a complete datagram.
    #[error("timeout")]
    Timeout,
    /// The socket was closed, possibly from another thread while a
    /// receive was blocked.
    #[error("socket closed")]
    SocketClosed,
    /// Any underlying capture-driver error; the payload carries the
    /// driver's message.
    #[error("capture error: {0}")]
    Capture(String),
}
