/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Binding a listening socket failed.
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    /// An outbound channel could not be established.
    #[error("connect to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// The hub task is gone; no more channels can be opened or written.
    #[error("transport shut down")]
    Shutdown,
}
