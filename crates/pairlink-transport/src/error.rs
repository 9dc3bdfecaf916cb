use std::io;

/// Common transport error type.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Operation timed out")]
    Timeout,

    #[error("Transport disconnected")]
    Disconnected,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the operation is worth repeating with the same inputs.
    ///
    /// Retriable: timeouts, and I/O errors of the reset / abort / broken pipe /
    /// timed out / network unreachable class, or I/O errors carrying no message.
    /// Authorization failures and everything else fail fast.
    pub fn is_retriable(&self) -> bool {
        match self {
            TransportError::Timeout => true,
            TransportError::Io(e) => is_transient_io(e),
            TransportError::Disconnected
            | TransportError::Unauthorized(_)
            | TransportError::Other(_) => false,
        }
    }
}

fn is_transient_io(e: &io::Error) -> bool {
    let transient_kind = matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NetworkUnreachable
    );
    let no_message = e.get_ref().is_none() && e.raw_os_error().is_none();
    transient_kind || no_message
}
