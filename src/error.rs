use std::fmt;

use thiserror::Error;

/// Error returned when sending on a rendezvous or buffered channel that has
/// already finished.
///
/// The rejected element is handed back to the caller.
#[derive(Error)]
#[error("sending on a finished channel")]
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
    /// Consumes the error, returning the element that could not be sent.
    #[inline]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError").finish_non_exhaustive()
    }
}

/// Error type for producer-side operations on an MPSC watermark channel.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProduceError {
    /// Indicates that the channel was already terminated when the operation
    /// was attempted.
    #[error("channel already finished")]
    AlreadyFinished,

    /// Indicates that a pending back-pressure notification was cancelled
    /// before demand returned.
    #[error("send was cancelled")]
    Cancelled,
}
