use thiserror::Error;

/// The error types that can occur when manipulating this crate.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// I/O Error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// SSH Key error.
    #[error(transparent)]
    Key(#[from] ssh_key::Error),

    /// Binary (de)-serialization error.
    #[error(transparent)]
    Binary(#[from] ssh_packet::binrw::Error),

    /// Signature error while signing a challenge.
    #[error(transparent)]
    Signature(#[from] signature::Error),

    /// The packet was empty, carried trailing bytes or invalid data.
    #[error("Malformed packet: {0}")]
    Malformed(&'static str),

    /// The received message is not expected in the current state.
    #[error("Unexpected message #{0} in the authentication context")]
    UnexpectedMessage(u8),

    /// The session has been disconnected.
    #[error("The session has been disconnected")]
    Disconnected,

    /// The peer took too long to authenticate.
    #[error("The authentication timed out")]
    Timeout,

    /// The peer failed to authenticate too many times.
    #[error("Too many failed authentication attempts")]
    AttemptsExhausted,

    /// No authentication methods are left to be tried.
    #[error("Exhausted available authentication methods")]
    MethodsExhausted,

    /// Invalid bounds for the worker pool.
    #[error("Invalid pool size, expected `min <= max`, got min={min} and max={max}")]
    PoolSize {
        /// The requested minimum.
        min: usize,

        /// The requested maximum.
        max: usize,
    },
}

/// A handy [`std::result::Result`] type alias bounding the [`enum@Error`] struct as `E`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
