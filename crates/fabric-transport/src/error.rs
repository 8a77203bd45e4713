//! Transport errors and their result codes.

use std::fmt;

use thiserror::Error;

use crate::nic::NicError;

/// Result codes reported across the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ResultCode {
    /// Operation succeeded.
    Ok,
    /// Name or service resolution failed, or the peer is unknown.
    NoEntry,
    /// Socket or hardware completion failure.
    Io,
    /// A bounded wait was exceeded.
    TimedOut,
    /// Malformed URL or parameters.
    InvalidArgument,
    /// The NIC refused the protection-domain attach.
    PermissionDenied,
    /// Cooperative shutdown was observed mid-wait.
    Canceled,
    /// Allocation failure.
    OutOfMemory,
}

impl ResultCode {
    /// Conventional errno-style name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::NoEntry => "ENOENT",
            ResultCode::Io => "EIO",
            ResultCode::TimedOut => "ETIMEDOUT",
            ResultCode::InvalidArgument => "EINVAL",
            ResultCode::PermissionDenied => "EPERM",
            ResultCode::Canceled => "ECANCELED",
            ResultCode::OutOfMemory => "ENOMEM",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A contact URL could not be parsed.
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl {
        /// The URL as given.
        url: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A call was made with arguments the transport cannot honour.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Description of the offending argument.
        reason: String,
    },

    /// Configuration failed to load or validate.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What was wrong with the configuration.
        reason: String,
    },

    /// The peer's host name did not resolve.
    #[error("cannot resolve {host}: {reason}")]
    NameResolution {
        /// Host part of the URL.
        host: String,
        /// Resolver error.
        reason: String,
    },

    /// No live connection to the named peer.
    #[error("no connection to {peer}")]
    NotConnected {
        /// The peer as displayed by [`crate::Peer`].
        peer: String,
    },

    /// The rendezvous socket never connected.
    #[error("connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Address that was dialled.
        addr: String,
        /// Connect budget in milliseconds.
        timeout_ms: u64,
    },

    /// A bounded wait ran out.
    #[error("{what} timed out after {elapsed_ms}ms")]
    Timeout {
        /// The wait that expired.
        what: &'static str,
        /// Time spent waiting.
        elapsed_ms: u64,
    },

    /// The rendezvous exchange failed part-way.
    #[error("handshake failed during {phase}: {source}")]
    Handshake {
        /// Handshake step that failed.
        phase: &'static str,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// A completion queue reported a failed or unexpected event.
    #[error("completion failure on cq {cq}: {detail}")]
    Completion {
        /// Completion queue id.
        cq: u64,
        /// Role, state and queue diagnostics.
        detail: String,
    },

    /// The transport's cancel flag was raised.
    #[error("operation cancelled")]
    Cancelled,

    /// A buffer allocation failed.
    #[error("allocation of {requested} bytes failed")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
    },

    /// Encoding or decoding of a wire record failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Error reported by the NIC driver.
    #[error(transparent)]
    Nic(#[from] NicError),

    /// Socket error outside the handshake.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Maps the error onto the transport's result-code taxonomy.
    pub fn code(&self) -> ResultCode {
        match self {
            TransportError::InvalidUrl { .. }
            | TransportError::InvalidArgument { .. }
            | TransportError::Config { .. } => ResultCode::InvalidArgument,
            TransportError::NameResolution { .. } | TransportError::NotConnected { .. } => {
                ResultCode::NoEntry
            }
            TransportError::ConnectTimeout { .. } | TransportError::Timeout { .. } => {
                ResultCode::TimedOut
            }
            TransportError::Handshake { .. }
            | TransportError::Completion { .. }
            | TransportError::Serialization(_)
            | TransportError::Io(_) => ResultCode::Io,
            TransportError::Cancelled => ResultCode::Canceled,
            TransportError::OutOfMemory { .. } => ResultCode::OutOfMemory,
            TransportError::Nic(err) => match err {
                NicError::PermissionDenied { .. } => ResultCode::PermissionDenied,
                NicError::OutOfMemory { .. } => ResultCode::OutOfMemory,
                NicError::Timeout { .. } => ResultCode::TimedOut,
                NicError::InvalidDescriptor { .. } => ResultCode::InvalidArgument,
                _ => ResultCode::Io,
            },
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        TransportError::InvalidArgument {
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for TransportError {
    fn from(err: bincode::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;
