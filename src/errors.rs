//! Error types for the relay.
//!
//! A single enumeration covers endpoint parsing, transport I/O, wire-level violations and
//! negotiation failures. Per-ref push rejections are not errors: they are recorded in the
//! [`PushReport`](crate::protocol::push::PushReport) and only influence the exit code.
//!
//! Notes:
//! - Variants carry the remote's text verbatim where the remote supplied one.
//! - [`RelayError::exit_code`] maps each failure class onto the process exit contract.

use thiserror::Error;

/// Exit code for a run whose push completed but rejected at least one ref.
pub const EXIT_REF_REJECTED: i32 = 1;
/// Exit code for protocol, negotiation and authentication failures.
pub const EXIT_PROTOCOL: i32 = 2;
/// Exit code for connectivity failures and timeouts.
pub const EXIT_CONNECTIVITY: i32 = 3;
/// Exit code for invalid input (endpoint strings, configuration).
pub const EXIT_USAGE: i32 = 64;

#[derive(Error, Debug)]
/// Unified error enumeration for the relay engine.
pub enum RelayError {
    /// Malformed or unrecognized endpoint string. No I/O is attempted.
    #[error("Unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    /// A remote rejected the supplied credentials. Never retried.
    #[error("Authentication rejected by {0}")]
    AuthRejected(String),

    /// The remote did not speak a protocol dialect we understand.
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// A pkt-line could not be decoded (bad length header or truncated payload).
    #[error("Malformed pkt-line frame: {0}")]
    MalformedFrame(String),

    /// A payload does not fit into a single pkt-line.
    #[error("Frame too large: {0} bytes exceeds the pkt-line limit")]
    FrameTooLarge(usize),

    /// A side-band packet used a channel other than 1, 2 or 3.
    #[error("Unknown side-band channel: {0}")]
    UnknownSidebandChannel(u8),

    /// Connect, read or write stalled past the configured bound.
    #[error("Transport timeout: {0}")]
    TransportTimeout(String),

    /// The source could not satisfy the wants, or aborted the pack with a fatal message.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The target failed to unpack or aborted the push with a fatal message.
    #[error("Push failed: {0}")]
    PushFailed(String),

    /// The transport could not be established or broke down (process exit, HTTP status).
    #[error("Connection error: {0}")]
    Connection(String),

    /// I/O error from the underlying pipe or socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The pack body was abandoned because the paired session failed.
    #[error("Pack relay aborted")]
    PackAborted,

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        RelayError::MalformedFrame(msg.into())
    }

    pub fn mismatch(msg: impl Into<String>) -> Self {
        RelayError::ProtocolMismatch(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        RelayError::Connection(msg.into())
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        RelayError::TransportTimeout(what.into())
    }

    /// Whether the failure is about reaching the remote rather than talking to it.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RelayError::TransportTimeout(_) | RelayError::Connection(_) | RelayError::Io(_)
        )
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::UnsupportedEndpoint(_) | RelayError::Config(_) => EXIT_USAGE,
            e if e.is_connectivity() => EXIT_CONNECTIVITY,
            _ => EXIT_PROTOCOL,
        }
    }

    /// Short name of the failure kind, used in the terminal summary line.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::UnsupportedEndpoint(_) => "UnsupportedEndpoint",
            RelayError::AuthRejected(_) => "AuthRejected",
            RelayError::ProtocolMismatch(_) => "ProtocolMismatch",
            RelayError::MalformedFrame(_) => "MalformedFrame",
            RelayError::FrameTooLarge(_) => "FrameTooLarge",
            RelayError::UnknownSidebandChannel(_) => "UnknownSidebandChannel",
            RelayError::TransportTimeout(_) => "TransportTimeout",
            RelayError::NegotiationFailed(_) => "NegotiationFailed",
            RelayError::PushFailed(_) => "PushFailed",
            RelayError::Connection(_) => "Connection",
            RelayError::Io(_) => "Io",
            RelayError::PackAborted => "PackAborted",
            RelayError::Config(_) => "Config",
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RelayError::TransportTimeout(e.to_string())
        } else {
            RelayError::Connection(e.to_string())
        }
    }
}
