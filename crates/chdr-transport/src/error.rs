//! Transport error taxonomy.

use std::time::Duration;

use chdr_core::chdr::ChdrError;
use chdr_core::wire::WireError;

pub type TransportResult<T> = Result<T, TransportError>;

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad or conflicting parameters. Reported at setup, never retried.
    Configuration,
    /// One exchange timed out or failed a sanity check. Retry.
    TransientIo,
    /// A packet failed validation. Drop it and carry on.
    MalformedPacket,
    /// Another process holds the device.
    ClaimConflict,
    /// No channel, endpoint id or similar left. Not retried.
    ResourceExhausted,
    /// The device misbehaved. Stop using the link.
    HardwareFault,
    /// Socket or OS failure.
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: &'static str, after: Duration },

    #[error("reply mismatch: {0}")]
    ReplyMismatch(String),

    #[error("device reported an error for {0}")]
    DeviceError(String),

    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: String,
        attempts: u32,
        last: Box<TransportError>,
    },

    #[error(transparent)]
    Codec(#[from] ChdrError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("device claimed by another process (owner 0x{0:08x})")]
    DeviceClaimed(u32),

    #[error("no {0} available")]
    ResourceExhausted(&'static str),

    #[error("hardware fault: {0}")]
    HardwareFault(String),

    #[error("path MTU {found} is below the minimum {minimum}")]
    MtuTooSmall { found: usize, minimum: usize },

    #[error("{0} does not answer MTU probes")]
    ProbeUnsupported(String),

    #[error("link closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Config(_)
            | TransportError::MtuTooSmall { .. }
            | TransportError::ProbeUnsupported(_) => ErrorClass::Configuration,
            TransportError::Timeout { .. }
            | TransportError::ReplyMismatch(_)
            | TransportError::DeviceError(_)
            | TransportError::RetriesExhausted { .. } => ErrorClass::TransientIo,
            TransportError::Codec(_) | TransportError::Wire(_) => ErrorClass::MalformedPacket,
            TransportError::DeviceClaimed(_) => ErrorClass::ClaimConflict,
            TransportError::ResourceExhausted(_) => ErrorClass::ResourceExhausted,
            TransportError::HardwareFault(_) => ErrorClass::HardwareFault,
            TransportError::Closed | TransportError::Io(_) => ErrorClass::Io,
        }
    }

    /// True for a single failed exchange that is worth repeating.
    /// An exhausted retry loop is not retryable again.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientIo
            && !matches!(self, TransportError::RetriesExhausted { .. })
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        TransportError::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert_eq!(TransportError::config("x").class(), ErrorClass::Configuration);
        assert_eq!(
            TransportError::Codec(ChdrError::UnknownPacketType(3)).class(),
            ErrorClass::MalformedPacket
        );
        assert_eq!(TransportError::ResourceExhausted("DMA channel").class(), ErrorClass::ResourceExhausted);
        assert_eq!(TransportError::HardwareFault("busy".into()).class(), ErrorClass::HardwareFault);
    }

    #[test]
    fn only_single_exchanges_are_retryable() {
        let timeout = TransportError::Timeout {
            what: "peek reply",
            after: Duration::from_millis(100),
        };
        assert!(timeout.is_retryable());

        let exhausted = TransportError::RetriesExhausted {
            op: "peek32".into(),
            attempts: 3,
            last: Box::new(timeout),
        };
        assert!(!exhausted.is_retryable());
        assert_eq!(exhausted.class(), ErrorClass::TransientIo);
        assert!(exhausted.to_string().contains("after 3 attempts"));
    }
}
