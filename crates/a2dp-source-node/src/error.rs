//! Error types for the A2DP source node.
//!
//! The taxonomy mirrors the fault kinds a SPA-style node contract
//! distinguishes: malformed negotiation calls (`InvalidArg`), calls made
//! before required state is established (`IoState`), unknown parameter/IO
//! ids (`NotFound`), operations the node never supports (`Unsupported`),
//! and the two classes of transport fault (`TransportFailure`,
//! `ResourceLoss`).

use thiserror::Error;

/// Errors returned by node negotiation, command handling, and the data path.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Bad parameter id, wrong direction/port, malformed format, unsupported
    /// media, unmapped buffer memory, unknown reuse id.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Operation requires state that is not set (`have_format`,
    /// `n_buffers > 0`, `transport != null`).
    #[error("operation requires state not currently set: {0}")]
    IoState(String),

    /// Unknown parameter id or IO id.
    #[error("not found: {0}")]
    NotFound(String),

    /// `add_port`, `remove_port`, or a command other than Start/Pause/Suspend.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Acquire failed, codec init failed, or a socket error other than
    /// EINTR/EAGAIN. The engine deregisters its sources but does not crash.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// `Transport.destroy` fired; the node stays alive but refuses
    /// data-path work until a new transport is provided.
    #[error("transport resource lost")]
    ResourceLoss,

    /// Underlying codec reported a failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// Propagated I/O error (config loading, socket setup).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Recovery classification, mirrors how the realtime engine should react to
/// a given fault instead of treating every `NodeError` the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Caller may retry immediately (e.g. a transient `EAGAIN`-adjacent fault).
    Retry,
    /// Drop the current unit of work (packet, param enumeration) and continue.
    Skip,
    /// Log and keep running; no corrective action needed.
    LogAndContinue,
    /// The data path cannot continue; the offending source must be removed.
    Fatal,
}

impl NodeError {
    /// Recommended reaction for this error, used by the realtime engine's
    /// reactors to decide whether to deregister a source.
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            NodeError::InvalidArg(_) | NodeError::NotFound(_) | NodeError::Unsupported(_) => {
                RecoveryStrategy::LogAndContinue
            }
            NodeError::IoState(_) => RecoveryStrategy::LogAndContinue,
            NodeError::Codec(_) => RecoveryStrategy::Skip,
            NodeError::TransportFailure(_) => RecoveryStrategy::Fatal,
            NodeError::ResourceLoss => RecoveryStrategy::Fatal,
            NodeError::Io(_) => RecoveryStrategy::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failure_is_fatal() {
        let err = NodeError::TransportFailure("acquire failed".into());
        assert_eq!(err.recovery_strategy(), RecoveryStrategy::Fatal);
    }

    #[test]
    fn invalid_arg_is_log_and_continue() {
        let err = NodeError::InvalidArg("bad port id".into());
        assert_eq!(err.recovery_strategy(), RecoveryStrategy::LogAndContinue);
    }
}
