//! Error types for the echo benchmark.

use std::io;
use thiserror::Error;

use crate::{config::ConfigError, qp::QpState, submit::OpKind};

/// Result type for benchmark operations.
pub type Result<T> = std::result::Result<T, BenchError>;

/// Errors that can occur while setting up or running the benchmark.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BenchError {
    /// Device open, resource creation or out-of-band channel failure
    #[error("Setup failed: {0}")]
    Setup(String),

    /// Queue pair rejected a state transition
    #[error("Queue pair transition {from:?} -> {to:?} failed: {reason}")]
    Transition {
        from: QpState,
        to: QpState,
        reason: String,
    },

    /// Work request was not accepted by the local queue
    #[error("Submission failed: {0}")]
    Submission(String),

    /// A completion reported a non-success status
    #[error("{kind} completion failed with status {status} (wr_id={wr_id:#x})")]
    Completion {
        kind: OpKind,
        status: String,
        wr_id: u64,
    },

    /// A receive completed for a slot other than the oldest posted one
    #[error("Receive ring out of order: expected slot {expected}, got {actual}")]
    RingOrder { expected: usize, actual: usize },

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BenchError {
    /// Convert to an appropriate errno value for the process exit path
    #[inline]
    #[must_use]
    #[allow(clippy::wildcard_enum_match_arm)]
    pub fn to_errno(&self) -> i32 {
        match *self {
            BenchError::InvalidInput(_) | BenchError::Config(_) => libc::EINVAL,
            BenchError::Submission(_) => libc::ENOSPC,
            BenchError::Setup(_) | BenchError::Transition { .. } => libc::ECONNREFUSED,
            BenchError::IoError(ref e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Maps an I/O failure on the out-of-band channel into a setup failure.
    ///
    /// Short reads and short writes surface as `UnexpectedEof` / `WriteZero`.
    pub(crate) fn oob(what: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => {
                BenchError::Setup(format!("short read while receiving {what}"))
            }
            io::ErrorKind::WriteZero => {
                BenchError::Setup(format!("short write while sending {what}"))
            }
            _ => BenchError::Setup(format!("{what}: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_read_is_setup_failure() {
        let err = BenchError::oob("descriptor", io::ErrorKind::UnexpectedEof.into());
        assert!(matches!(err, BenchError::Setup(ref msg) if msg.contains("short read")));
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(
            BenchError::InvalidInput("x".into()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(BenchError::Submission("full".into()).to_errno(), libc::ENOSPC);
        let err = BenchError::Completion {
            kind: OpKind::Recv,
            status: "remote access error".into(),
            wr_id: 7,
        };
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(err.to_string().starts_with("recv completion failed"));
    }
}
