//! SorError: unified error type for rb-sor public APIs
//!
//! Configuration problems are reported before any transport is opened;
//! transport and topology failures are fatal to the run and trigger the
//! cleanup path before they reach the caller.

use thiserror::Error;

/// Exit code for an invalid problem size or an impossible termination setup.
pub const EXIT_CONFIG: i32 = 1;
/// Exit code for malformed command-line arguments.
pub const EXIT_USAGE: i32 = 33;

/// Errors raised by the message-passing layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommError {
    /// The port to `peer` on `tag` has been closed (locally or by shutdown).
    #[error("port to rank {peer} (tag {tag:#06x}) is closed")]
    Closed { peer: usize, tag: u16 },
    /// A received message did not have the expected byte length.
    #[error("expected {expected} bytes, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    /// The backend cannot provide the requested delivery mode.
    #[error("unsupported by this backend: {0}")]
    Unsupported(&'static str),
    /// Backend-specific failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Unified error type for rb-sor operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SorError {
    /// Malformed command-line argument.
    #[error("invalid argument `{arg}`: {reason}")]
    InvalidArgument { arg: String, reason: String },
    /// Every rank must own at least one interior row.
    #[error("Problem too small for number of CPU's: {interior_rows} interior rows for {ranks} ranks")]
    ProblemTooSmall { interior_rows: usize, ranks: usize },
    /// Dynamic termination needs the reducer.
    #[error("Need to specify maxIters if reduction is off")]
    MissingIterations,
    /// Any other inconsistent configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Send, receive or reduce failed; numerical state is no longer trustworthy.
    #[error("communication with rank {neighbor} failed: {source}")]
    Comm {
        neighbor: usize,
        #[source]
        source: CommError,
    },
    /// A peer identity could not be resolved through the registry.
    #[error("topology resolution failed: {0}")]
    Topology(String),
}

impl SorError {
    /// Wrap a transport failure observed while talking to `neighbor`.
    pub fn comm(neighbor: usize, source: CommError) -> Self {
        SorError::Comm { neighbor, source }
    }

    /// True for errors raised before any transport is opened.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SorError::InvalidArgument { .. }
                | SorError::ProblemTooSmall { .. }
                | SorError::MissingIterations
                | SorError::Configuration(_)
        )
    }

    /// Process exit code the `sor` binary uses for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SorError::InvalidArgument { .. } => EXIT_USAGE,
            _ => EXIT_CONFIG,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_family() {
        let bad = SorError::InvalidArgument {
            arg: "x".into(),
            reason: "not a number".into(),
        };
        assert_eq!(bad.exit_code(), EXIT_USAGE);
        assert_eq!(SorError::MissingIterations.exit_code(), EXIT_CONFIG);
        let small = SorError::ProblemTooSmall {
            interior_rows: 2,
            ranks: 4,
        };
        assert_eq!(small.exit_code(), EXIT_CONFIG);
        assert!(small.is_configuration());
        assert!(!SorError::comm(1, CommError::Closed { peer: 1, tag: 7 }).is_configuration());
    }
}
