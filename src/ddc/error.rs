//! Error classification for the DDC/CI core engine.
//!
//! `DdcError` is the leaf classification every component agrees on; the retry
//! controller folds a sequence of these (one per attempt) into an
//! [`ErrorChain`] so the final, user-visible error still carries the history
//! that led to it.

use thiserror::Error;

/// Classified outcome of a single protocol-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DdcError {
    /// Structural or checksum failure in a received packet.
    #[error("malformed DDC/CI response: {0}")]
    MalformedData(&'static str),

    /// The canonical 4-byte `6F 6E 80 BE` sentinel.
    #[error("null response")]
    NullResponse,

    /// A read succeeded but every byte in the fill region was zero.
    #[error("all-zero response")]
    AllZero,

    /// A valid VCP reply reported `result_code == 0x01`.
    #[error("feature unsupported by display")]
    Unsupported,

    /// The bus is already held by another thread and `wait` was not requested.
    #[error("display bus is locked by another thread")]
    Locked,

    /// The calling thread already holds an open handle on this bus.
    #[error("display already open on this thread")]
    AlreadyOpen,

    /// The opened bus has no EDID; the core refuses such a handle.
    #[error("no EDID present on bus")]
    Edid,

    /// Pass-through OS error (`-errno`) from the transport.
    #[error("I/O error (errno {0})")]
    Io(i32),

    /// Retries were exhausted without success or a terminal classification.
    #[error("retries exhausted")]
    RetriesExhausted,

    /// Every attempt (up to `null_max`) produced a Null Response.
    #[error("all responses were Null Response")]
    AllResponsesNull,

    /// Every attempt produced an all-zero read and `all_zero_response_ok` is false.
    #[error("all tries returned all-zero data")]
    AllTriesZero,

    /// A closed or otherwise invalid handle was used.
    #[error("invalid operation on closed handle")]
    InvalidOperation,
}

impl DdcError {
    /// `true` for a fatal kind that must abort a retry loop immediately,
    /// regardless of tries remaining.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DdcError::Io(libc_ebadf) if *libc_ebadf == EBADF)
            || matches!(self, DdcError::InvalidOperation)
    }
}

/// `EBADF` on Linux; used to recognize the one `-errno` value the retry
/// controller treats as fatal rather than retryable.
pub const EBADF: i32 = 9;

/// A terminal error together with the ordered per-attempt causes that led to
/// it. Attempts are recorded in the order they were made; `error` is the
/// final classification.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct ErrorChain {
    /// The final classification.
    pub error: DdcError,
    /// Which component raised this chain, for log/report context.
    pub source: &'static str,
    /// Per-attempt causes in attempt order.
    pub causes: Vec<DdcError>,
}

impl ErrorChain {
    pub fn new(error: DdcError, source: &'static str, causes: Vec<DdcError>) -> Self {
        Self {
            error,
            source,
            causes,
        }
    }

    pub fn leaf(error: DdcError, source: &'static str) -> Self {
        Self {
            error,
            source,
            causes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ebadf_is_fatal() {
        assert!(DdcError::Io(EBADF).is_fatal());
        assert!(!DdcError::Io(5).is_fatal());
        assert!(DdcError::InvalidOperation.is_fatal());
        assert!(!DdcError::NullResponse.is_fatal());
    }

    #[test]
    fn chain_preserves_attempt_order() {
        let chain = ErrorChain::new(
            DdcError::AllResponsesNull,
            "retry",
            vec![
                DdcError::NullResponse,
                DdcError::NullResponse,
                DdcError::NullResponse,
            ],
        );
        assert_eq!(chain.causes.len(), 3);
        assert!(chain.causes.iter().all(|c| *c == DdcError::NullResponse));
    }
}
