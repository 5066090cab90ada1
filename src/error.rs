//! # Typed Storage Errors
//!
//! Most failures in pulsedb surface as `eyre::Report` with call-site
//! context. A handful of conditions are part of the storage engine's control
//! flow and must be recognizable after crossing several layers:
//!
//! - `OutOfPages` makes the engine allocate a fresh data file and retry.
//! - `OutOfOrder` reroutes the datapoint to an out-of-order page.
//! - `VersionMismatch` / `ResolutionMismatch` abort a file open.
//! - `Corrupt` quarantines a file and lets the rest of the database run.
//! - `ShutdownInProgress` is surfaced to callers as retryable.
//!
//! These are raised with `bail!(StorageError::...)` and recovered with
//! `Report::downcast_ref::<StorageError>()` at the engine boundary, so the
//! error keeps its identity no matter how much context was wrapped around it.

/// Storage conditions with dedicated recovery paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// File was written by an incompatible major version.
    VersionMismatch { file: u8, ours: u8 },
    /// File timestamp resolution differs from the configured resolution.
    ResolutionMismatch,
    /// The data file has no free physical page or header slot left.
    OutOfPages,
    /// Timestamp is older than the last one accepted by an in-place codec.
    OutOfOrder,
    /// A header failed its self-check; the file must be quarantined.
    Corrupt,
    /// The engine is shutting down; the operation may be retried elsewhere.
    ShutdownInProgress,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::VersionMismatch { file, ours } => {
                write!(f, "file major version {} incompatible with {}", file, ours)
            }
            StorageError::ResolutionMismatch => {
                write!(f, "timestamp resolution in config differs from data file")
            }
            StorageError::OutOfPages => write!(f, "data file has no free pages"),
            StorageError::OutOfOrder => write!(f, "timestamp is out of order"),
            StorageError::Corrupt => write!(f, "data file failed header self-check"),
            StorageError::ShutdownInProgress => write!(f, "shutdown in progress"),
        }
    }
}

impl std::error::Error for StorageError {}

impl StorageError {
    /// True when `report` carries this exact storage error.
    pub fn is(report: &eyre::Report, kind: StorageError) -> bool {
        report
            .downcast_ref::<StorageError>()
            .is_some_and(|e| *e == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::{bail, Result, WrapErr};

    fn fail_with(kind: StorageError) -> Result<()> {
        bail!(kind)
    }

    #[test]
    fn survives_context_wrapping() {
        let err = fail_with(StorageError::OutOfPages)
            .wrap_err("allocating page for series 7")
            .unwrap_err();

        assert!(StorageError::is(&err, StorageError::OutOfPages));
        assert!(!StorageError::is(&err, StorageError::OutOfOrder));
    }

    #[test]
    fn version_mismatch_message_names_both_versions() {
        let msg = StorageError::VersionMismatch { file: 2, ours: 1 }.to_string();
        assert!(msg.contains('2'));
        assert!(msg.contains('1'));
    }
}
