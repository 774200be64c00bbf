//! Errors raised by the artifact store.

use thiserror::Error;

use crate::session::{SessionError, SpawnError};

/// Errors surfaced while moving artifacts to or from the bucket.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ArtifactError {
    /// A remote checksum or copy command failed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The local bucket CLI could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// Listing a key prefix failed.
    #[error("listing s3://{bucket}/{prefix}/ exited with status {status_text}: {stderr}")]
    List {
        /// Bucket listed.
        bucket: String,
        /// Key prefix listed.
        prefix: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the bucket CLI.
        stderr: String,
    },
    /// One download attempt failed.
    #[error("download of {key} exited with status {status_text}: {stderr}")]
    Download {
        /// Object key requested.
        key: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the bucket CLI.
        stderr: String,
    },
    /// Every download attempt failed.
    #[error("download of {key} failed after {attempts} attempts: {last}")]
    DownloadExhausted {
        /// Object key requested.
        key: String,
        /// Attempts made.
        attempts: u32,
        /// Final failure.
        last: String,
    },
}
