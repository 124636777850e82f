//! Error types for ring setup, submission, and registration.

use std::io;

use thiserror::Error;

/// Errors surfaced by ring construction and kernel interaction.
///
/// Expected conditions are not errors: a full submission queue is a `None`
/// from the slot acquisition path, and unregistering an absent buffer
/// group or buffer ring id is a no-op. Per-operation failures travel as
/// negative errno values in the completion record, never through here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Rejected before any kernel interaction.
    #[error("invalid config: {0}")]
    Config(String),

    #[error("io_uring_setup: {0}")]
    Setup(io::Error),

    #[error("mapping submission ring: {0}")]
    MapSubmissionRing(io::Error),

    #[error("mapping submission entries: {0}")]
    MapSubmissionEntries(io::Error),

    #[error("mapping completion ring: {0}")]
    MapCompletionRing(io::Error),

    /// madvise on a fresh ring mapping failed, which means the mapping
    /// itself is suspect.
    #[error("madvise on ring mapping: {0}")]
    Advise(io::Error),

    #[error("io_uring_enter: {0}")]
    Enter(io::Error),

    #[error("io_uring_register: {0}")]
    Register(io::Error),

    /// The provide-buffers / remove-buffers operation that backs a buffer
    /// group registration completed with an error.
    #[error("buffer group setup: {0}")]
    BufferGroup(io::Error),

    /// The kernel does not advertise the feature this call needs.
    #[error("kernel feature not available: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
