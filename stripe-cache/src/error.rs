//! The error taxonomy of the cache engine (see `SPEC_FULL.md` §7).
//!
//! Each subsystem owns a narrow `snafu`-derived error enum (mirroring
//! `vector_buffers::disk_v2::{writer::WriterError, reader::ReaderError}`);
//! [`CacheError`] is the caller-facing union that every public `VC` method
//! returns.

use std::io;

use snafu::Snafu;

use crate::doc::DocValidationError;

/// Errors surfaced by the on-disk write path (aggregation, evacuation writes).
#[derive(Debug, Snafu)]
pub enum WriteError {
    #[snafu(display("write I/O error: {source}"))]
    Io { source: io::Error },

    #[snafu(display(
        "record of {size} bytes exceeds the aggregation buffer ({agg_size} bytes)"
    ))]
    RecordTooLarge { size: usize, agg_size: usize },

    #[snafu(display(
        "write backlog exceeded: {pending} bytes pending against a backlog of {backlog} bytes"
    ))]
    BacklogExceeded { pending: u64, backlog: u64 },

    #[snafu(display("document of {size} bytes exceeds the configured max_doc_size {max}"))]
    MaxDocSizeExceeded { size: u64, max: u64 },

    #[snafu(display("fragment of {size} bytes exceeds MAX_FRAG_SIZE {max}"))]
    FragmentTooLarge { size: u64, max: u64 },
}

/// Errors surfaced by the on-disk read path (directory probe, physical read, decode).
#[derive(Debug, Snafu)]
pub enum ReadError {
    #[snafu(display("read I/O error: {source}"))]
    Io { source: io::Error },

    #[snafu(display("document validation failed: {source}"))]
    Invalid { source: DocValidationError },

    #[snafu(display("no alternate in the object satisfies the request"))]
    AltMiss,
}

/// The caller-facing error enum every public operation (`open_read`,
/// `open_write`, `remove`, `scan`, `link`, `deref`, `lookup`) can return.
#[derive(Debug, Snafu)]
pub enum CacheError {
    /// Operation arrived before initialization, or after fatal shutdown.
    #[snafu(display("cache not ready"))]
    NotReady,

    /// Directory miss, or scan exhausted without a match.
    #[snafu(display("no document for key"))]
    NoDoc,

    /// Another writer exists and read-while-write is disallowed, or its
    /// retry budget was exhausted.
    #[snafu(display("document busy: {reason}"))]
    DocBusy { reason: &'static str },

    /// The object exists, but no alternate satisfies the request.
    #[snafu(display("no alternate satisfies the request"))]
    AltMiss,

    /// The physical read failed; the owning disk's error counter was bumped.
    #[snafu(display("physical read failed: {source}"))]
    ReadFail { source: io::Error },

    /// On-disk record failed magic/version/checksum validation.
    #[snafu(display("bad metadata: {source}"))]
    BadMetaData { source: DocValidationError },

    /// Caller-side contract violation.
    #[snafu(display("bad read request: {reason}"))]
    BadReadRequest { reason: &'static str },

    /// Transient soft failure in the aggregation path; disk state is untouched.
    #[snafu(display("soft write failure: {source}"))]
    AioSoftFailure { source: WriteError },

    /// A non-writer operation was attempted against a key with no prior write.
    #[snafu(display("remove failed: no such key"))]
    RemoveFailed,
}

impl From<ReadError> for CacheError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Io { source } => CacheError::ReadFail { source },
            ReadError::Invalid { source } => CacheError::BadMetaData { source },
            ReadError::AltMiss => CacheError::AltMiss,
        }
    }
}

impl From<WriteError> for CacheError {
    fn from(source: WriteError) -> Self {
        CacheError::AioSoftFailure { source }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
