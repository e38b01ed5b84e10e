//! Error types for every fallible component, one `snafu` enum per module
//! rather than a single crate-wide error type.

use std::path::PathBuf;

use snafu::Snafu;

/// I/O failure raised by [`crate::posix::PosixFile`] and [`crate::data_file::DataFile`].
///
/// Always carries the file name and the syscall that failed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PosixError {
    #[snafu(display("{op} failed on {path}: {source}"))]
    Io {
        path: PathBuf,
        op: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("{op} on {path}: file descriptor is closed"))]
    Closed { path: PathBuf, op: &'static str },
}

impl PosixError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            PosixError::Io { path, .. } => path,
            PosixError::Closed { path, .. } => path,
        }
    }
}

/// Parity/consistency failures raised while reading the data file, and
/// operational errors raised by the overflow engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum OverflowError {
    #[snafu(display("I/O error: {source}"))]
    OverflowIo { source: PosixError },

    #[snafu(display(
        "record at offset {offset} in data file {path} has an invalid header (parity check failed)"
    ))]
    InvalidParity { path: PathBuf, offset: u64 },

    #[snafu(display(
        "record header at offset {offset} in data file {path} is truncated: read {read} of {expected} bytes"
    ))]
    TruncatedHeader {
        path: PathBuf,
        offset: u64,
        read: usize,
        expected: usize,
    },

    #[snafu(display(
        "record at offset {offset} in data file {path} claims channel id {found}, expected {expected}"
    ))]
    ChannelIdMismatch {
        path: PathBuf,
        offset: u64,
        found: u32,
        expected: u32,
    },

    #[snafu(display(
        "record at offset {offset} in data file {path} has an impossible next_offset {next_offset}"
    ))]
    ImpossibleNextOffset {
        path: PathBuf,
        offset: u64,
        next_offset: i64,
    },

    #[snafu(display("channel id space exhausted: highest_channel_id already at u32::MAX"))]
    ChannelIdSpaceExhausted,

    #[snafu(display(
        "record at offset {offset} in data file {path} has channel id 0, which is reserved for the dummy head-truncation record"
    ))]
    ZeroChannelId { path: PathBuf, offset: u64 },

    #[snafu(display("engine is shutting down; no new channels may be created"))]
    ShutdownInProgress,

    #[snafu(display("unknown channel {name}"))]
    UnknownChannel { name: String },

    #[snafu(display("invalid storage name {name:?}: {reason}"))]
    InvalidStorageName { name: String, reason: &'static str },
}

impl From<PosixError> for OverflowError {
    fn from(source: PosixError) -> Self {
        OverflowError::OverflowIo { source }
    }
}

/// Fatal failures discovered while parsing the index file or validating
/// recovered state at startup.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RecoveryError {
    #[snafu(display("I/O error during recovery: {source}"))]
    RecoveryIo { source: PosixError },

    #[snafu(display("index file {path} line {line}: {reason}"))]
    IndexParse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[snafu(display("index file {path} line {line}: duplicate channel name {name:?}"))]
    DuplicateChannelName {
        path: PathBuf,
        line: usize,
        name: String,
    },

    #[snafu(display(
        "index file {path} line {line}: channel {name:?} has last_offset {last_offset} >= data file size {file_size}"
    ))]
    LastOffsetOutOfRange {
        path: PathBuf,
        line: usize,
        name: String,
        last_offset: i64,
        file_size: u64,
    },

    #[snafu(display("index file {path} line {line}: channel {name:?} has zero records, which cannot be recovered"))]
    EmptyChannelInIndex {
        path: PathBuf,
        line: usize,
        name: String,
    },

    #[snafu(display("data file {path}: expected magic {expected:?}, found {found:?}"))]
    BadMagic {
        path: PathBuf,
        expected: &'static [u8; 8],
        found: Vec<u8>,
    },

    #[snafu(display("recovered channel {name:?}: {source}"))]
    Consistency { name: String, source: OverflowError },

    #[snafu(display("duplicate channel id {id} (first seen on channel {first:?}, again on {second:?})"))]
    DuplicateChannelId { id: u32, first: String, second: String },

    #[snafu(display("duplicate first_offset {offset} (channels {first:?} and {second:?})"))]
    DuplicateFirstOffset {
        offset: u64,
        first: String,
        second: String,
    },

    #[snafu(display("duplicate last_offset {offset} (channels {first:?} and {second:?})"))]
    DuplicateLastOffset {
        offset: u64,
        first: String,
        second: String,
    },

    #[snafu(display(
        "data file {path} size {file_size} is smaller than reported totals (bytes={total_bytes}, records={total_records})"
    ))]
    DataFileTooSmall {
        path: PathBuf,
        file_size: u64,
        total_bytes: u64,
        total_records: u64,
    },

    #[snafu(display("{name:?}.rq names channel {dump_channel:?} but overflow channel {name:?} already exists without subscribers"))]
    StartupSubscriberMismatch { name: String, dump_channel: String },
}

impl From<PosixError> for RecoveryError {
    fn from(source: PosixError) -> Self {
        RecoveryError::RecoveryIo { source }
    }
}

/// Failures decoding a `<storage_id>.rq` memory-ring dump.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RingError {
    #[snafu(display("ring dump is too short to contain a header"))]
    Truncated,

    #[snafu(display("ring dump has an invalid magic"))]
    InvalidRingMagic,

    #[snafu(display("ring dump declares {declared} used bytes, exceeding capacity {capacity}"))]
    CapacityExceeded { declared: usize, capacity: usize },
}

/// Combines the failure modes a storage engine can hit across its two tiers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("I/O error: {source}"))]
    StorageIo { source: PosixError },

    #[snafu(display("overflow tier error: {source}"))]
    Overflow { source: OverflowError },

    #[snafu(display("failed to decode ring dump {path}: {source}"))]
    RingDecode { path: PathBuf, source: RingError },
}

impl From<PosixError> for StorageError {
    fn from(source: PosixError) -> Self {
        StorageError::StorageIo { source }
    }
}

impl From<OverflowError> for StorageError {
    fn from(source: OverflowError) -> Self {
        StorageError::Overflow { source }
    }
}
