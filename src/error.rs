//! Crate-wide error taxonomy. Configuration and allocation failures are
//! fatal and bubble all the way up; ingest failures never reach here (they
//! are logged and the offending frame is dropped in place); device-copy
//! failures are surfaced to the caller of `enqueue_host_to_device_copy`.
//!
//! A single `Fail`-deriving enum with one variant per failure domain and
//! `From` impls for each wrapped error type, so `?` composes across module
//! boundaries.

use failure::Fail;

use crate::interval::MarshalError;
use crate::ring_buffer::AllocError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "invalid configuration: {}", inner)]
    Config { inner: ConfigError },

    #[fail(display = "failed to allocate staging memory: {}", inner)]
    Alloc { inner: AllocError },

    #[fail(display = "failed to enqueue a host-to-device copy: {}", inner)]
    DeviceCopy { inner: DeviceCopyError },

    #[fail(display = "failed to marshal a validity set: {}", inner)]
    Marshal { inner: MarshalError },
}

impl From<ConfigError> for Error {
    fn from(inner: ConfigError) -> Self {
        Error::Config { inner }
    }
}

impl From<AllocError> for Error {
    fn from(inner: AllocError) -> Self {
        Error::Alloc { inner }
    }
}

impl From<DeviceCopyError> for Error {
    fn from(inner: DeviceCopyError) -> Self {
        Error::DeviceCopy { inner }
    }
}

impl From<MarshalError> for Error {
    fn from(inner: MarshalError) -> Self {
        Error::Marshal { inner }
    }
}

/// Fatal at startup: bad node-list length, or any other option the running
/// `Parset` variant does not recognize.
#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(
        display = "{} buffer node list has {} entries but there are {} descriptors",
        which, nodes, descriptors
    )]
    NodeListLengthMismatch {
        which: &'static str,
        nodes: usize,
        descriptors: usize,
    },

    #[fail(
        display = "ring buffer length {} is too small for window {} + history {} + slack {}",
        ring, window, history, slack
    )]
    RingTooSmall {
        ring: u64,
        window: u64,
        history: u64,
        slack: u64,
    },

    #[fail(display = "unrecognized configuration option: {}", option)]
    UnknownOption { option: String },
}

/// Surfaced from `enqueueHostToDeviceCopy`. A window wider than the ring
/// (`end - earlyStart > R`) is a programming error, not a `DeviceCopyError`
/// variant: it is caught by a `debug_assert!` in `ring_buffer`, per this
/// crate's policy of asserting rather than recovering from an invariant the
/// caller is responsible for upholding.
#[derive(Debug, Fail)]
pub enum DeviceCopyError {
    #[fail(display = "accelerator stream rejected the copy: {}", reason)]
    StreamRejected { reason: String },
}
