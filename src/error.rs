//! Structured error values for the VMDK core.
//!
//! Mirrors the domain/code taxonomy of `libvmdk`'s `error.h`: every fallible
//! operation returns a variant tagged with the domain it belongs to, and
//! chains to whatever lower-level error (I/O, parse) caused it via
//! `#[source]`/`#[from]` so callers can walk the cause chain with
//! `std::error::Error::source()`.

use std::io;

/// Error domains, matching `spec.md` §7 / `libvmdk_error.h`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument was invalid (e.g. a negative seek result).
    #[error("argument error: {0}")]
    Argument(ArgumentError),

    /// A string/integer conversion failed.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Decompression of a grain failed or produced an unexpected size.
    #[error("compression error: {0}")]
    Compression(String),

    /// An I/O operation on a byte-stream failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The on-disk bytes were structurally invalid (bad magic, bad checksum,
    /// unsupported field value, RGD/GD mismatch, ...).
    #[error("input error: {0}")]
    Input(String),

    /// An allocation-sized request could not be satisfied.
    #[error("memory error: {0}")]
    Memory(String),

    /// A runtime invariant was violated (missing value, abort requested,
    /// index out of bounds, cache exhausted).
    #[error("runtime error: {0}")]
    Runtime(RuntimeError),

    /// The caller-supplied output buffer was too small.
    #[error("output error: {0}")]
    Output(String),
}

/// Fine-grained reasons within [`Error::Argument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArgumentError {
    #[error("value less than zero")]
    ValueLessThanZero,
    #[error("unsupported value")]
    UnsupportedValue,
    #[error("invalid value")]
    InvalidValue,
}

/// Fine-grained reasons within [`Error::Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("value missing")]
    ValueMissing,
    #[error("abort requested")]
    AbortRequested,
    #[error("value out of bounds")]
    ValueOutOfBounds,
    #[error("resize failed")]
    ResizeFailed,
}

impl Error {
    pub fn input(msg: impl Into<String>) -> Self {
        Error::Input(msg.into())
    }

    pub fn compression(msg: impl Into<String>) -> Self {
        Error::Compression(msg.into())
    }

    pub fn runtime(kind: RuntimeError) -> Self {
        Error::Runtime(kind)
    }

    pub fn argument(kind: ArgumentError) -> Self {
        Error::Argument(kind)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
