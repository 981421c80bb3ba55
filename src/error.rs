//! The crate-wide error type.

use alloc::string::String;
use core::fmt;
use core::result;

/// Everything that can go wrong while parsing a container, decompressing a
/// resource, or running the PPC32 emulator.
#[derive(Debug)]
pub enum Error {
    /// Bad magic, bad format version, or a byte sequence that doesn't parse
    /// as the structure it claims to be.
    Malformed(String),
    /// A guest memory access fell outside every allocated page region, or a
    /// symbol lookup found no such name.
    OutOfRange(String),
    /// The emulator decoded an opcode it does not carry execution semantics
    /// for.
    Unimplemented(String),
    /// The host couldn't back a page allocation, or the guest page free list
    /// has no region big enough to satisfy a request.
    AllocationFailure,
    /// An internal invariant was violated. A correctly functioning crate
    /// never raises this; its presence indicates a bug here, not bad input.
    LogicError(String),
    /// A `scroll` layout read/write failed.
    Scroll(scroll::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Malformed(msg) => write!(f, "malformed input: {msg}"),
            Error::OutOfRange(msg) => write!(f, "out of range: {msg}"),
            Error::Unimplemented(msg) => write!(f, "unimplemented: {msg}"),
            Error::AllocationFailure => write!(f, "allocation failure"),
            Error::LogicError(msg) => write!(f, "internal invariant violated: {msg}"),
            Error::Scroll(err) => write!(f, "{err}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Scroll(err) => Some(err),
            _ => None,
        }
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Self {
        Error::Scroll(err)
    }
}

pub type Result<T> = result::Result<T, Error>;
