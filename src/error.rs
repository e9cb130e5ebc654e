//! Error taxonomy for the crate.
//!
//! Two tiers, mirroring the teacher's split between low-level parse errors and an
//! application-facing taxonomy:
//!
//! - [`WireErrorKind`]/[`WireError`]: malformed bit-level input (bad packet headers, short
//!   reads, CRC mismatches). These carry a byte offset, same as the teacher's `Error<D>`.
//! - [`MuxError`]: the taxonomy from spec.md §7 (`Invalid`/`Unhandled`/`Alloc`/`Busy`/`External`)
//!   surfaced at the `Mux`/`Program`/`Input` control-plane boundary.

use std::fmt;
use thiserror::Error;

/// Information about a malformed bit-level parse, without location context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireErrorKind {
    /// A [`crate::SliceReader`] read past the end of its slice. Carries the length of the
    /// offending read.
    PacketOverrun(usize),
    /// MPEG-TS packet headers must contain a sync byte of 0x47.
    LostSync,
    /// Inconsistent adaptation field parse.
    BadAdaptationHeader,
    /// Inconsistent PSI header parse.
    BadPsiHeader,
    /// Inconsistent PES header parse.
    BadPesHeader,
    /// A PSI section failed its CRC-32/MPEG-2 check.
    PsiCrcMismatch,
    /// A PSI table failed a structural validation rule (duplicate program number, version
    /// disagreement between sections of the same table, and so on).
    PsiValidationFailed(&'static str),
}

impl fmt::Display for WireErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireErrorKind::PacketOverrun(len) => write!(f, "packet overrun reading {} bytes", len),
            WireErrorKind::LostSync => write!(f, "lost sync (missing 0x47 sync byte)"),
            WireErrorKind::BadAdaptationHeader => write!(f, "bad adaptation field header"),
            WireErrorKind::BadPsiHeader => write!(f, "bad PSI header"),
            WireErrorKind::BadPesHeader => write!(f, "bad PES header"),
            WireErrorKind::PsiCrcMismatch => write!(f, "PSI section CRC-32 mismatch"),
            WireErrorKind::PsiValidationFailed(why) => write!(f, "PSI table validation failed: {}", why),
        }
    }
}

/// A [`WireErrorKind`] tagged with the byte offset at which it was encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireError {
    location: usize,
    kind: WireErrorKind,
}

impl WireErrorKind {
    /// Tags this error kind with a byte offset, producing a [`WireError`].
    pub fn at(self, location: usize) -> WireError {
        WireError {
            location,
            kind: self,
        }
    }
}

impl WireError {
    /// Byte offset within the packet/section the error was encountered at.
    pub fn location(&self) -> usize {
        self.location
    }

    /// The error kind, without location context.
    pub fn details(&self) -> WireErrorKind {
        self.kind
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at offset {})", self.kind, self.location)
    }
}

impl std::error::Error for WireError {}

/// [`std::result::Result`] alias using [`WireError`].
pub type WireResult<T> = std::result::Result<T, WireError>;

// Convenience: `WireErrorKind::Foo` can be used directly where a `WireError` is expected by
// tagging it at location 0. Call sites that know the true offset should prefer
// `reader.make_error(...)` instead.
impl From<WireErrorKind> for WireError {
    fn from(kind: WireErrorKind) -> Self {
        kind.at(0)
    }
}

/// Top-level error taxonomy for the multiplexer control plane (spec.md §7).
#[derive(Debug, Error)]
pub enum MuxError {
    /// Malformed input: bad flow definition, CRC failure, wrong MIME tag. Recovered locally by
    /// rejecting the offending uref/section.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Unknown control command or unsupported table family. Returned upward unchanged.
    #[error("unhandled: {0}")]
    Unhandled(String),

    /// Buffer or uref allocation failure. Raised as a fatal upstream event; the offending unit
    /// is dropped.
    #[error("allocation failure: {0}")]
    Alloc(String),

    /// Automatic PID/SID exhausted, or an input flow-def change arrived while the assembler
    /// still holds a pending table.
    #[error("busy: {0}")]
    Busy(String),

    /// Codec or buffer-manager-reported failure; treated like [`MuxError::Alloc`] for the
    /// affected unit.
    #[error("external failure: {0}")]
    External(String),
}

impl MuxError {
    /// True for errors that are fatal to the scheduler itself (`Alloc`, `External`), as opposed
    /// to errors that are recoverable by dropping the offending unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MuxError::Alloc(_) | MuxError::External(_))
    }
}

impl From<WireError> for MuxError {
    fn from(e: WireError) -> Self {
        MuxError::Invalid(e.to_string())
    }
}

/// [`std::result::Result`] alias using [`MuxError`].
pub type MuxResult<T> = std::result::Result<T, MuxError>;
