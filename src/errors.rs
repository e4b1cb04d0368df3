use std::fmt;
use thiserror::Error;

/// Classifies every failure the crate can report.
///
/// The names mirror the wire-level taxonomy of the E57 format; `as_str`
/// yields the canonical spelling used in logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadApiArgument,
    BadCvHeader,
    BadCvPacket,
    BadChecksum,
    BadNodeDowncast,
    BadPathName,
    BufferSizeMismatch,
    BufferDuplicatePathName,
    ConversionRequired,
    ExpectingNumeric,
    ExpectingUString,
    FileReadOnly,
    ImageFileNotOpen,
    InternalError,
    InvarianceViolation,
    PathUndefined,
    ReaderNotOpen,
    Real64TooLarge,
    ScaledValueNotRepresentable,
    SeekFailed,
    ReadFailed,
    WriteFailed,
    SetTwice,
    TooManyReaders,
    TooManyWriters,
    ValueNotRepresentable,
    ValueOutOfBounds,
    WriterNotOpen,
    AlreadyHasParent,
}

impl ErrorKind {
    /// Canonical kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadApiArgument => "BadAPIArgument",
            Self::BadCvHeader => "BadCVHeader",
            Self::BadCvPacket => "BadCVPacket",
            Self::BadChecksum => "BadChecksum",
            Self::BadNodeDowncast => "BadNodeDowncast",
            Self::BadPathName => "BadPathName",
            Self::BufferSizeMismatch => "BufferSizeMismatch",
            Self::BufferDuplicatePathName => "BufferDuplicatePathName",
            Self::ConversionRequired => "ConversionRequired",
            Self::ExpectingNumeric => "ExpectingNumeric",
            Self::ExpectingUString => "ExpectingUString",
            Self::FileReadOnly => "FileReadOnly",
            Self::ImageFileNotOpen => "ImageFileNotOpen",
            Self::InternalError => "InternalError",
            Self::InvarianceViolation => "InvarianceViolation",
            Self::PathUndefined => "PathUndefined",
            Self::ReaderNotOpen => "ReaderNotOpen",
            Self::Real64TooLarge => "Real64TooLarge",
            Self::ScaledValueNotRepresentable => "ScaledValueNotRepresentable",
            Self::SeekFailed => "SeekFailed",
            Self::ReadFailed => "ReadFailed",
            Self::WriteFailed => "WriteFailed",
            Self::SetTwice => "SetTwice",
            Self::TooManyReaders => "TooManyReaders",
            Self::TooManyWriters => "TooManyWriters",
            Self::ValueNotRepresentable => "ValueNotRepresentable",
            Self::ValueOutOfBounds => "ValueOutOfBounds",
            Self::WriterNotOpen => "WriterNotOpen",
            Self::AlreadyHasParent => "AlreadyHasParent",
        }
    }

    /// Kinds that poison the whole container, not just one handle.
    #[must_use]
    pub const fn is_file_fatal(self) -> bool {
        matches!(
            self,
            Self::SeekFailed
                | Self::ReadFailed
                | Self::WriteFailed
                | Self::BadCvPacket
                | Self::BadChecksum
                | Self::BadCvHeader
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure value carried by every fallible operation: a kind plus a
/// textual context describing what was being attempted.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {context}")]
pub struct Error {
    kind: ErrorKind,
    context: String,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self { kind, context: context.into() }
    }

    /// The taxonomy kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The textual context the error was raised with.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    pub(crate) fn read_failed(err: &std::io::Error) -> Self {
        Self::new(ErrorKind::ReadFailed, err.to_string())
    }

    pub(crate) fn write_failed(err: &std::io::Error) -> Self {
        Self::new(ErrorKind::WriteFailed, err.to_string())
    }

    pub(crate) fn seek_failed(err: &std::io::Error) -> Self {
        Self::new(ErrorKind::SeekFailed, err.to_string())
    }

    pub(crate) fn internal(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, context)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
