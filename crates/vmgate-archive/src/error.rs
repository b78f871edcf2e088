//! Error types for the OVA container codec.

use std::fmt;

/// Categorised error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveErrorKind {
    /// Container file missing or unreadable
    Io,
    /// No descriptor entry in the container
    DescriptorMissing,
    /// A named entry does not exist in the container
    EntryMissing,
    /// Entry content is not valid text
    Encoding,
    /// Malformed tar structure
    Corrupt,
}

/// Crate error type carrying a kind + human-readable message.
#[derive(Debug, Clone)]
pub struct ArchiveError {
    pub kind: ArchiveErrorKind,
    pub message: String,
}

impl ArchiveError {
    pub fn new(kind: ArchiveErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(ArchiveErrorKind::Io, msg)
    }

    pub fn descriptor_missing(msg: impl Into<String>) -> Self {
        Self::new(ArchiveErrorKind::DescriptorMissing, msg)
    }

    pub fn entry_missing(msg: impl Into<String>) -> Self {
        Self::new(ArchiveErrorKind::EntryMissing, msg)
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::new(ArchiveErrorKind::Encoding, msg)
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::new(ArchiveErrorKind::Corrupt, msg)
    }
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for ArchiveError {}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        Self::io(format!("I/O error: {e}"))
    }
}

/// Convenience alias.
pub type ArchiveResult<T> = Result<T, ArchiveError>;
