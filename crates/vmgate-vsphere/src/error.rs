//! Error types for the vSphere transfer core.

use std::fmt;

/// Categorised error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VsphereErrorKind {
    /// Control plane unreachable, or session could not be (re)established
    Connection,
    /// Authentication failed (401), including the single reconnect retry
    Authentication,
    /// Transfer lease reported the ERROR state or could not be driven
    Lease,
    /// Container / descriptor problem surfaced before any remote side effect
    Archive,
    /// Network failure mid-stream; the device transfer must be restarted
    PartialTransfer,
    /// Resource not found (404)
    NotFound,
    /// HTTP / API error with status code
    Api(u16),
    /// JSON parse / deserialization error
    Parse,
    /// Timeout
    Timeout,
    /// Generic
    Other,
}

/// Crate error type carrying a kind + human-readable message.
#[derive(Debug, Clone)]
pub struct VsphereError {
    pub kind: VsphereErrorKind,
    pub message: String,
}

impl VsphereError {
    pub fn new(kind: VsphereErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Connection, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Authentication, msg)
    }

    pub fn lease(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Lease, msg)
    }

    pub fn archive(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Archive, msg)
    }

    pub fn partial_transfer(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::PartialTransfer, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::NotFound, msg)
    }

    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Api(status), msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Parse, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Timeout, msg)
    }
}

impl fmt::Display for VsphereError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for VsphereError {}

impl From<VsphereError> for String {
    fn from(e: VsphereError) -> String {
        e.to_string()
    }
}

impl From<reqwest::Error> for VsphereError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(format!("HTTP timeout: {e}"))
        } else if e.is_connect() {
            Self::connection(format!("Connection failed: {e}"))
        } else {
            Self::new(VsphereErrorKind::Other, format!("HTTP error: {e}"))
        }
    }
}

impl From<serde_json::Error> for VsphereError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(format!("JSON parse error: {e}"))
    }
}

impl From<std::io::Error> for VsphereError {
    fn from(e: std::io::Error) -> Self {
        Self::new(VsphereErrorKind::Other, format!("I/O error: {e}"))
    }
}

impl From<vmgate_archive::ArchiveError> for VsphereError {
    fn from(e: vmgate_archive::ArchiveError) -> Self {
        Self::archive(e.to_string())
    }
}

/// Convenience alias.
pub type VsphereResult<T> = Result<T, VsphereError>;
