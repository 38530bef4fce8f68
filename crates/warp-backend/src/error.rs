//! Backend error types
//!
//! Error types for the backend chain and the extent ledger, plus the
//! errno-style codes the transport puts on the wire.

use std::io;

use thiserror::Error;

/// Backend result type
pub type BackendResult<T> = Result<T, BackendError>;

/// Backend error types
#[derive(Debug, Error)]
pub enum BackendError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Range contract violated (ledger window, first extent, export size)
    #[error("Range error: {0}")]
    Range(String),

    /// Extent added out of order
    #[error("Extents must be added in ascending, contiguous order: expected offset {expected}, got {found}")]
    Ordering { expected: u64, found: u64 },

    /// Request outside the export
    #[error("Invalid range: offset {offset} count {count} (export size: {size})")]
    InvalidRange { offset: u64, count: u64, size: u64 },

    /// Operation issued in the wrong context state
    #[error("{backend}: {operation} not permitted in state {state}")]
    InvalidState {
        backend: String,
        operation: &'static str,
        state: String,
    },

    /// Flags not accepted by the operation
    #[error("{operation}: invalid flags {flags:#x}")]
    InvalidFlags { operation: &'static str, flags: u32 },

    /// Data operation issued before its capability was confirmed
    #[error("{backend}: {capability} was not negotiated")]
    NotNegotiated {
        backend: String,
        capability: &'static str,
    },

    /// Empty export name requested but the backend has no default export
    #[error("Default export (\"\") not permitted")]
    NoDefaultExport,

    /// Backend name failed validation
    #[error("Invalid backend name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Export not found
    #[error("Export not found: {0}")]
    NoSuchExport(String),

    /// Read-only export
    #[error("Export is read-only")]
    ReadOnly,

    /// Out of space
    #[error("Out of space")]
    OutOfSpace,

    /// Unsupported operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The chain was unloaded
    #[error("Backend chain has been unloaded")]
    Unloaded,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend-reported error code
    #[error("Backend error: {0}")]
    Code(NbdError),
}

impl BackendError {
    /// Convert to NBD error code
    pub fn to_nbd_error(&self) -> NbdError {
        match self {
            BackendError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => NbdError::NoSuchDevice,
                io::ErrorKind::PermissionDenied => NbdError::Perm,
                io::ErrorKind::OutOfMemory => NbdError::NoMem,
                io::ErrorKind::InvalidInput => NbdError::Inval,
                io::ErrorKind::Unsupported => NbdError::NotSup,
                _ => NbdError::Io,
            },
            BackendError::Range(_)
            | BackendError::Ordering { .. }
            | BackendError::InvalidRange { .. }
            | BackendError::InvalidFlags { .. }
            | BackendError::InvalidState { .. }
            | BackendError::NotNegotiated { .. }
            | BackendError::NoDefaultExport
            | BackendError::InvalidName { .. } => NbdError::Inval,
            BackendError::NoSuchExport(_) => NbdError::NoSuchDevice,
            BackendError::ReadOnly => NbdError::Perm,
            BackendError::OutOfSpace => NbdError::NoSpc,
            BackendError::Unsupported(_) => NbdError::NotSup,
            BackendError::Unloaded => NbdError::Shutdown,
            BackendError::Config(_) => NbdError::Inval,
            BackendError::Code(code) => *code,
        }
    }

    /// Whether this error means "not supported"
    pub fn is_unsupported(&self) -> bool {
        self.to_nbd_error() == NbdError::NotSup
    }
}

/// NBD error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdError {
    /// Success
    Ok = 0,
    /// Operation not permitted
    Perm = 1,
    /// I/O error
    Io = 5,
    /// Out of memory
    NoMem = 12,
    /// Device not found
    NoSuchDevice = 19,
    /// Invalid argument
    Inval = 22,
    /// No space left on device
    NoSpc = 28,
    /// Read-only filesystem
    Rofs = 30,
    /// Value too large
    Overflow = 75,
    /// Function not implemented
    NotSup = 95,
    /// Shutdown in progress
    Shutdown = 108,
}

impl NbdError {
    /// Get the error code
    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Check if this is a success
    pub fn is_ok(&self) -> bool {
        matches!(self, NbdError::Ok)
    }

    /// Create from errno
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            0 => Self::Ok,
            1 => Self::Perm,
            5 => Self::Io,
            12 => Self::NoMem,
            19 => Self::NoSuchDevice,
            22 => Self::Inval,
            28 => Self::NoSpc,
            30 => Self::Rofs,
            75 => Self::Overflow,
            95 => Self::NotSup,
            108 => Self::Shutdown,
            _ => Self::Io,
        }
    }
}

impl std::fmt::Display for NbdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NbdError::Ok => write!(f, "Success"),
            NbdError::Perm => write!(f, "Operation not permitted"),
            NbdError::Io => write!(f, "I/O error"),
            NbdError::NoMem => write!(f, "Out of memory"),
            NbdError::NoSuchDevice => write!(f, "No such device"),
            NbdError::Inval => write!(f, "Invalid argument"),
            NbdError::NoSpc => write!(f, "No space left"),
            NbdError::Rofs => write!(f, "Read-only"),
            NbdError::Overflow => write!(f, "Value too large"),
            NbdError::NotSup => write!(f, "Not supported"),
            NbdError::Shutdown => write!(f, "Shutdown"),
        }
    }
}
