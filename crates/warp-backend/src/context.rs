//! Per-connection, per-layer state
//!
//! A [`Context`] exists from a successful open until close. It owns the
//! backend's handle, the lifecycle state and the lazily filled caches of
//! export size and capabilities.

use std::fmt;

use crate::backend::{BackendHandle, Support};

/// Lifecycle state of an open context
///
/// Unopened and closed contexts have no `Context` at all; the slot in the
/// connection is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Handle open, chain not yet prepared
    Open,
    /// Prepared; data operations allowed
    Connected,
    /// Finalize failed; nothing further is allowed but close
    Failed,
}

/// Events that move a context between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `prepare` succeeded
    Prepared,
    /// `finalize` failed
    FinalizeFailed,
}

impl ContextState {
    /// Transition table. `None` means the event is not allowed in this
    /// state.
    pub const fn apply(self, event: Transition) -> Option<Self> {
        match (self, event) {
            (Self::Open, Transition::Prepared) => Some(Self::Connected),
            (Self::Connected, Transition::FinalizeFailed) => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if data operations are allowed
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if finalize failed
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Connected => write!(f, "connected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Cached capability answers; `None` until first queried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Writes allowed
    pub can_write: Option<bool>,
    /// Flush supported
    pub can_flush: Option<bool>,
    /// Rotational media
    pub is_rotational: Option<bool>,
    /// Trim supported
    pub can_trim: Option<bool>,
    /// Write-zeroes support
    pub can_zero: Option<Support>,
    /// Fast zero supported
    pub can_fast_zero: Option<bool>,
    /// FUA support
    pub can_fua: Option<Support>,
    /// Multi-conn consistent
    pub can_multi_conn: Option<bool>,
    /// Extents reported
    pub can_extents: Option<bool>,
    /// Cache support
    pub can_cache: Option<Support>,
}

/// Runtime state of one layer for one connection
pub struct Context {
    pub(crate) handle: Box<dyn BackendHandle>,
    pub(crate) state: ContextState,
    pub(crate) readonly: bool,
    pub(crate) exportname: String,
    pub(crate) exportsize: Option<u64>,
    pub(crate) caps: Capabilities,
}

impl Context {
    pub(crate) fn new(handle: Box<dyn BackendHandle>, readonly: bool, exportname: String) -> Self {
        Self {
            handle,
            state: ContextState::Open,
            readonly,
            exportname,
            exportsize: None,
            caps: Capabilities {
                can_write: readonly.then_some(false),
                ..Capabilities::default()
            },
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Export name the handle was opened with, after default resolution
    pub fn export_name(&self) -> &str {
        &self.exportname
    }

    /// Cached export size, if queried
    pub fn export_size(&self) -> Option<u64> {
        self.exportsize
    }

    /// Cached capabilities
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Whether the context was opened read-only
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("state", &self.state)
            .field("readonly", &self.readonly)
            .field("exportname", &self.exportname)
            .field("exportsize", &self.exportsize)
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}
