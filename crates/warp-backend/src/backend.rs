//! Backend implementation contract
//!
//! A backend is either the plugin (the data source, innermost in the
//! chain) or a filter stacked in front of it. Both implement [`Backend`]
//! for the process-wide part and hand out one [`BackendHandle`] per
//! connection from [`Backend::open`].
//!
//! Every callback receives `next`, the dispatcher bound to the next
//! inward layer. The provided method bodies forward to it, so a filter
//! only overrides what it transforms. For the plugin, `next` is the empty
//! layer past the end of the chain, which supports nothing: a plugin that
//! does not override `can_write` is read-only, one that does not override
//! `pread` fails every read with `Unsupported`.

use std::fmt;

use crate::dispatch::Layer;
use crate::error::{BackendError, BackendResult};
use crate::extent::Extents;
use crate::flags::RequestFlags;

/// Degree of support for an optional operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Support {
    /// Not supported
    None,
    /// Supported by the dispatcher on top of other operations
    Emulate,
    /// Supported natively by the backend
    Native,
}

impl Support {
    /// Check for any support, native or emulated
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for Support {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Emulate => write!(f, "emulate"),
            Self::Native => write!(f, "native"),
        }
    }
}

/// One entry of an export listing
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Export {
    /// Export name; empty means "the default export"
    pub name: String,
    /// Optional human-readable description
    pub description: Option<String>,
}

impl Export {
    /// Create an export entry without a description
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Check if this entry names the default export
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }
}

/// Process-wide part of a plugin or filter
pub trait Backend: Send + Sync {
    /// Stable name: ASCII alphanumerics and `-`, starting alphanumeric
    fn name(&self) -> &str;

    /// Called once when the chain is built
    fn load(&self) {}

    /// Called once when the chain is unloaded
    fn unload(&self) {}

    /// List the exports this backend serves
    fn list_exports(
        &self,
        next: &mut Layer<'_>,
        readonly: bool,
        is_tls: bool,
    ) -> BackendResult<Vec<Export>> {
        let _ = is_tls;
        next.list_exports(readonly)
    }

    /// Canonical name of the default export, `None` to forbid it
    fn default_export(&self, next: &mut Layer<'_>, readonly: bool, is_tls: bool) -> Option<String> {
        let _ = is_tls;
        next.default_export(readonly)
    }

    /// Open a per-connection handle
    ///
    /// A filter normally opens `next` first with `next.open(..)`.
    fn open(
        &self,
        next: &mut Layer<'_>,
        readonly: bool,
        exportname: &str,
        is_tls: bool,
    ) -> BackendResult<Box<dyn BackendHandle>>;
}

/// Per-connection part of a plugin or filter
#[allow(unused_variables)]
pub trait BackendHandle: Send {
    /// Called once the whole chain is open, plugin first
    fn prepare(&mut self, next: &mut Layer<'_>, readonly: bool) -> BackendResult<()> {
        Ok(())
    }

    /// Called before close, outermost first
    fn finalize(&mut self, next: &mut Layer<'_>) -> BackendResult<()> {
        Ok(())
    }

    /// Release the handle's resources
    fn close(&mut self) {}

    /// Human-readable export description
    fn export_description(&mut self, next: &mut Layer<'_>) -> Option<String> {
        next.export_description()
    }

    /// Export size in bytes
    fn get_size(&mut self, next: &mut Layer<'_>) -> BackendResult<u64> {
        next.get_size()
    }

    /// Whether writes are allowed
    fn can_write(&mut self, next: &mut Layer<'_>) -> BackendResult<bool> {
        next.can_write()
    }

    /// Whether flush is supported
    fn can_flush(&mut self, next: &mut Layer<'_>) -> BackendResult<bool> {
        next.can_flush()
    }

    /// Whether the underlying media is rotational
    fn is_rotational(&mut self, next: &mut Layer<'_>) -> BackendResult<bool> {
        next.is_rotational()
    }

    /// Whether trim is supported
    fn can_trim(&mut self, next: &mut Layer<'_>) -> BackendResult<bool> {
        next.can_trim()
    }

    /// Degree of write-zeroes support
    fn can_zero(&mut self, next: &mut Layer<'_>) -> BackendResult<Support> {
        next.can_zero()
    }

    /// Whether zeroing can be guaranteed fast
    fn can_fast_zero(&mut self, next: &mut Layer<'_>) -> BackendResult<bool> {
        next.can_fast_zero()
    }

    /// Degree of FUA support
    fn can_fua(&mut self, next: &mut Layer<'_>) -> BackendResult<Support> {
        next.can_fua()
    }

    /// Whether several connections see a consistent view
    fn can_multi_conn(&mut self, next: &mut Layer<'_>) -> BackendResult<bool> {
        next.can_multi_conn()
    }

    /// Whether allocation status can be reported
    fn can_extents(&mut self, next: &mut Layer<'_>) -> BackendResult<bool> {
        next.can_extents()
    }

    /// Degree of cache (prefetch) support
    fn can_cache(&mut self, next: &mut Layer<'_>) -> BackendResult<Support> {
        next.can_cache()
    }

    /// Read `buf.len()` bytes at `offset`
    fn pread(
        &mut self,
        next: &mut Layer<'_>,
        buf: &mut [u8],
        offset: u64,
        flags: RequestFlags,
    ) -> BackendResult<()> {
        next.pread(buf, offset, flags)
    }

    /// Write `buf` at `offset`
    fn pwrite(
        &mut self,
        next: &mut Layer<'_>,
        buf: &[u8],
        offset: u64,
        flags: RequestFlags,
    ) -> BackendResult<()> {
        next.pwrite(buf, offset, flags)
    }

    /// Make previous writes durable
    fn flush(&mut self, next: &mut Layer<'_>, flags: RequestFlags) -> BackendResult<()> {
        next.flush(flags)
    }

    /// Discard a range
    fn trim(
        &mut self,
        next: &mut Layer<'_>,
        count: u32,
        offset: u64,
        flags: RequestFlags,
    ) -> BackendResult<()> {
        next.trim(count, offset, flags)
    }

    /// Make a range read as zeroes
    fn zero(
        &mut self,
        next: &mut Layer<'_>,
        count: u32,
        offset: u64,
        flags: RequestFlags,
    ) -> BackendResult<()> {
        next.zero(count, offset, flags)
    }

    /// Report allocation status of a range into `extents`
    fn extents(
        &mut self,
        next: &mut Layer<'_>,
        count: u32,
        offset: u64,
        flags: RequestFlags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        next.extents(count, offset, flags, extents)
    }

    /// Prefetch a range
    fn cache(
        &mut self,
        next: &mut Layer<'_>,
        count: u32,
        offset: u64,
        flags: RequestFlags,
    ) -> BackendResult<()> {
        next.cache(count, offset, flags)
    }
}

/// Validate a backend name
pub fn validate_name(name: &str) -> BackendResult<()> {
    let invalid = |reason: &'static str| BackendError::InvalidName {
        name: name.to_string(),
        reason,
    };

    let mut chars = name.chars();
    match chars.next() {
        None => return Err(invalid("name must not be empty")),
        Some(c) if !c.is_ascii_alphanumeric() => {
            return Err(invalid("name must begin with an ASCII alphanumeric character"))
        }
        Some(_) => {}
    }
    if chars.any(|c| !c.is_ascii_alphanumeric() && c != '-') {
        return Err(invalid(
            "name must contain only ASCII alphanumeric or dash characters",
        ));
    }
    Ok(())
}
