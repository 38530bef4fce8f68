//! Backend chain dispatcher
//!
//! A [`Connection`] owns one slot per chain layer. All lifecycle and data
//! operations run on a [`Layer`]: a view of one slot plus every slot
//! inward of it. The transport drives the outermost layer from
//! [`Connection::top`]; a filter's callbacks receive the layer bound to
//! the next backend inward, so filters and the transport share one code
//! path and one set of checks.
//!
//! Ordering:
//! - open: each filter opens its inner layer from inside its own open, so
//!   handles come up plugin first.
//! - prepare: plugin first.
//! - finalize and close: outermost first.

use std::sync::Arc;

use tracing::warn;

use crate::backend::{BackendHandle, Export, Support};
use crate::chain::{BackendEntry, Chain};
use crate::context::{Capabilities, Context, ContextState, Transition};
use crate::error::{BackendError, BackendResult};
use crate::extent::{ExtentType, Extents};
use crate::flags::{RequestFlags, TransmissionFlags};

/// Per-connection state of one chain position
#[derive(Debug, Default)]
pub(crate) struct Slot {
    context: Option<Context>,
    default_export: Option<String>,
}

/// One client session's view of the chain
#[derive(Debug)]
pub struct Connection {
    chain: Arc<Chain>,
    slots: Vec<Slot>,
    using_tls: bool,
}

impl Connection {
    /// Create a connection with every layer unopened
    pub fn new(chain: Arc<Chain>) -> Self {
        let slots = (0..chain.len()).map(|_| Slot::default()).collect();
        Self {
            chain,
            slots,
            using_tls: false,
        }
    }

    /// The chain this connection dispatches to
    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    /// Whether the session negotiated TLS
    pub fn using_tls(&self) -> bool {
        self.using_tls
    }

    /// Record that the session switched to TLS
    pub fn set_using_tls(&mut self, using_tls: bool) {
        self.using_tls = using_tls;
    }

    /// The outermost layer
    pub fn top(&mut self) -> Layer<'_> {
        Layer {
            chain: &self.chain,
            index: 0,
            slots: &mut self.slots,
            using_tls: self.using_tls,
        }
    }

    /// The layer at chain position `index`
    pub fn layer(&mut self, index: usize) -> Option<Layer<'_>> {
        let slots = self.slots.get_mut(index..)?;
        Some(Layer {
            chain: &self.chain,
            index,
            slots,
            using_tls: self.using_tls,
        })
    }

    /// State of the context at `index`, `None` if unopened
    pub fn state(&self, index: usize) -> Option<ContextState> {
        self.context(index).map(Context::state)
    }

    /// Context at `index`, if open
    pub fn context(&self, index: usize) -> Option<&Context> {
        self.slots.get(index)?.context.as_ref()
    }

    /// Finalize and close the chain if it is open
    ///
    /// Close runs even when finalize fails; the finalize error is
    /// returned.
    pub fn shutdown(&mut self) -> BackendResult<()> {
        let mut top = self.top();
        if !top.is_open() {
            return Ok(());
        }
        let finalized = top.finalize();
        top.close()?;
        finalized
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("connection shutdown: {}", e);
        }
    }
}

/// Summary of an export, gathered once after the chain is prepared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    /// Canonical export name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Transmission flags to advertise
    pub flags: TransmissionFlags,
    /// Optional description
    pub description: Option<String>,
}

/// Dispatcher bound to one chain position and everything inward of it
///
/// A layer past the plugin is empty: capability queries answer
/// "unsupported", default export is `""`, and everything else fails with
/// [`BackendError::Unsupported`].
pub struct Layer<'a> {
    chain: &'a Chain,
    index: usize,
    slots: &'a mut [Slot],
    using_tls: bool,
}

macro_rules! cached_capability {
    ($self:ident, $field:ident, $op:literal, $query:expr) => {{
        if let Some(value) = $self.require($op)?.caps.$field {
            return Ok(value);
        }
        controlpath_debug!($self.chain, "{}: {}", $self.name(), $op);
        let value = $self.with_handle($op, $query)?;
        $self.require($op)?.caps.$field = Some(value);
        Ok(value)
    }};
}

impl<'a> Layer<'a> {
    /// Chain position of this layer
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether this is the empty layer past the plugin
    pub fn is_end(&self) -> bool {
        self.slots.is_empty()
    }

    /// Name of this layer's backend
    pub fn name(&self) -> &'a str {
        self.chain.name(self.index).unwrap_or("<end>")
    }

    /// The chain
    pub fn chain(&self) -> &'a Chain {
        self.chain
    }

    /// Whether the session negotiated TLS
    pub fn using_tls(&self) -> bool {
        self.using_tls
    }

    /// This layer's context, if open
    pub fn context(&self) -> Option<&Context> {
        self.slots.first()?.context.as_ref()
    }

    /// State of this layer's context, `None` if unopened
    pub fn state(&self) -> Option<ContextState> {
        self.context().map(Context::state)
    }

    /// Whether this layer has an open context
    pub fn is_open(&self) -> bool {
        self.context().is_some()
    }

    /// The layer bound to the next backend inward, if any
    pub fn inner(&mut self) -> Option<Layer<'_>> {
        if !self.chain.has_inner(self.index) {
            return None;
        }
        self.split().map(|(_, next)| next)
    }

    fn entry(&self) -> Option<&'a BackendEntry> {
        self.chain.entry(self.index)
    }

    fn split(&mut self) -> Option<(&mut Slot, Layer<'_>)> {
        let (head, rest) = self.slots.split_first_mut()?;
        let next = Layer {
            chain: self.chain,
            index: self.index + 1,
            slots: rest,
            using_tls: self.using_tls,
        };
        Some((head, next))
    }

    fn beyond_plugin(operation: &str) -> BackendError {
        BackendError::Unsupported(format!("{operation}: no backend inward of the plugin"))
    }

    fn state_error(&self, operation: &'static str) -> BackendError {
        BackendError::InvalidState {
            backend: self.name().to_string(),
            operation,
            state: self
                .state()
                .map_or_else(|| "unopened".to_string(), |s| s.to_string()),
        }
    }

    /// Connected context of this layer
    fn require(&mut self, operation: &'static str) -> BackendResult<&mut Context> {
        if self.is_end() {
            return Err(Self::beyond_plugin(operation));
        }
        if !self.state().is_some_and(|s| s.is_connected()) {
            return Err(self.state_error(operation));
        }
        match self.slots.first_mut().and_then(|s| s.context.as_mut()) {
            Some(ctx) => Ok(ctx),
            None => Err(BackendError::Unsupported(operation.to_string())),
        }
    }

    fn context_mut(&mut self) -> Option<&mut Context> {
        self.slots.first_mut()?.context.as_mut()
    }

    /// Run `f` against this layer's handle with the unload guard held
    fn with_handle<T>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut dyn BackendHandle, &mut Layer<'_>) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let chain = self.chain;
        let index = self.index;
        let unopened = || BackendError::InvalidState {
            backend: chain.name(index).unwrap_or("<end>").to_string(),
            operation,
            state: "unopened".to_string(),
        };

        let _guard = chain.callback_guard()?;
        let Some((head, mut next)) = self.split() else {
            return Err(unopened());
        };
        match head.context.as_mut() {
            Some(ctx) => f(ctx.handle.as_mut(), &mut next),
            None => Err(unopened()),
        }
    }

    // ----- lifecycle -------------------------------------------------

    /// Open this layer's context
    ///
    /// An empty `exportname` is resolved to the backend's default export.
    /// If the backend fails after opening its inner layer, the inner
    /// layers are closed again.
    pub fn open(&mut self, readonly: bool, exportname: &str) -> BackendResult<()> {
        let Some(entry) = self.entry() else {
            return Err(Self::beyond_plugin("open"));
        };
        let chain = self.chain;
        let using_tls = self.using_tls;
        controlpath_debug!(
            chain,
            "{}: open readonly={} exportname=\"{}\" tls={}",
            entry.name(),
            readonly,
            exportname,
            using_tls
        );

        if self.is_open() {
            return Err(self.state_error("open"));
        }

        if chain.is_unloaded() {
            return Err(BackendError::Unloaded);
        }

        let exportname = if exportname.is_empty() {
            self.default_export(readonly)
                .ok_or(BackendError::NoDefaultExport)?
        } else {
            exportname.to_string()
        };

        let opened = {
            let _guard = chain.callback_guard()?;
            let Some((_, mut next)) = self.split() else {
                return Err(Self::beyond_plugin("open"));
            };
            entry
                .backend()
                .open(&mut next, readonly, &exportname, using_tls)
        };

        match opened {
            Ok(handle) => {
                controlpath_debug!(chain, "{}: open succeeded", entry.name());
                if let Some(slot) = self.slots.first_mut() {
                    slot.context = Some(Context::new(handle, readonly, exportname));
                }
                Ok(())
            }
            Err(e) => {
                controlpath_debug!(chain, "{}: open failed: {}", entry.name(), e);
                if let Some(mut next) = self.inner() {
                    if next.is_open() {
                        if let Err(close_err) = next.close() {
                            warn!("{}: closing inner layer failed: {}", next.name(), close_err);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Prepare this layer and everything inward, plugin first
    pub fn prepare(&mut self) -> BackendResult<()> {
        if self.state() != Some(ContextState::Open) {
            return Err(self.state_error("prepare"));
        }

        if let Some(mut next) = self.inner() {
            if next.state() == Some(ContextState::Open) {
                next.prepare()?;
            }
        }

        let readonly = self.context().is_some_and(Context::is_readonly);
        controlpath_debug!(self.chain, "{}: prepare readonly={}", self.name(), readonly);
        self.with_handle("prepare", |h, next| h.prepare(next, readonly))?;

        let Some(prepared) = self.state().and_then(|s| s.apply(Transition::Prepared)) else {
            return Err(self.state_error("prepare"));
        };
        if let Some(ctx) = self.context_mut() {
            ctx.state = prepared;
        }
        Ok(())
    }

    /// Finalize this layer, then everything inward
    ///
    /// A failure marks the context failed; every later finalize on it
    /// fails without calling the backend.
    pub fn finalize(&mut self) -> BackendResult<()> {
        match self.state() {
            None | Some(ContextState::Failed) => return Err(self.state_error("finalize")),
            Some(ContextState::Connected) => {
                controlpath_debug!(self.chain, "{}: finalize", self.name());
                if let Err(e) = self.with_handle("finalize", |h, next| h.finalize(next)) {
                    if let Some(ctx) = self.context_mut() {
                        if let Some(failed) = ctx.state.apply(Transition::FinalizeFailed) {
                            ctx.state = failed;
                        }
                    }
                    return Err(e);
                }
            }
            Some(ContextState::Open) => {}
        }

        match self.inner() {
            Some(mut next) if next.is_open() => next.finalize(),
            _ => Ok(()),
        }
    }

    /// Close this layer, then everything inward
    pub fn close(&mut self) -> BackendResult<()> {
        if !self.is_open() {
            return Err(self.state_error("close"));
        }
        let chain = self.chain;
        controlpath_debug!(chain, "{}: close", self.name());

        if let Some(mut ctx) = self.slots.first_mut().and_then(|s| s.context.take()) {
            match chain.callback_guard() {
                Ok(_guard) => ctx.handle.close(),
                Err(_) => warn!("{}: chain unloaded, dropping handle", self.name()),
            }
        }

        match self.inner() {
            Some(mut next) if next.is_open() => next.close(),
            _ => Ok(()),
        }
    }

    /// Replace this layer's context with a freshly opened and prepared one
    ///
    /// On failure the slot is left empty, so the next attempt starts from
    /// scratch.
    pub fn reopen(&mut self, readonly: bool, exportname: &str) -> BackendResult<()> {
        controlpath_debug!(
            self.chain,
            "{}: reopen readonly={} exportname=\"{}\"",
            self.name(),
            readonly,
            exportname
        );

        if self.is_open() {
            self.finalize()?;
            self.close()?;
        }

        self.open(readonly, exportname)?;
        if let Err(e) = self.prepare() {
            if let Err(finalize_err) = self.finalize() {
                warn!("{}: finalize after failed reopen: {}", self.name(), finalize_err);
            }
            if let Err(close_err) = self.close() {
                warn!("{}: close after failed reopen: {}", self.name(), close_err);
            }
            return Err(e);
        }
        Ok(())
    }

    // ----- exports -----------------------------------------------------

    /// Exports served by this layer, default entries resolved
    pub fn list_exports(&mut self, readonly: bool) -> BackendResult<Vec<Export>> {
        let Some(entry) = self.entry() else {
            return Ok(vec![Export::default()]);
        };
        if self.is_open() {
            return Err(self.state_error("list_exports"));
        }
        let chain = self.chain;
        let using_tls = self.using_tls;
        controlpath_debug!(
            chain,
            "{}: list_exports readonly={} tls={}",
            entry.name(),
            readonly,
            using_tls
        );

        let exports = {
            let _guard = chain.callback_guard()?;
            let Some((_, mut next)) = self.split() else {
                return Err(Self::beyond_plugin("list_exports"));
            };
            entry.backend().list_exports(&mut next, readonly, using_tls)?
        };

        let mut resolved = Vec::with_capacity(exports.len());
        for export in exports {
            if !export.is_default() {
                resolved.push(export);
            } else if let Some(name) = self.default_export(readonly) {
                resolved.push(Export { name, ..export });
            }
        }
        controlpath_debug!(
            chain,
            "{}: list_exports returned {} names",
            entry.name(),
            resolved.len()
        );
        Ok(resolved)
    }

    /// Canonical name of the default export, cached per connection
    ///
    /// `None` means the backend forbids the default export. Names longer
    /// than the configured limit are ignored.
    pub fn default_export(&mut self, readonly: bool) -> Option<String> {
        let Some(entry) = self.entry() else {
            return Some(String::new());
        };
        if let Some(name) = self.slots.first().and_then(|s| s.default_export.clone()) {
            return Some(name);
        }
        let chain = self.chain;
        let using_tls = self.using_tls;
        controlpath_debug!(
            chain,
            "{}: default_export readonly={} tls={}",
            entry.name(),
            readonly,
            using_tls
        );

        let _guard = chain.callback_guard().ok()?;
        let (head, mut next) = self.split()?;
        let name = entry.backend().default_export(&mut next, readonly, using_tls)?;
        if name.len() > chain.config().max_string_len {
            controlpath_debug!(chain, "{}: default_export: ignoring invalid string", entry.name());
            return None;
        }
        head.default_export = Some(name.clone());
        Some(name)
    }

    /// Description of the export; never cached
    pub fn export_description(&mut self) -> Option<String> {
        if self.is_end() || !self.state().is_some_and(|s| s.is_connected()) {
            return None;
        }
        controlpath_debug!(self.chain, "{}: export_description", self.name());
        let description = self
            .with_handle("export_description", |h, next| Ok(h.export_description(next)))
            .ok()
            .flatten()?;
        if description.len() > self.chain.config().max_string_len {
            controlpath_debug!(
                self.chain,
                "{}: export_description: ignoring invalid string",
                self.name()
            );
            return None;
        }
        Some(description)
    }

    // ----- capabilities ------------------------------------------------

    /// Export size in bytes, cached after the first query
    pub fn get_size(&mut self) -> BackendResult<u64> {
        if let Some(size) = self.require("get_size")?.exportsize {
            return Ok(size);
        }
        controlpath_debug!(self.chain, "{}: get_size", self.name());
        let size = self.with_handle("get_size", |h, next| h.get_size(next))?;
        if size > i64::MAX as u64 {
            return Err(BackendError::Range(format!(
                "{}: export size {} too large",
                self.name(),
                size
            )));
        }
        self.require("get_size")?.exportsize = Some(size);
        Ok(size)
    }

    /// Whether writes are allowed
    pub fn can_write(&mut self) -> BackendResult<bool> {
        if self.is_end() {
            return Ok(false);
        }
        cached_capability!(self, can_write, "can_write", |h, next| h.can_write(next))
    }

    /// Whether flush is supported
    pub fn can_flush(&mut self) -> BackendResult<bool> {
        if self.is_end() {
            return Ok(false);
        }
        cached_capability!(self, can_flush, "can_flush", |h, next| h.can_flush(next))
    }

    /// Whether the media is rotational
    pub fn is_rotational(&mut self) -> BackendResult<bool> {
        if self.is_end() {
            return Ok(false);
        }
        cached_capability!(self, is_rotational, "is_rotational", |h, next| h
            .is_rotational(next))
    }

    /// Whether trim is supported; false without asking if not writable
    pub fn can_trim(&mut self) -> BackendResult<bool> {
        if self.is_end() {
            return Ok(false);
        }
        if !self.can_write()? {
            self.require("can_trim")?.caps.can_trim.get_or_insert(false);
            return Ok(false);
        }
        cached_capability!(self, can_trim, "can_trim", |h, next| h.can_trim(next))
    }

    /// Degree of zero support; none without asking if not writable
    pub fn can_zero(&mut self) -> BackendResult<Support> {
        if self.is_end() {
            return Ok(Support::None);
        }
        if !self.can_write()? {
            self.require("can_zero")?.caps.can_zero.get_or_insert(Support::None);
            return Ok(Support::None);
        }
        cached_capability!(self, can_zero, "can_zero", |h, next| h.can_zero(next))
    }

    /// Whether fast zero is supported; false without asking if zero is
    /// not supported at all
    pub fn can_fast_zero(&mut self) -> BackendResult<bool> {
        if self.is_end() {
            return Ok(false);
        }
        if !self.can_zero()?.is_supported() {
            self.require("can_fast_zero")?.caps.can_fast_zero.get_or_insert(false);
            return Ok(false);
        }
        cached_capability!(self, can_fast_zero, "can_fast_zero", |h, next| h
            .can_fast_zero(next))
    }

    /// Degree of FUA support; none without asking if not writable
    pub fn can_fua(&mut self) -> BackendResult<Support> {
        if self.is_end() {
            return Ok(Support::None);
        }
        if !self.can_write()? {
            self.require("can_fua")?.caps.can_fua.get_or_insert(Support::None);
            return Ok(Support::None);
        }
        cached_capability!(self, can_fua, "can_fua", |h, next| h.can_fua(next))
    }

    /// Whether multiple connections see a consistent view
    pub fn can_multi_conn(&mut self) -> BackendResult<bool> {
        if self.is_end() {
            return Ok(false);
        }
        cached_capability!(self, can_multi_conn, "can_multi_conn", |h, next| h
            .can_multi_conn(next))
    }

    /// Whether allocation status is reported
    pub fn can_extents(&mut self) -> BackendResult<bool> {
        if self.is_end() {
            return Ok(false);
        }
        cached_capability!(self, can_extents, "can_extents", |h, next| h
            .can_extents(next))
    }

    /// Degree of cache support
    pub fn can_cache(&mut self) -> BackendResult<Support> {
        if self.is_end() {
            return Ok(Support::None);
        }
        cached_capability!(self, can_cache, "can_cache", |h, next| h.can_cache(next))
    }

    /// Query size and every capability once and summarize the export
    pub fn negotiate(&mut self) -> BackendResult<ExportInfo> {
        let size = self.get_size()?;
        let can_write = self.can_write()?;

        let mut flags = TransmissionFlags::default();
        flags.set_if(TransmissionFlags::READ_ONLY, !can_write);
        flags.set_if(TransmissionFlags::SEND_FLUSH, self.can_flush()?);
        flags.set_if(TransmissionFlags::SEND_FUA, self.can_fua()?.is_supported());
        flags.set_if(TransmissionFlags::ROTATIONAL, self.is_rotational()?);
        flags.set_if(TransmissionFlags::SEND_TRIM, self.can_trim()?);
        flags.set_if(
            TransmissionFlags::SEND_WRITE_ZEROES,
            self.can_zero()?.is_supported(),
        );
        flags.set_if(TransmissionFlags::SEND_FAST_ZERO, self.can_fast_zero()?);
        flags.set_if(TransmissionFlags::CAN_MULTI_CONN, self.can_multi_conn()?);
        flags.set_if(TransmissionFlags::SEND_CACHE, self.can_cache()?.is_supported());
        // Extents need no flag but must be known before block status
        self.can_extents()?;

        let name = self
            .context()
            .map(|ctx| ctx.export_name().to_string())
            .unwrap_or_default();
        Ok(ExportInfo {
            name,
            size,
            flags,
            description: self.export_description(),
        })
    }

    // ----- data path ---------------------------------------------------

    fn check_flags(
        &self,
        operation: &'static str,
        flags: RequestFlags,
        allowed: RequestFlags,
    ) -> BackendResult<()> {
        if flags.is_subset_of(allowed) {
            Ok(())
        } else {
            Err(BackendError::InvalidFlags {
                operation,
                flags: flags.bits(),
            })
        }
    }

    fn not_negotiated(&self, capability: &'static str) -> BackendError {
        BackendError::NotNegotiated {
            backend: self.name().to_string(),
            capability,
        }
    }

    /// Cached capabilities; data operations never query the backend
    fn negotiated(&mut self, operation: &'static str) -> BackendResult<Capabilities> {
        Ok(self.require(operation)?.caps)
    }

    fn require_write(
        &mut self,
        operation: &'static str,
        flags: RequestFlags,
    ) -> BackendResult<Capabilities> {
        let caps = self.negotiated(operation)?;
        if caps.can_write != Some(true) {
            return Err(self.not_negotiated("can_write"));
        }
        if flags.has_fua() && !caps.can_fua.is_some_and(|s| s.is_supported()) {
            return Err(self.not_negotiated("can_fua"));
        }
        Ok(caps)
    }

    /// Whether `[offset, offset + count)` is a non-empty range inside
    /// the export
    pub fn valid_range(&mut self, offset: u64, count: u64) -> BackendResult<bool> {
        let size = self.get_size()?;
        Ok(count > 0 && offset <= size && count <= size - offset)
    }

    fn check_range(&mut self, offset: u64, count: u64) -> BackendResult<()> {
        if self.valid_range(offset, count)? {
            return Ok(());
        }
        let size = self.get_size()?;
        Err(BackendError::InvalidRange {
            offset,
            count,
            size,
        })
    }

    /// Flush on behalf of a request whose FUA is emulated
    fn emulate_fua(&mut self) -> BackendResult<()> {
        datapath_debug!(self.chain, "{}: flush (emulated fua)", self.name());
        self.with_handle("flush", |h, next| h.flush(next, RequestFlags::NONE))
    }

    /// Read into `buf`
    pub fn pread(&mut self, buf: &mut [u8], offset: u64, flags: RequestFlags) -> BackendResult<()> {
        self.check_flags("pread", flags, RequestFlags::NONE)?;
        self.negotiated("pread")?;
        self.check_range(offset, buf.len() as u64)?;
        datapath_debug!(
            self.chain,
            "{}: pread count={} offset={}",
            self.name(),
            buf.len(),
            offset
        );
        self.with_handle("pread", |h, next| h.pread(next, buf, offset, flags))
    }

    /// Write `buf`
    pub fn pwrite(&mut self, buf: &[u8], offset: u64, flags: RequestFlags) -> BackendResult<()> {
        self.check_flags("pwrite", flags, RequestFlags::FUA)?;
        let caps = self.require_write("pwrite", flags)?;
        self.check_range(offset, buf.len() as u64)?;
        datapath_debug!(
            self.chain,
            "{}: pwrite count={} offset={} fua={}",
            self.name(),
            buf.len(),
            offset,
            flags.has_fua()
        );

        if flags.has_fua() && caps.can_fua == Some(Support::Emulate) {
            let flags = flags.without(RequestFlags::FUA);
            self.with_handle("pwrite", |h, next| h.pwrite(next, buf, offset, flags))?;
            return self.emulate_fua();
        }
        self.with_handle("pwrite", |h, next| h.pwrite(next, buf, offset, flags))
    }

    /// Flush previous writes
    pub fn flush(&mut self, flags: RequestFlags) -> BackendResult<()> {
        self.check_flags("flush", flags, RequestFlags::NONE)?;
        let caps = self.negotiated("flush")?;
        if caps.can_flush != Some(true) {
            return Err(self.not_negotiated("can_flush"));
        }
        datapath_debug!(self.chain, "{}: flush", self.name());
        self.with_handle("flush", |h, next| h.flush(next, flags))
    }

    /// Discard a range
    pub fn trim(&mut self, count: u32, offset: u64, flags: RequestFlags) -> BackendResult<()> {
        self.check_flags("trim", flags, RequestFlags::FUA)?;
        let caps = self.require_write("trim", flags)?;
        if caps.can_trim != Some(true) {
            return Err(self.not_negotiated("can_trim"));
        }
        self.check_range(offset, u64::from(count))?;
        datapath_debug!(
            self.chain,
            "{}: trim count={} offset={} fua={}",
            self.name(),
            count,
            offset,
            flags.has_fua()
        );

        if flags.has_fua() && caps.can_fua == Some(Support::Emulate) {
            let flags = flags.without(RequestFlags::FUA);
            self.with_handle("trim", |h, next| h.trim(next, count, offset, flags))?;
            return self.emulate_fua();
        }
        self.with_handle("trim", |h, next| h.trim(next, count, offset, flags))
    }

    /// Make a range read as zeroes
    pub fn zero(&mut self, count: u32, offset: u64, flags: RequestFlags) -> BackendResult<()> {
        self.check_flags(
            "zero",
            flags,
            RequestFlags::MAY_TRIM | RequestFlags::FUA | RequestFlags::FAST_ZERO,
        )?;
        let caps = self.require_write("zero", flags)?;
        let zero = caps.can_zero.unwrap_or(Support::None);
        if !zero.is_supported() {
            return Err(self.not_negotiated("can_zero"));
        }
        let fast = flags.has_fast_zero();
        if fast && caps.can_fast_zero != Some(true) {
            return Err(self.not_negotiated("can_fast_zero"));
        }
        self.check_range(offset, u64::from(count))?;
        datapath_debug!(
            self.chain,
            "{}: zero count={} offset={} may_trim={} fua={} fast={}",
            self.name(),
            count,
            offset,
            flags.has_may_trim(),
            flags.has_fua(),
            fast
        );

        let emulate_fua = flags.has_fua() && caps.can_fua == Some(Support::Emulate);
        if zero == Support::Emulate {
            if fast {
                return Err(BackendError::Unsupported(format!(
                    "{}: fast zero with emulated zero",
                    self.name()
                )));
            }
            let write_flags = if emulate_fua {
                RequestFlags::NONE
            } else {
                flags.without(RequestFlags::MAY_TRIM)
            };
            self.emulate_zero(count, offset, write_flags)?;
        } else {
            let flags = if emulate_fua {
                flags.without(RequestFlags::FUA)
            } else {
                flags
            };
            self.with_handle("zero", |h, next| h.zero(next, count, offset, flags))?;
        }

        if emulate_fua {
            self.emulate_fua()?;
        }
        Ok(())
    }

    /// Zero a range by writing zero buffers in bounded chunks
    fn emulate_zero(&mut self, count: u32, offset: u64, flags: RequestFlags) -> BackendResult<()> {
        let chunk = count.min(self.chain.config().max_request_size) as usize;
        let zeroes = vec![0u8; chunk];
        let mut remaining = count as usize;
        let mut offset = offset;

        while remaining > 0 {
            let limit = remaining.min(chunk);
            // FUA, if any, only needs to ride on the last chunk
            let flags = if limit == remaining {
                flags
            } else {
                flags.without(RequestFlags::FUA)
            };
            let buf = &zeroes[..limit];
            self.with_handle("zero", |h, next| h.pwrite(next, buf, offset, flags))?;
            offset += limit as u64;
            remaining -= limit;
        }
        Ok(())
    }

    /// Report allocation status of a range into `extents`
    ///
    /// A backend without extent support reports the whole range as
    /// allocated data.
    pub fn extents(
        &mut self,
        count: u32,
        offset: u64,
        flags: RequestFlags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        self.check_flags("extents", flags, RequestFlags::REQ_ONE)?;
        let caps = self.negotiated("extents")?;
        let Some(can_extents) = caps.can_extents else {
            return Err(self.not_negotiated("can_extents"));
        };
        self.check_range(offset, u64::from(count))?;
        datapath_debug!(
            self.chain,
            "{}: extents count={} offset={} req_one={}",
            self.name(),
            count,
            offset,
            flags.has_req_one()
        );

        if !can_extents {
            return extents.add(offset, u64::from(count), ExtentType::ALLOCATED);
        }
        self.with_handle("extents", |h, next| {
            h.extents(next, count, offset, flags, extents)
        })
    }

    /// Build a ledger for `[offset, offset + count)` and fill it
    pub fn block_status(
        &mut self,
        count: u32,
        offset: u64,
        flags: RequestFlags,
    ) -> BackendResult<Extents> {
        let end = offset
            .checked_add(u64::from(count))
            .ok_or_else(|| BackendError::Range(format!("offset {offset} + count {count} overflows")))?;
        let mut extents = Extents::with_limit(offset, end, self.chain.config().max_extents)?;
        self.extents(count, offset, flags, &mut extents)?;
        Ok(extents)
    }

    /// Prefetch a range
    ///
    /// With emulated cache support the range is read in bounded chunks
    /// into a scratch buffer that is then discarded.
    pub fn cache(&mut self, count: u32, offset: u64, flags: RequestFlags) -> BackendResult<()> {
        self.check_flags("cache", flags, RequestFlags::NONE)?;
        let caps = self.negotiated("cache")?;
        let support = caps.can_cache.unwrap_or(Support::None);
        if !support.is_supported() {
            return Err(self.not_negotiated("can_cache"));
        }
        self.check_range(offset, u64::from(count))?;
        datapath_debug!(
            self.chain,
            "{}: cache count={} offset={}",
            self.name(),
            count,
            offset
        );

        if support == Support::Emulate {
            let chunk = count.min(self.chain.config().max_request_size) as usize;
            let mut scratch = vec![0u8; chunk];
            let mut remaining = count as usize;
            let mut offset = offset;
            while remaining > 0 {
                let limit = remaining.min(chunk);
                self.pread(&mut scratch[..limit], offset, flags)?;
                offset += limit as u64;
                remaining -= limit;
            }
            return Ok(());
        }
        self.with_handle("cache", |h, next| h.cache(next, count, offset, flags))
    }
}

impl std::fmt::Debug for Layer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("index", &self.index)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
