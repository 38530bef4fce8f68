//! Shared mock backends
//!
//! Every callback is recorded as `"<backend>: <event>"` in a shared
//! [`Events`] log, so tests can assert both ordering and "never called".

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use warp_backend::{
    extents_aligned, Backend, BackendError, BackendHandle, BackendResult, Chain, ChainBuilder,
    Connection, Export, Extent, ExtentType, Extents, Layer, NbdError, RequestFlags, ServerConfig,
    Support,
};

/// Shared callback log
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    /// Drain the log
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Number of events starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Plugin behavior; fields are fixed once the plugin is built except
/// the failure switches
pub struct MockOptions {
    pub size: u64,
    pub can_write: bool,
    pub can_flush: bool,
    pub can_trim: bool,
    pub can_zero: Support,
    pub can_fast_zero: bool,
    pub can_fua: Support,
    pub can_extents: bool,
    pub can_cache: Support,
    pub default_export: Option<String>,
    pub exports: Vec<Export>,
    pub description: Option<String>,
    /// Extent map reported by `extents`; empty means all allocated
    pub extent_map: Vec<Extent>,
    pub fail_pread_at: Option<u64>,
    pub fail_prepare: AtomicBool,
    pub fail_finalize: AtomicBool,
}

impl MockOptions {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            can_write: true,
            can_flush: true,
            can_trim: true,
            can_zero: Support::Native,
            can_fast_zero: true,
            can_fua: Support::Native,
            can_extents: true,
            can_cache: Support::Native,
            default_export: Some(String::new()),
            exports: vec![Export::new("")],
            description: None,
            extent_map: Vec::new(),
            fail_pread_at: None,
            fail_prepare: AtomicBool::new(false),
            fail_finalize: AtomicBool::new(false),
        }
    }

    pub fn build(self, events: &Events) -> Arc<MockPlugin> {
        let data = vec![0u8; self.size as usize];
        Arc::new(MockPlugin {
            opts: Arc::new(self),
            events: events.clone(),
            data: Arc::new(Mutex::new(data)),
        })
    }
}

/// Recording plugin named `mock`
pub struct MockPlugin {
    opts: Arc<MockOptions>,
    events: Events,
    data: Arc<Mutex<Vec<u8>>>,
}

impl MockPlugin {
    pub fn opts(&self) -> &MockOptions {
        &self.opts
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.opts.fail_prepare.store(fail, Ordering::SeqCst);
    }

    pub fn fail_finalize(&self, fail: bool) {
        self.opts.fail_finalize.store(fail, Ordering::SeqCst);
    }

    pub fn data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl Backend for MockPlugin {
    fn name(&self) -> &str {
        "mock"
    }

    fn load(&self) {
        self.events.push("mock: load");
    }

    fn unload(&self) {
        self.events.push("mock: unload");
    }

    fn list_exports(
        &self,
        _next: &mut Layer<'_>,
        _readonly: bool,
        _is_tls: bool,
    ) -> BackendResult<Vec<Export>> {
        self.events.push("mock: list_exports");
        Ok(self.opts.exports.clone())
    }

    fn default_export(&self, _next: &mut Layer<'_>, _readonly: bool, _is_tls: bool) -> Option<String> {
        self.events.push("mock: default_export");
        self.opts.default_export.clone()
    }

    fn open(
        &self,
        _next: &mut Layer<'_>,
        readonly: bool,
        exportname: &str,
        _is_tls: bool,
    ) -> BackendResult<Box<dyn BackendHandle>> {
        self.events
            .push(format!("mock: open {exportname:?} readonly={readonly}"));
        Ok(Box::new(MockHandle {
            opts: self.opts.clone(),
            events: self.events.clone(),
            data: self.data.clone(),
        }))
    }
}

struct MockHandle {
    opts: Arc<MockOptions>,
    events: Events,
    data: Arc<Mutex<Vec<u8>>>,
}

impl MockHandle {
    fn record(&self, event: impl std::fmt::Display) {
        self.events.push(format!("mock: {event}"));
    }
}

impl BackendHandle for MockHandle {
    fn prepare(&mut self, _next: &mut Layer<'_>, _readonly: bool) -> BackendResult<()> {
        self.record("prepare");
        if self.opts.fail_prepare.load(Ordering::SeqCst) {
            return Err(BackendError::Code(NbdError::Io));
        }
        Ok(())
    }

    fn finalize(&mut self, _next: &mut Layer<'_>) -> BackendResult<()> {
        self.record("finalize");
        if self.opts.fail_finalize.load(Ordering::SeqCst) {
            return Err(BackendError::Code(NbdError::Io));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.record("close");
    }

    fn export_description(&mut self, _next: &mut Layer<'_>) -> Option<String> {
        self.record("export_description");
        self.opts.description.clone()
    }

    fn get_size(&mut self, _next: &mut Layer<'_>) -> BackendResult<u64> {
        self.record("get_size");
        Ok(self.opts.size)
    }

    fn can_write(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        self.record("can_write");
        Ok(self.opts.can_write)
    }

    fn can_flush(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        self.record("can_flush");
        Ok(self.opts.can_flush)
    }

    fn is_rotational(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        self.record("is_rotational");
        Ok(false)
    }

    fn can_trim(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        self.record("can_trim");
        Ok(self.opts.can_trim)
    }

    fn can_zero(&mut self, _next: &mut Layer<'_>) -> BackendResult<Support> {
        self.record("can_zero");
        Ok(self.opts.can_zero)
    }

    fn can_fast_zero(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        self.record("can_fast_zero");
        Ok(self.opts.can_fast_zero)
    }

    fn can_fua(&mut self, _next: &mut Layer<'_>) -> BackendResult<Support> {
        self.record("can_fua");
        Ok(self.opts.can_fua)
    }

    fn can_multi_conn(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        self.record("can_multi_conn");
        Ok(false)
    }

    fn can_extents(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        self.record("can_extents");
        Ok(self.opts.can_extents)
    }

    fn can_cache(&mut self, _next: &mut Layer<'_>) -> BackendResult<Support> {
        self.record("can_cache");
        Ok(self.opts.can_cache)
    }

    fn pread(
        &mut self,
        _next: &mut Layer<'_>,
        buf: &mut [u8],
        offset: u64,
        _flags: RequestFlags,
    ) -> BackendResult<()> {
        self.record(format_args!("pread {}@{}", buf.len(), offset));
        if self.opts.fail_pread_at == Some(offset) {
            return Err(BackendError::Code(NbdError::Io));
        }
        let start = offset as usize;
        buf.copy_from_slice(&self.data.lock()[start..start + buf.len()]);
        Ok(())
    }

    fn pwrite(
        &mut self,
        _next: &mut Layer<'_>,
        buf: &[u8],
        offset: u64,
        flags: RequestFlags,
    ) -> BackendResult<()> {
        self.record(format_args!(
            "pwrite {}@{} fua={}",
            buf.len(),
            offset,
            flags.has_fua()
        ));
        let start = offset as usize;
        self.data.lock()[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self, _next: &mut Layer<'_>, _flags: RequestFlags) -> BackendResult<()> {
        self.record("flush");
        Ok(())
    }

    fn trim(
        &mut self,
        _next: &mut Layer<'_>,
        count: u32,
        offset: u64,
        flags: RequestFlags,
    ) -> BackendResult<()> {
        self.record(format_args!("trim {}@{} fua={}", count, offset, flags.has_fua()));
        Ok(())
    }

    fn zero(
        &mut self,
        _next: &mut Layer<'_>,
        count: u32,
        offset: u64,
        flags: RequestFlags,
    ) -> BackendResult<()> {
        self.record(format_args!("zero {}@{} fua={}", count, offset, flags.has_fua()));
        let start = offset as usize;
        self.data.lock()[start..start + count as usize].fill(0);
        Ok(())
    }

    fn extents(
        &mut self,
        _next: &mut Layer<'_>,
        count: u32,
        offset: u64,
        flags: RequestFlags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        self.record(format_args!("extents {}@{}", count, offset));
        if self.opts.extent_map.is_empty() {
            return extents.add(offset, u64::from(count), ExtentType::ALLOCATED);
        }
        let end = offset + u64::from(count);
        for e in self
            .opts
            .extent_map
            .iter()
            .filter(|e| e.end() > offset && e.offset < end)
        {
            extents.add(e.offset, e.length, e.ty)?;
            if flags.has_req_one() {
                break;
            }
        }
        Ok(())
    }

    fn cache(
        &mut self,
        _next: &mut Layer<'_>,
        count: u32,
        offset: u64,
        _flags: RequestFlags,
    ) -> BackendResult<()> {
        self.record(format_args!("cache {}@{}", count, offset));
        Ok(())
    }
}

/// Pass-through filter recording its lifecycle
pub struct TraceFilter {
    name: &'static str,
    events: Events,
    fail_open: bool,
}

impl TraceFilter {
    pub fn new(name: &'static str, events: &Events) -> Arc<Self> {
        Arc::new(Self {
            name,
            events: events.clone(),
            fail_open: false,
        })
    }

    /// A filter whose open fails after its inner layer opened
    pub fn failing(name: &'static str, events: &Events) -> Arc<Self> {
        Arc::new(Self {
            name,
            events: events.clone(),
            fail_open: true,
        })
    }
}

impl Backend for TraceFilter {
    fn name(&self) -> &str {
        self.name
    }

    fn load(&self) {
        self.events.push(format!("{}: load", self.name));
    }

    fn unload(&self) {
        self.events.push(format!("{}: unload", self.name));
    }

    fn open(
        &self,
        next: &mut Layer<'_>,
        readonly: bool,
        exportname: &str,
        _is_tls: bool,
    ) -> BackendResult<Box<dyn BackendHandle>> {
        next.open(readonly, exportname)?;
        if self.fail_open {
            self.events.push(format!("{}: open failed", self.name));
            return Err(BackendError::Code(NbdError::NoMem));
        }
        self.events.push(format!("{}: open", self.name));
        Ok(Box::new(TraceHandle {
            name: self.name,
            events: self.events.clone(),
        }))
    }
}

struct TraceHandle {
    name: &'static str,
    events: Events,
}

impl BackendHandle for TraceHandle {
    fn prepare(&mut self, _next: &mut Layer<'_>, _readonly: bool) -> BackendResult<()> {
        self.events.push(format!("{}: prepare", self.name));
        Ok(())
    }

    fn finalize(&mut self, _next: &mut Layer<'_>) -> BackendResult<()> {
        self.events.push(format!("{}: finalize", self.name));
        Ok(())
    }

    fn close(&mut self) {
        self.events.push(format!("{}: close", self.name));
    }
}

/// Filter exposing `align`-sized blocks to block-status queries
pub struct AlignFilter {
    pub align: u32,
}

impl Backend for AlignFilter {
    fn name(&self) -> &str {
        "align"
    }

    fn open(
        &self,
        next: &mut Layer<'_>,
        readonly: bool,
        exportname: &str,
        _is_tls: bool,
    ) -> BackendResult<Box<dyn BackendHandle>> {
        next.open(readonly, exportname)?;
        Ok(Box::new(AlignHandle { align: self.align }))
    }
}

struct AlignHandle {
    align: u32,
}

impl BackendHandle for AlignHandle {
    fn extents(
        &mut self,
        next: &mut Layer<'_>,
        count: u32,
        offset: u64,
        flags: RequestFlags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        extents_aligned(next, count, offset, flags, self.align, extents)
    }
}

/// Build a chain from a plugin and filters listed innermost first
pub fn chain(
    plugin: Arc<dyn Backend>,
    filters: Vec<Arc<dyn Backend>>,
    config: ServerConfig,
) -> Arc<Chain> {
    let builder = filters
        .into_iter()
        .fold(ChainBuilder::new(plugin), ChainBuilder::filter);
    Arc::new(builder.config(config).build().unwrap())
}

/// Open, prepare and negotiate the whole chain
pub fn connect(chain: &Arc<Chain>, readonly: bool) -> Connection {
    let mut conn = Connection::new(chain.clone());
    let mut top = conn.top();
    top.open(readonly, "").unwrap();
    top.prepare().unwrap();
    top.negotiate().unwrap();
    conn
}
