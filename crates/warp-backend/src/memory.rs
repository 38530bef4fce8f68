//! In-memory plugin
//!
//! A sparse RAM disk. Data lives in fixed-size pages allocated on first
//! write; pages never written read as zeroes and are reported as sparse
//! extents. The page map is shared by every connection to the plugin.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::backend::{Backend, BackendHandle, Export, Support};
use crate::dispatch::Layer;
use crate::error::{BackendError, BackendResult};
use crate::extent::{ExtentType, Extents};
use crate::flags::RequestFlags;

/// Allocation unit of the page map
pub const PAGE_SIZE: u64 = 4096;

#[derive(Debug)]
struct Store {
    export: String,
    description: Option<String>,
    size: u64,
    pages: RwLock<BTreeMap<u64, Vec<u8>>>,
}

/// Sparse in-memory plugin serving a single export
#[derive(Debug, Clone)]
pub struct MemoryPlugin {
    store: Arc<Store>,
    readonly: bool,
}

impl MemoryPlugin {
    /// Create an empty disk of `size` bytes with the export name `""`
    pub fn new(size: u64) -> Self {
        Self {
            store: Arc::new(Store {
                export: String::new(),
                description: None,
                size,
                pages: RwLock::new(BTreeMap::new()),
            }),
            readonly: false,
        }
    }

    /// Serve the disk under `name`
    pub fn with_export(self, name: impl Into<String>) -> Self {
        self.rebuild(|store| store.export = name.into())
    }

    /// Attach an export description
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.rebuild(|store| store.description = Some(description.into()))
    }

    /// Refuse writes from every connection
    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    // Builder steps run before the store is shared
    fn rebuild(self, f: impl FnOnce(&mut Store)) -> Self {
        let mut store = Store {
            export: self.store.export.clone(),
            description: self.store.description.clone(),
            size: self.store.size,
            pages: RwLock::new(self.store.pages.read().clone()),
        };
        f(&mut store);
        Self {
            store: Arc::new(store),
            readonly: self.readonly,
        }
    }

    /// Disk size in bytes
    pub fn size(&self) -> u64 {
        self.store.size
    }

    /// Number of pages currently allocated
    pub fn allocated_pages(&self) -> usize {
        self.store.pages.read().len()
    }
}

impl Backend for MemoryPlugin {
    fn name(&self) -> &str {
        "memory"
    }

    fn list_exports(
        &self,
        _next: &mut Layer<'_>,
        _readonly: bool,
        _is_tls: bool,
    ) -> BackendResult<Vec<Export>> {
        let mut export = Export::new(self.store.export.clone());
        export.description = self.store.description.clone();
        Ok(vec![export])
    }

    fn default_export(&self, _next: &mut Layer<'_>, _readonly: bool, _is_tls: bool) -> Option<String> {
        Some(self.store.export.clone())
    }

    fn open(
        &self,
        _next: &mut Layer<'_>,
        readonly: bool,
        exportname: &str,
        _is_tls: bool,
    ) -> BackendResult<Box<dyn BackendHandle>> {
        if exportname != self.store.export {
            return Err(BackendError::NoSuchExport(exportname.to_string()));
        }
        debug!(
            "memory: open export \"{}\" size={} readonly={}",
            exportname, self.store.size, readonly
        );
        Ok(Box::new(MemoryHandle {
            store: self.store.clone(),
            readonly: readonly || self.readonly,
        }))
    }
}

struct MemoryHandle {
    store: Arc<Store>,
    readonly: bool,
}

impl MemoryHandle {
    fn check_writable(&self) -> BackendResult<()> {
        if self.readonly {
            Err(BackendError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Zero a byte range, dropping pages that are wholly covered
    fn punch(&self, count: u32, offset: u64) {
        let mut pages = self.store.pages.write();
        for piece in Pieces::new(offset, count as usize) {
            if piece.len as u64 == PAGE_SIZE {
                pages.remove(&piece.page);
            } else if let Some(data) = pages.get_mut(&piece.page) {
                data[piece.page_off..piece.page_off + piece.len].fill(0);
            }
        }
    }
}

impl BackendHandle for MemoryHandle {
    fn export_description(&mut self, _next: &mut Layer<'_>) -> Option<String> {
        self.store.description.clone()
    }

    fn get_size(&mut self, _next: &mut Layer<'_>) -> BackendResult<u64> {
        Ok(self.store.size)
    }

    fn can_write(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        Ok(!self.readonly)
    }

    fn can_flush(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        Ok(true)
    }

    fn is_rotational(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        Ok(false)
    }

    fn can_trim(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        Ok(true)
    }

    fn can_zero(&mut self, _next: &mut Layer<'_>) -> BackendResult<Support> {
        Ok(Support::Native)
    }

    fn can_fast_zero(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        Ok(true)
    }

    fn can_fua(&mut self, _next: &mut Layer<'_>) -> BackendResult<Support> {
        Ok(Support::Native)
    }

    fn can_multi_conn(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        Ok(true)
    }

    fn can_extents(&mut self, _next: &mut Layer<'_>) -> BackendResult<bool> {
        Ok(true)
    }

    fn can_cache(&mut self, _next: &mut Layer<'_>) -> BackendResult<Support> {
        Ok(Support::Emulate)
    }

    fn pread(
        &mut self,
        _next: &mut Layer<'_>,
        buf: &mut [u8],
        offset: u64,
        _flags: RequestFlags,
    ) -> BackendResult<()> {
        let pages = self.store.pages.read();
        for piece in Pieces::new(offset, buf.len()) {
            let dst = &mut buf[piece.buf_off..piece.buf_off + piece.len];
            match pages.get(&piece.page) {
                Some(data) => dst.copy_from_slice(&data[piece.page_off..piece.page_off + piece.len]),
                None => dst.fill(0),
            }
        }
        Ok(())
    }

    fn pwrite(
        &mut self,
        _next: &mut Layer<'_>,
        buf: &[u8],
        offset: u64,
        _flags: RequestFlags,
    ) -> BackendResult<()> {
        self.check_writable()?;
        let mut pages = self.store.pages.write();
        for piece in Pieces::new(offset, buf.len()) {
            let data = pages
                .entry(piece.page)
                .or_insert_with(|| vec![0; PAGE_SIZE as usize]);
            data[piece.page_off..piece.page_off + piece.len]
                .copy_from_slice(&buf[piece.buf_off..piece.buf_off + piece.len]);
        }
        Ok(())
    }

    fn flush(&mut self, _next: &mut Layer<'_>, _flags: RequestFlags) -> BackendResult<()> {
        Ok(())
    }

    fn trim(
        &mut self,
        _next: &mut Layer<'_>,
        count: u32,
        offset: u64,
        _flags: RequestFlags,
    ) -> BackendResult<()> {
        self.check_writable()?;
        self.punch(count, offset);
        Ok(())
    }

    fn zero(
        &mut self,
        _next: &mut Layer<'_>,
        count: u32,
        offset: u64,
        _flags: RequestFlags,
    ) -> BackendResult<()> {
        self.check_writable()?;
        self.punch(count, offset);
        Ok(())
    }

    fn extents(
        &mut self,
        _next: &mut Layer<'_>,
        count: u32,
        offset: u64,
        _flags: RequestFlags,
        extents: &mut Extents,
    ) -> BackendResult<()> {
        let first = offset / PAGE_SIZE;
        let last = (offset + u64::from(count)).div_ceil(PAGE_SIZE);
        let pages = self.store.pages.read();

        let mut pos = first;
        for &page in pages.range(first..last).map(|(page, _)| page) {
            if page > pos {
                extents.add(pos * PAGE_SIZE, (page - pos) * PAGE_SIZE, ExtentType::SPARSE)?;
            }
            extents.add(page * PAGE_SIZE, PAGE_SIZE, ExtentType::ALLOCATED)?;
            pos = page + 1;
        }
        if pos < last {
            extents.add(pos * PAGE_SIZE, (last - pos) * PAGE_SIZE, ExtentType::SPARSE)?;
        }
        Ok(())
    }
}

/// Part of a request that falls within one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Piece {
    page: u64,
    page_off: usize,
    buf_off: usize,
    len: usize,
}

/// Splits a byte range at page boundaries
struct Pieces {
    offset: u64,
    buf_off: usize,
    remaining: usize,
}

impl Pieces {
    fn new(offset: u64, len: usize) -> Self {
        Self {
            offset,
            buf_off: 0,
            remaining: len,
        }
    }
}

impl Iterator for Pieces {
    type Item = Piece;

    fn next(&mut self) -> Option<Piece> {
        if self.remaining == 0 {
            return None;
        }
        let page_off = (self.offset % PAGE_SIZE) as usize;
        let len = self.remaining.min(PAGE_SIZE as usize - page_off);
        let piece = Piece {
            page: self.offset / PAGE_SIZE,
            page_off,
            buf_off: self.buf_off,
            len,
        };
        self.offset += len as u64;
        self.buf_off += len;
        self.remaining -= len;
        Some(piece)
    }
}
