//! Backend chain
//!
//! The ordered, process-wide list of backends: filters outermost first,
//! the plugin last. Built once at startup, shared read-only by every
//! connection, and unloaded once at shutdown.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::debug;

use crate::backend::{validate_name, Backend};
use crate::config::ServerConfig;
use crate::error::{BackendError, BackendResult};

/// Role of a backend in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Innermost data source
    Plugin,
    /// Transformation layer forwarding to the next backend
    Filter,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plugin => write!(f, "plugin"),
            Self::Filter => write!(f, "filter"),
        }
    }
}

/// A registered backend
pub struct BackendEntry {
    backend: Arc<dyn Backend>,
    name: String,
    kind: BackendKind,
}

impl BackendEntry {
    /// Validated name, kept so it outlives unload
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plugin or filter
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }
}

impl fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEntry")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Builder for a [`Chain`]
pub struct ChainBuilder {
    plugin: Arc<dyn Backend>,
    filters: Vec<Arc<dyn Backend>>,
    config: ServerConfig,
}

impl ChainBuilder {
    /// Start a chain with its plugin
    pub fn new(plugin: Arc<dyn Backend>) -> Self {
        Self {
            plugin,
            filters: Vec::new(),
            config: ServerConfig::default(),
        }
    }

    /// Stack a filter in front of everything added so far
    pub fn filter(mut self, filter: Arc<dyn Backend>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Use this configuration
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate names, then load every backend plugin-first
    pub fn build(self) -> BackendResult<Chain> {
        self.config.validate()?;

        let mut entries = Vec::with_capacity(self.filters.len() + 1);
        for (backend, kind) in std::iter::once((self.plugin, BackendKind::Plugin))
            .chain(self.filters.into_iter().map(|f| (f, BackendKind::Filter)))
        {
            let name = backend.name().to_string();
            validate_name(&name)?;
            debug!("registered {} (name {})", kind, name);
            entries.push(BackendEntry {
                backend,
                name,
                kind,
            });
        }

        let chain = Chain {
            entries,
            config: self.config,
            unload_lock: RwLock::new(()),
            unloaded: AtomicBool::new(false),
        };
        for entry in &chain.entries {
            controlpath_debug!(chain, "{}: load", entry.name);
            entry.backend.load();
        }

        // Stored outermost first from here on
        let mut chain = chain;
        chain.entries.reverse();
        Ok(chain)
    }
}

/// Ordered chain of backends, outermost filter at position 0
pub struct Chain {
    entries: Vec<BackendEntry>,
    config: ServerConfig,
    unload_lock: RwLock<()>,
    unloaded: AtomicBool,
}

impl Chain {
    /// Number of layers, plugin included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false: a chain has at least its plugin
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Backend at chain position `index`
    pub fn entry(&self, index: usize) -> Option<&BackendEntry> {
        self.entries.get(index)
    }

    /// Name of the backend at `index`
    pub fn name(&self, index: usize) -> Option<&str> {
        self.entry(index).map(BackendEntry::name)
    }

    /// The plugin
    pub fn plugin(&self) -> &BackendEntry {
        &self.entries[self.entries.len() - 1]
    }

    /// Position of the next backend towards the plugin
    pub fn inner_of(&self, index: usize) -> Option<usize> {
        match self.entry(index)?.kind {
            BackendKind::Plugin => None,
            BackendKind::Filter => Some(index + 1),
        }
    }

    /// Whether the backend at `index` forwards to another backend
    pub fn has_inner(&self, index: usize) -> bool {
        self.inner_of(index).is_some()
    }

    /// Configuration shared by every layer
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Whether [`Chain::unload`] has run
    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    /// Shared guard held across a backend callback
    ///
    /// Recursive so a filter can call inward while its own callback holds
    /// the guard, even with an unload waiting.
    pub(crate) fn callback_guard(&self) -> BackendResult<RwLockReadGuard<'_, ()>> {
        let guard = self.unload_lock.read_recursive();
        if self.is_unloaded() {
            return Err(BackendError::Unloaded);
        }
        Ok(guard)
    }

    /// Unload every backend, outermost first
    ///
    /// Waits for in-flight callbacks on every connection. Later callbacks
    /// fail with [`BackendError::Unloaded`]. Idempotent.
    pub fn unload(&self) {
        let _guard = self.unload_lock.write();
        if self.unloaded.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in &self.entries {
            controlpath_debug!(self, "{}: unload {}", entry.name, entry.kind);
            entry.backend.unload();
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.unload();
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("entries", &self.entries)
            .field("unloaded", &self.is_unloaded())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendHandle;
    use crate::dispatch::Layer;
    use parking_lot::Mutex;

    struct Named {
        name: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Named {
        fn new(name: &'static str, events: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                events: events.clone(),
            })
        }
    }

    impl Backend for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn load(&self) {
            self.events.lock().push(format!("load {}", self.name));
        }

        fn unload(&self) {
            self.events.lock().push(format!("unload {}", self.name));
        }

        fn open(
            &self,
            _next: &mut Layer<'_>,
            _readonly: bool,
            _exportname: &str,
            _is_tls: bool,
        ) -> BackendResult<Box<dyn BackendHandle>> {
            Err(BackendError::Unsupported("open".into()))
        }
    }

    #[test]
    fn test_chain_order_and_neighbours() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let chain = ChainBuilder::new(Named::new("plugin", &events))
            .filter(Named::new("inner", &events))
            .filter(Named::new("outer", &events))
            .build()
            .unwrap();

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.name(0), Some("outer"));
        assert_eq!(chain.name(1), Some("inner"));
        assert_eq!(chain.plugin().name(), "plugin");
        assert_eq!(chain.plugin().kind(), BackendKind::Plugin);

        assert_eq!(chain.inner_of(0), Some(1));
        assert_eq!(chain.inner_of(1), Some(2));
        assert_eq!(chain.inner_of(2), None);
        assert!(!chain.has_inner(2));
        assert_eq!(chain.inner_of(7), None);

        assert_eq!(
            *events.lock(),
            vec!["load plugin", "load inner", "load outer"]
        );
    }

    #[test]
    fn test_unload_outermost_first_and_once() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let chain = ChainBuilder::new(Named::new("plugin", &events))
            .filter(Named::new("outer", &events))
            .build()
            .unwrap();
        events.lock().clear();

        chain.unload();
        chain.unload();
        assert!(chain.is_unloaded());
        assert!(matches!(
            chain.callback_guard(),
            Err(BackendError::Unloaded)
        ));
        drop(chain);

        assert_eq!(*events.lock(), vec!["unload outer", "unload plugin"]);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let err = ChainBuilder::new(Named::new("plugin", &events))
            .filter(Named::new("bad name", &events))
            .build()
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidName { .. }));
        // Nothing is loaded when registration fails
        assert!(events.lock().is_empty());
    }
}
