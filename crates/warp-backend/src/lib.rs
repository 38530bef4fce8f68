//! Backend chain dispatcher for the WARP block server
//!
//! This crate is the synchronous core behind an NBD-style export: an
//! ordered chain of backends (filters stacked in front of one data-source
//! plugin), the per-connection state machine that opens, prepares,
//! finalizes and closes it, and the extent ledger used to answer
//! block-status queries.
//!
//! # Features
//!
//! - Capability negotiation cached per connection and layer
//! - Range, flag and state checks on every data request
//! - Emulated extents, cache, FUA and write-zeroes
//! - Coalescing extent ledger with alignment normalization
//! - Sparse in-memory reference plugin
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  Transport   │  (NBD handshake and request loop)
//! └──────┬───────┘
//!        │ Connection::top()
//! ┌──────▼───────┐
//! │ Layer 0      │  outermost filter
//! ├──────────────┤
//! │ Layer 1..n-1 │  filters, each calling `next`
//! ├──────────────┤
//! │ Layer n      │  plugin
//! └──────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use warp_backend::{ChainBuilder, Connection, MemoryPlugin, RequestFlags};
//!
//! let chain = ChainBuilder::new(Arc::new(MemoryPlugin::new(1 << 20)))
//!     .build()
//!     .unwrap();
//! let mut conn = Connection::new(Arc::new(chain));
//! let mut top = conn.top();
//! top.open(false, "").unwrap();
//! top.prepare().unwrap();
//! let info = top.negotiate().unwrap();
//! assert_eq!(info.size, 1 << 20);
//!
//! top.pwrite(b"hello", 0, RequestFlags::FUA).unwrap();
//! let mut buf = [0u8; 5];
//! top.pread(&mut buf, 0, RequestFlags::NONE).unwrap();
//! assert_eq!(&buf, b"hello");
//! conn.shutdown().unwrap();
//! ```

#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod aligned;
pub mod backend;
pub mod chain;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod extent;
pub mod flags;
pub mod logging;
pub mod memory;

pub use aligned::extents_aligned;
pub use backend::{validate_name, Backend, BackendHandle, Export, Support};
pub use chain::{BackendEntry, BackendKind, Chain, ChainBuilder};
pub use config::{DebugFlags, ServerConfig};
pub use context::{Capabilities, Context, ContextState, Transition};
pub use dispatch::{Connection, ExportInfo, Layer};
pub use error::{BackendError, BackendResult, NbdError};
pub use extent::{Extent, ExtentType, Extents, MAX_EXTENTS};
pub use flags::{RequestFlags, TransmissionFlags};
pub use logging::{init_logging, LogConfig, LogFormat, LogLevel, LogOutput};
pub use memory::MemoryPlugin;
