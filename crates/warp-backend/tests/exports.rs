//! Export listing and default export resolution

mod common;

use std::sync::Arc;

use common::{chain, connect, Events, MockOptions, TraceFilter};
use warp_backend::{Backend, Connection, Export, MemoryPlugin, ServerConfig};

#[test]
fn test_list_exports_resolves_default_entry() {
    let events = Events::new();
    let mut opts = MockOptions::new(4096);
    opts.default_export = Some("primary".to_string());
    opts.exports = vec![
        Export::new("").with_description("the default"),
        Export::new("backup"),
    ];
    let filters: Vec<Arc<dyn Backend>> = vec![TraceFilter::new("outer", &events)];
    let chain = chain(opts.build(&events), filters, ServerConfig::default());

    let mut conn = Connection::new(chain);
    let exports = conn.top().list_exports(false).unwrap();
    assert_eq!(
        exports,
        vec![
            Export::new("primary").with_description("the default"),
            Export::new("backup"),
        ]
    );
    assert_eq!(events.count("mock: list_exports"), 1);
}

#[test]
fn test_list_exports_drops_forbidden_default() {
    let events = Events::new();
    let mut opts = MockOptions::new(4096);
    opts.default_export = None;
    opts.exports = vec![Export::new(""), Export::new("named")];
    let chain = chain(opts.build(&events), Vec::new(), ServerConfig::default());

    let mut conn = Connection::new(chain);
    let exports = conn.top().list_exports(true).unwrap();
    assert_eq!(exports, vec![Export::new("named")]);
}

#[test]
fn test_list_exports_needs_closed_layer() {
    let events = Events::new();
    let chain = chain(
        MockOptions::new(4096).build(&events),
        Vec::new(),
        ServerConfig::default(),
    );
    let mut conn = connect(&chain, false);
    assert!(conn.top().list_exports(false).is_err());
}

#[test]
fn test_default_export_cached_per_connection() {
    let events = Events::new();
    let mut opts = MockOptions::new(4096);
    opts.default_export = Some("disk".to_string());
    let chain = chain(opts.build(&events), Vec::new(), ServerConfig::default());

    let mut first = Connection::new(chain.clone());
    for _ in 0..3 {
        assert_eq!(first.top().default_export(false).as_deref(), Some("disk"));
    }
    assert_eq!(events.count("mock: default_export"), 1);

    let mut second = Connection::new(chain);
    assert_eq!(second.top().default_export(false).as_deref(), Some("disk"));
    assert_eq!(events.count("mock: default_export"), 2);
}

#[test]
fn test_overlong_strings_ignored() {
    let events = Events::new();
    let mut opts = MockOptions::new(4096);
    opts.default_export = Some("a-rather-long-name".to_string());
    opts.description = Some("a rather long description".to_string());
    let config = ServerConfig::default().with_max_string_len(8);
    let chain = chain(opts.build(&events), Vec::new(), config);

    let mut conn = Connection::new(chain);
    let mut top = conn.top();
    assert_eq!(top.default_export(false), None);
    assert!(top.open(false, "").is_err());

    top.open(false, "short").unwrap();
    top.prepare().unwrap();
    assert_eq!(top.export_description(), None);
    assert_eq!(events.count("mock: export_description"), 1);
}

#[test]
fn test_export_description_not_cached() {
    let events = Events::new();
    let mut opts = MockOptions::new(4096);
    opts.description = Some("scratch".to_string());
    let chain = chain(opts.build(&events), Vec::new(), ServerConfig::default());
    let mut conn = connect(&chain, false);
    events.take();

    let mut top = conn.top();
    assert_eq!(top.export_description().as_deref(), Some("scratch"));
    assert_eq!(top.export_description().as_deref(), Some("scratch"));
    assert_eq!(events.count("mock: export_description"), 2);
}

#[test]
fn test_memory_plugin_shared_between_connections() {
    let plugin = MemoryPlugin::new(1 << 16).with_export("shared");
    let chain = chain(Arc::new(plugin.clone()), Vec::new(), ServerConfig::default());

    let mut writer = connect(&chain, false);
    writer
        .top()
        .pwrite(b"multi-conn", 100, warp_backend::RequestFlags::NONE)
        .unwrap();

    let mut reader = connect(&chain, true);
    let mut buf = [0u8; 10];
    reader
        .top()
        .pread(&mut buf, 100, warp_backend::RequestFlags::NONE)
        .unwrap();
    assert_eq!(&buf, b"multi-conn");
    assert!(reader.top().can_multi_conn().unwrap());
    assert_eq!(plugin.allocated_pages(), 1);
}
