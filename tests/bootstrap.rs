//! Integration tests for the bootstrap orchestrator.
//!
//! A VM can only be created on a device, so these drive [`Bootstrap`] against
//! libraries that are read, never executed, and check that each failure is attributed
//! to the right stage without touching the process lifecycle.

use std::path::{Path, PathBuf};

use droidstrap::{
    resolver::{MemoryMap, OfflineLoader},
    vm::{Lifecycle, RuntimeState},
    Bootstrap, BootstrapConfig, Error, ErrorKind, PlatformVersion, Stage, START_REG_SYMBOL,
};

fn config() -> BootstrapConfig {
    BootstrapConfig::new()
        .with_search_paths(vec![PathBuf::from("/nonexistent/droidstrap")])
        .with_platform(PlatformVersion::new(34, "14"))
}

fn mapped_library() -> Option<String> {
    let map = MemoryMap::current().ok()?;
    map.entries()
        .iter()
        .filter_map(|entry| entry.path.clone())
        .find(|path| path.ends_with(".so") || path.contains(".so."))
        .filter(|path| Path::new(path).is_file())
}

#[test]
fn runtime_library_not_found() {
    let lifecycle = Lifecycle::new();

    let failure = Bootstrap::with_loader(config(), OfflineLoader::new(), &lifecycle)
        .run()
        .err()
        .unwrap();

    assert_eq!(failure.stage(), Stage::Resolve);
    assert_eq!(failure.kind(), ErrorKind::ModuleNotFound);
    assert_eq!(failure.status(), None);
    assert!(failure.to_string().starts_with("stage=resolve kind=module_not_found status=- "));
    assert_eq!(lifecycle.state(), RuntimeState::Uninitialized);
}

#[test]
fn foreign_runtime_library_lacks_registration() {
    let Some(library) = mapped_library() else {
        eprintln!("no shared library mapped, skipping");
        return;
    };
    let lifecycle = Lifecycle::new();

    let config = config().with_runtime_library(library);
    let failure = Bootstrap::with_loader(config, OfflineLoader::new(), &lifecycle)
        .run()
        .err()
        .unwrap();

    assert_eq!(failure.stage(), Stage::Resolve);
    match failure.error() {
        Error::SymbolNotFound { symbol, .. } => assert_eq!(symbol, START_REG_SYMBOL),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(lifecycle.state(), RuntimeState::Uninitialized);
}

#[test]
fn unsupported_platform_fails_first() {
    let lifecycle = Lifecycle::new();
    let config = config().with_platform(PlatformVersion::new(16, "4.1"));

    let failure = Bootstrap::with_loader(config, OfflineLoader::new(), &lifecycle)
        .run()
        .err()
        .unwrap();

    assert_eq!(failure.stage(), Stage::Patch);
    assert_eq!(failure.kind(), ErrorKind::UnsupportedPlatformVersion);
    assert_eq!(lifecycle.state(), RuntimeState::Uninitialized);
}

#[test]
fn offset_table_file_missing() {
    let lifecycle = Lifecycle::new();
    let config = config().with_offsets(droidstrap::OffsetSource::File(PathBuf::from(
        "/nonexistent/droidstrap/offsets.json",
    )));

    let failure = Bootstrap::with_loader(config, OfflineLoader::new(), &lifecycle)
        .run()
        .err()
        .unwrap();

    assert_eq!(failure.stage(), Stage::Patch);
    assert_eq!(failure.kind(), ErrorKind::Io);
    assert!(failure.status().is_some());
}
