//! Integration tests against the running test process.
//!
//! These need no device: they read this process's memory map, parse the host's
//! shared libraries and resolve symbols in them through the real dynamic loader.

use std::path::{Path, PathBuf};

use droidstrap::{
    image::SymbolKind,
    resolver::{
        MemoryMap, ModuleState, OfflineLoader, Permissions, SignatureTag, SymbolRequest,
        SymbolResolver, SymbolSource,
    },
    ErrorKind, Image,
};

/// Path this process maps the C library from, if it is a glibc or bionic system.
fn mapped_libc() -> Option<String> {
    let map = MemoryMap::current().ok()?;
    let mut paths: Vec<String> = map
        .entries()
        .iter()
        .filter_map(|entry| entry.path.clone())
        .filter(|path| {
            Path::new(path)
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name == "libc.so" || name.starts_with("libc.so."))
        })
        .collect();
    paths.dedup();
    paths.into_iter().next()
}

#[test]
fn memory_map_covers_this_process() {
    let map = MemoryMap::current().unwrap();
    assert!(!map.entries().is_empty());

    let code = memory_map_covers_this_process as fn() as usize;
    let entry = map.find(code).expect("test code is mapped");
    assert!(entry.perms.contains(Permissions::READ | Permissions::EXEC));

    let stack = 0u8;
    let entry = map.find(&stack as *const u8 as usize).expect("stack is mapped");
    assert!(entry.perms.contains(Permissions::READ | Permissions::WRITE));
}

#[test]
fn memory_map_text() {
    let text = "\
7a1c200000-7a1c2a0000 r--p 00000000 fd:00 1042    /system/lib64/libandroid_runtime.so
7a1c2a0000-7a1c3c0000 r-xp 000a0000 fd:00 1042    /system/lib64/libandroid_runtime.so
7a1c3c0000-7a1c3d0000 rw-p 001c0000 fd:00 1042    /system/lib64/libandroid_runtime.so
7a1c3d0000-7a1c3d8000 rw-p 00000000 00:00 0       [anon:.bss]
7a1c400000-7a1c410000 r--p 00000000 fd:00 2001    /apex/com.android.art/lib64/libart.so
";
    let map = MemoryMap::parse(text).unwrap();
    assert_eq!(map.entries().len(), 5);

    let path = map.mapped_path("libandroid_runtime.so").unwrap();
    assert_eq!(path, "/system/lib64/libandroid_runtime.so");

    let extent = map.module_extent(&path).unwrap();
    assert_eq!(extent.base, 0x7a1c20_0000);
    assert_eq!(extent.end, 0x7a1c3d_8000);

    assert!(map.mapped_path("libc.so").is_none());
    assert_eq!(
        MemoryMap::parse("not a mapping").unwrap_err().kind(),
        ErrorKind::Malformed
    );
}

#[test]
fn parses_host_libc_image() {
    let Some(libc) = mapped_libc() else {
        eprintln!("no libc mapping found, skipping");
        return;
    };

    let image = Image::from_file(Path::new(&libc)).unwrap();
    assert_eq!(image.is_64(), cfg!(target_pointer_width = "64"));
    assert!(image.load_span().is_some());

    let getpid = image.symbol("getpid").expect("libc exports getpid");
    assert_eq!(getpid.kind, SymbolKind::Function);
    assert_ne!(getpid.value, 0);
    assert!(image.symbol("droidstrap_no_such_symbol").is_none());
}

#[test]
fn resolves_in_mapped_libc() {
    let Some(libc) = mapped_libc() else {
        eprintln!("no libc mapping found, skipping");
        return;
    };

    let mut resolver = SymbolResolver::system(Vec::new());
    let resolution = resolver
        .resolve(
            &libc,
            &[SymbolRequest::new("getpid", SignatureTag::DataPointer)],
        )
        .unwrap();

    let module = resolver.module(resolution.module).unwrap();
    assert_eq!(module.state(), ModuleState::Loaded);
    assert!(module.has_handle());

    let symbol = resolution.get("getpid").unwrap();
    assert_eq!(symbol.source(), SymbolSource::Loader);
    assert_eq!(symbol.data(module).unwrap(), symbol.address());

    let missing = resolver
        .resolve_in(
            resolution.module,
            &[SymbolRequest::new("droidstrap_no_such_symbol", SignatureTag::DataPointer)],
        )
        .unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::SymbolNotFound);

    resolver.teardown();
    let module = resolver.module(resolution.module).unwrap();
    assert_eq!(module.state(), ModuleState::Unloaded);
    assert_eq!(
        symbol.data(module).unwrap_err().kind(),
        ErrorKind::ModuleNotLoaded
    );
}

#[test]
fn offline_offsets_match_image() {
    let Some(libc) = mapped_libc() else {
        eprintln!("no libc mapping found, skipping");
        return;
    };

    let image = Image::from_file(Path::new(&libc)).unwrap();
    let expected = image.symbol("getpid").unwrap().value as usize;
    let low = image.load_span().unwrap().0 as usize & !0xfff;

    let mut resolver = SymbolResolver::new(OfflineLoader::new(), Vec::new());
    let resolution = resolver
        .resolve(
            &libc,
            &[SymbolRequest::new("getpid", SignatureTag::DataPointer)],
        )
        .unwrap();

    let module = resolver.module(resolution.module).unwrap();
    let symbol = &resolution.symbols[0];
    assert_eq!(symbol.source(), SymbolSource::Image);
    assert_eq!(symbol.address() - module.base(), expected - low);
}

#[test]
fn missing_library() {
    let mut resolver = SymbolResolver::new(
        OfflineLoader::new(),
        vec![PathBuf::from("/nonexistent/droidstrap")],
    );

    let error = resolver.open("libdroidstrap_missing.so").unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ModuleNotFound);
    assert!(resolver.modules().is_empty());
}
