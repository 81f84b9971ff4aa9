//! Benchmarks for symbol lookup.
//!
//! Resolution runs once per bootstrap, but offset tables are derived by resolving
//! many names in library images pulled off devices, where lookup cost dominates:
//! - Parsing a shared library image
//! - Symbol lookup in `.dynsym` / `.symtab`
//! - Resolution through the offline loader, cold and cached
//! - Memory map parsing

extern crate droidstrap;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use droidstrap::{
    resolver::{MemoryMap, OfflineLoader, SignatureTag, SymbolRequest, SymbolResolver},
    Image,
};
use std::{fs, hint::black_box, path::Path};

/// A shared library mapped into this process, used as benchmark input.
fn library() -> String {
    let map = MemoryMap::current().expect("Failed to read memory map");
    map.entries()
        .iter()
        .filter_map(|entry| entry.path.clone())
        .find(|path| path.contains("libc.so") && Path::new(path).is_file())
        .expect("No libc mapping found")
}

fn bench_image(c: &mut Criterion) {
    let path = library();
    let data = fs::read(&path).expect("Failed to read library");
    let image = Image::from_file(Path::new(&path)).expect("Failed to parse library");
    let names: Vec<String> = image
        .symbols()
        .into_iter()
        .map(|symbol| symbol.name)
        .take(256)
        .collect();

    println!("Benchmarking {path}: {} bytes, {} names", data.len(), names.len());

    let mut group = c.benchmark_group("image");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("parse", |b| {
        b.iter(|| Image::from_mem(black_box(data.clone())).unwrap());
    });
    group.finish();

    let mut group = c.benchmark_group("lookup");
    group.throughput(Throughput::Elements(names.len() as u64));
    group.bench_function("image_symbol", |b| {
        b.iter(|| {
            for name in &names {
                black_box(image.symbol(black_box(name)));
            }
        });
    });
    group.bench_function("image_symbol_missing", |b| {
        b.iter(|| black_box(image.symbol(black_box("droidstrap_no_such_symbol"))));
    });
    group.finish();
}

fn bench_resolver(c: &mut Criterion) {
    let path = library();
    let requests = [
        SymbolRequest::new("getpid", SignatureTag::DataPointer),
        SymbolRequest::new("malloc", SignatureTag::DataPointer),
        SymbolRequest::new("free", SignatureTag::DataPointer),
    ];

    let mut group = c.benchmark_group("resolver");
    group.bench_function("offline_cold", |b| {
        b.iter(|| {
            let mut resolver = SymbolResolver::new(OfflineLoader::new(), Vec::new());
            black_box(resolver.resolve(&path, black_box(&requests)).unwrap())
        });
    });

    let mut resolver = SymbolResolver::new(OfflineLoader::new(), Vec::new());
    let module = resolver.open(&path).unwrap();
    group.bench_function("offline_cached", |b| {
        b.iter(|| black_box(resolver.resolve_in(module, black_box(&requests)).unwrap()));
    });
    group.finish();
}

fn bench_maps(c: &mut Criterion) {
    let text = fs::read_to_string("/proc/self/maps").expect("Failed to read memory map");
    let lines = text.lines().count();

    let mut group = c.benchmark_group("maps");
    group.throughput(Throughput::Elements(lines as u64));
    group.bench_function("parse", |b| {
        b.iter(|| MemoryMap::parse(black_box(&text)).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_image, bench_resolver, bench_maps);
criterion_main!(benches);
