use std::path::PathBuf;

use droidstrap::{
    resolver::{OfflineLoader, SignatureTag, SymbolRequest, SymbolResolver},
    DEFAULT_SEARCH_PATHS,
};

pub fn run(library: &str, names: &[String], search: &[PathBuf]) -> anyhow::Result<()> {
    let search = if search.is_empty() {
        DEFAULT_SEARCH_PATHS.iter().map(PathBuf::from).collect()
    } else {
        search.to_vec()
    };

    let mut resolver = SymbolResolver::new(OfflineLoader::new(), search);
    let module = resolver.open(library)?;
    let base = resolver
        .module(module)
        .map(|module| module.base())
        .unwrap_or(OfflineLoader::DEFAULT_BASE);

    let mut missing = 0usize;
    for name in names {
        let request = SymbolRequest::new(name, SignatureTag::DataPointer);
        match resolver.resolve_optional(module, request)? {
            Some(symbol) => println!("{:#010x}  {}", symbol.address() - base, name),
            None => {
                println!("{:>10}  {}", "-", name);
                missing += 1;
            }
        }
    }

    if missing > 0 {
        anyhow::bail!("{missing} of {} symbols not found", names.len());
    }
    Ok(())
}
