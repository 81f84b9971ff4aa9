//! On-disk shared-library images and their symbol tables.
//!
//! The platform loader only answers lookups for symbols a library chooses to
//! export, and on recent releases it refuses to hand out handles to private system
//! libraries at all. To resolve entry points and data symbols in those situations the
//! resolver reads the library's ELF image itself, using the same file the loader
//! mapped, and combines the symbol's link-time value with the module's load bias.
//!
//! # Key Components
//!
//! - [`Image`] - A parsed ELF shared object, backed by a [`Backend`]
//! - [`Backend`] - Byte source abstraction ([`Physical`] for mapped files, [`Memory`] for buffers)
//! - [`ElfSymbol`] - A defined symbol from `.dynsym` or `.symtab`
//!
//! # Examples
//!
//! ```rust,no_run
//! use droidstrap::image::Image;
//! use std::path::Path;
//!
//! let image = Image::from_file(Path::new("/system/lib64/libandroid_runtime.so"))?;
//! if let Some(symbol) = image.symbol("_ZN7android14AndroidRuntime7mJavaVME") {
//!     println!("{} at {:#x} ({} bytes)", symbol.name, symbol.value, symbol.size);
//! }
//! # Ok::<(), droidstrap::Error>(())
//! ```

mod memory;
mod physical;

pub use memory::Memory;
pub use physical::Physical;

use std::path::Path;

use goblin::{
    elf::{
        header::ET_DYN,
        program_header::PT_LOAD,
        section_header::SHN_UNDEF,
        sym::{Sym, Symtab, STT_FUNC, STT_GNU_IFUNC, STT_OBJECT, STT_TLS},
        Elf,
    },
    strtab::Strtab,
};
use ouroboros::self_referencing;
use strum::Display;

use crate::{
    Error::{Empty, GoblinErr},
    Result,
};

/// Source of image bytes.
///
/// Implementations must be thread-safe. goblin parses straight out of [`Backend::data`],
/// so a backend only has to hand out one stable slice for the life of the image.
pub trait Backend: Send + Sync {
    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

/// Which symbol table a symbol was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SymbolTable {
    /// `.dynsym`, the table the platform loader uses.
    Dynamic,
    /// `.symtab`, present in unstripped images only.
    Static,
}

/// The ELF type of a symbol, reduced to what resolution cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SymbolKind {
    /// Code (`STT_FUNC`, `STT_GNU_IFUNC`)
    Function,
    /// Data (`STT_OBJECT`)
    Object,
    /// Anything else that carries an address
    Other,
}

impl SymbolKind {
    fn from_sym(sym: &Sym) -> Self {
        match sym.st_type() {
            STT_FUNC | STT_GNU_IFUNC => SymbolKind::Function,
            STT_OBJECT => SymbolKind::Object,
            _ => SymbolKind::Other,
        }
    }
}

/// A defined symbol read from an [`Image`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfSymbol {
    /// Mangled symbol name
    pub name: String,
    /// Link-time virtual address (`st_value`)
    pub value: u64,
    /// Size in bytes (`st_size`), zero when unknown
    pub size: u64,
    /// Function, object or other
    pub kind: SymbolKind,
    /// Table the symbol came from
    pub table: SymbolTable,
}

#[self_referencing]
/// A parsed ELF shared object.
///
/// The image owns its byte source and the goblin view borrowing from it, so it can
/// be cached next to the module it describes without lifetime plumbing.
///
/// Only `ET_DYN` images are accepted; the runtime library and everything it is
/// resolved against are shared objects.
pub struct Image {
    data: Box<dyn Backend>,
    #[borrows(data)]
    #[not_covariant]
    elf: Elf<'this>,
}

impl Image {
    /// Loads and parses the library at `file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be mapped, is empty, is not valid ELF or
    /// is not a shared object.
    pub fn from_file(file: &Path) -> Result<Image> {
        let input = Physical::new(file)?;

        Self::load(input)
    }

    /// Parses an image that is already in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is empty, not valid ELF or not a shared object.
    pub fn from_mem(data: Vec<u8>) -> Result<Image> {
        let input = Memory::new(data);

        Self::load(input)
    }

    fn load<T: Backend + 'static>(data: T) -> Result<Image> {
        if data.len() == 0 {
            return Err(Empty);
        }

        let data: Box<dyn Backend> = Box::new(data);

        Image::try_new(data, |data| match Elf::parse(data.data()) {
            Ok(elf) => {
                if elf.header.e_type != ET_DYN {
                    Err(malformed_error!(
                        "Image is not a shared object - e_type {}",
                        elf.header.e_type
                    ))
                } else {
                    Ok(elf)
                }
            }
            Err(error) => Err(GoblinErr(error)),
        })
    }

    /// Returns the total size of the image in bytes.
    pub fn len(&self) -> usize {
        self.borrow_data().len()
    }

    /// Returns true if the image has a length of zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the raw image bytes.
    pub fn data(&self) -> &[u8] {
        self.borrow_data().data()
    }

    /// Returns true for ELFCLASS64 images.
    pub fn is_64(&self) -> bool {
        self.with_elf(|elf| elf.is_64)
    }

    /// Returns the `DT_SONAME` of the image, if it declares one.
    pub fn soname(&self) -> Option<String> {
        self.with_elf(|elf| elf.soname.map(str::to_string))
    }

    /// Returns the virtual address span covered by the `PT_LOAD` segments.
    ///
    /// The span is `(lowest p_vaddr, highest p_vaddr + p_memsz)`, so it includes
    /// zero-initialised storage that has no bytes on disk. Returns `None` for an
    /// image without loadable segments.
    pub fn load_span(&self) -> Option<(u64, u64)> {
        self.with_elf(|elf| {
            elf.program_headers
                .iter()
                .filter(|header| header.p_type == PT_LOAD)
                .fold(None, |span: Option<(u64, u64)>, header| {
                    let start = header.p_vaddr;
                    let end = header.p_vaddr.saturating_add(header.p_memsz);
                    Some(match span {
                        Some((low, high)) => (low.min(start), high.max(end)),
                        None => (start, end),
                    })
                })
        })
    }

    /// Finds a defined symbol by its exact (mangled) name.
    ///
    /// `.dynsym` is searched first, then `.symtab`. Undefined imports and
    /// thread-local symbols are skipped because neither has a usable address in this
    /// module.
    pub fn symbol(&self, name: &str) -> Option<ElfSymbol> {
        self.with_elf(|elf| {
            find_in(&elf.dynsyms, &elf.dynstrtab, name, SymbolTable::Dynamic)
                .or_else(|| find_in(&elf.syms, &elf.strtab, name, SymbolTable::Static))
        })
    }

    /// Returns every defined symbol of the image, dynamic table first.
    pub fn symbols(&self) -> Vec<ElfSymbol> {
        self.with_elf(|elf| {
            let mut symbols = Vec::with_capacity(elf.dynsyms.len() + elf.syms.len());
            collect_from(&elf.dynsyms, &elf.dynstrtab, SymbolTable::Dynamic, &mut symbols);
            collect_from(&elf.syms, &elf.strtab, SymbolTable::Static, &mut symbols);
            symbols
        })
    }
}

fn is_defined(sym: &Sym) -> bool {
    sym.st_shndx != SHN_UNDEF as usize && sym.st_value != 0 && sym.st_type() != STT_TLS
}

fn to_symbol(sym: &Sym, name: &str, table: SymbolTable) -> ElfSymbol {
    ElfSymbol {
        name: name.to_string(),
        value: sym.st_value,
        size: sym.st_size,
        kind: SymbolKind::from_sym(sym),
        table,
    }
}

fn find_in(
    symtab: &Symtab,
    strtab: &Strtab,
    name: &str,
    table: SymbolTable,
) -> Option<ElfSymbol> {
    symtab
        .iter()
        .filter(is_defined)
        .find(|sym| strtab.get_at(sym.st_name) == Some(name))
        .map(|sym| to_symbol(&sym, name, table))
}

fn collect_from(
    symtab: &Symtab,
    strtab: &Strtab,
    table: SymbolTable,
    out: &mut Vec<ElfSymbol>,
) {
    for sym in symtab.iter().filter(is_defined) {
        if let Some(name) = strtab.get_at(sym.st_name).filter(|name| !name.is_empty()) {
            out.push(to_symbol(&sym, name, table));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::ElfBuilder;
    use std::{env, fs, process};

    fn sample() -> Vec<u8> {
        ElfBuilder::new()
            .function("JNI_CreateJavaVM", 0x210, 0x40)
            .object("_ZN7android14AndroidRuntime7mJavaVME", 0x300, 8)
            .undefined("malloc")
            .bss(0x100)
            .build()
    }

    #[test]
    fn load_buffer() {
        let image = Image::from_mem(sample()).unwrap();

        assert!(image.is_64());
        assert!(!image.is_empty());
        assert_eq!(&image.data()[..4], b"\x7fELF");

        let create = image.symbol("JNI_CreateJavaVM").unwrap();
        assert_eq!(create.value, 0x210);
        assert_eq!(create.size, 0x40);
        assert_eq!(create.kind, SymbolKind::Function);

        let field = image.symbol("_ZN7android14AndroidRuntime7mJavaVME").unwrap();
        assert_eq!(field.value, 0x300);
        assert_eq!(field.kind, SymbolKind::Object);
    }

    #[test]
    fn load_file() {
        let path = env::temp_dir().join(format!("droidstrap_image_{}.so", process::id()));
        fs::write(&path, sample()).unwrap();

        let image = Image::from_file(&path).unwrap();
        assert!(image.symbol("JNI_CreateJavaVM").is_some());

        drop(image);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn undefined_symbols_are_not_found() {
        let image = Image::from_mem(sample()).unwrap();

        assert!(image.symbol("malloc").is_none());
        assert!(image.symbol("JNI_CreateJavaVM_v2").is_none());
        assert!(image.symbols().iter().all(|symbol| symbol.name != "malloc"));
        assert_eq!(image.symbols().len(), 2);
    }

    #[test]
    fn load_span_includes_bss() {
        let bytes = sample();
        let file_len = bytes.len() as u64;
        let image = Image::from_mem(bytes).unwrap();

        assert_eq!(image.load_span(), Some((0, file_len + 0x100)));
    }

    #[test]
    fn load_invalid() {
        assert!(matches!(Image::from_mem(Vec::new()), Err(crate::Error::Empty)));
        assert!(Image::from_mem(vec![0xCC; 256]).is_err());
    }

    #[test]
    fn rejects_executables() {
        let bytes = ElfBuilder::new().executable().build();

        assert!(matches!(
            Image::from_mem(bytes),
            Err(crate::Error::Malformed { .. })
        ));
    }
}
