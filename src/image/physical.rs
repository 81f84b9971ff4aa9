//! Memory-mapped backend for library images on disk.
//!
//! System libraries are read in a sparse pattern during symbol lookup (headers,
//! section table, symbol and string tables), so [`Physical`] maps the file instead of
//! reading it whole and lets the kernel page in what the lookup touches.

use super::Backend;
use crate::Result;

use memmap2::Mmap;
use std::{fs, path::Path};

/// A library image mapped read-only from disk.
///
/// # Examples
///
/// ```rust,no_run
/// use droidstrap::image::{Backend, Physical};
///
/// let physical = Physical::new("/system/lib64/libandroid_runtime.so")?;
/// assert!(physical.data().starts_with(b"\x7fELF"));
/// # Ok::<(), droidstrap::Error>(())
/// ```
#[derive(Debug)]
pub struct Physical {
    data: Mmap,
}

impl Physical {
    /// Maps the file at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Io`] if the file cannot be opened or mapped.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = fs::File::open(path)?;

        // Safety: the mapping is read-only; system library images are not rewritten while mapped
        let data = unsafe { Mmap::map(&file) }?;

        Ok(Physical { data })
    }
}

impl Backend for Physical {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{image::Image, test::ElfBuilder};
    use std::{env, fs, process};

    #[test]
    fn physical() {
        let path = env::temp_dir().join(format!("droidstrap_physical_{}.so", process::id()));
        let contents = ElfBuilder::new().object("gCurRuntime", 0x300, 8).build();
        fs::write(&path, &contents).unwrap();

        let physical = Physical::new(&path).unwrap();
        assert_eq!(physical.len(), contents.len());
        assert_eq!(physical.data(), contents.as_slice());
        drop(physical);

        let image = Image::from_file(&path).unwrap();
        assert_eq!(image.symbol("gCurRuntime").unwrap().value, 0x300);

        drop(image);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file() {
        let result = Physical::new("/nonexistent/droidstrap/libmissing.so");
        assert!(matches!(result, Err(crate::Error::Io(_))));
    }
}
