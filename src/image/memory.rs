use super::Backend;

/// A library image held in an owned buffer.
///
/// Used for images that never existed as a file: test fixtures, fuzz input and
/// images extracted from an archive by the caller.
#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Takes ownership of `data`.
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
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

    #[test]
    fn memory() {
        let image = ElfBuilder::new().function("JNI_CreateJavaVM", 0x200, 0x10).build();
        let len = image.len();

        let memory = Memory::new(image.clone());
        assert_eq!(memory.len(), len);
        assert_eq!(&memory.data()[..4], b"\x7fELF");

        let parsed = Image::from_mem(image).unwrap();
        assert_eq!(parsed.len(), len);
    }
}
