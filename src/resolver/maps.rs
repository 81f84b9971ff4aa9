//! Parser for the process memory map (`/proc/self/maps`).
//!
//! The map is the ground truth for which library images are mapped where. The
//! resolver uses it to find a module's base address and extent, and the foreign
//! memory layer uses it to refuse accesses outside readable or writable mappings.

use std::{fs, path::Path, str::FromStr};

use bitflags::bitflags;

use crate::{Error, Result};

/// Location of the current process's memory map.
pub const PROC_SELF_MAPS: &str = "/proc/self/maps";

const BSS_NAME: &str = "[anon:.bss]";

bitflags! {
    /// Access permissions of a mapping, as printed in the second column of the map.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        /// Readable
        const READ = 0x01;
        /// Writable
        const WRITE = 0x02;
        /// Executable
        const EXEC = 0x04;
        /// Private copy-on-write mapping
        const PRIVATE = 0x08;
        /// Shared mapping
        const SHARED = 0x10;
    }
}

impl FromStr for Permissions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err(malformed_error!("Invalid permission field - {}", s));
        }

        let mut perms = Permissions::empty();
        for (index, (letter, flag)) in [
            (b'r', Permissions::READ),
            (b'w', Permissions::WRITE),
            (b'x', Permissions::EXEC),
        ]
        .into_iter()
        .enumerate()
        {
            match bytes[index] {
                b'-' => {}
                byte if byte == letter => perms |= flag,
                _ => return Err(malformed_error!("Invalid permission field - {}", s)),
            }
        }

        match bytes[3] {
            b'p' => perms |= Permissions::PRIVATE,
            b's' => perms |= Permissions::SHARED,
            _ => return Err(malformed_error!("Invalid permission field - {}", s)),
        }

        Ok(perms)
    }
}

/// One line of the memory map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    /// First address of the mapping
    pub start: usize,
    /// One past the last address of the mapping
    pub end: usize,
    /// Access permissions
    pub perms: Permissions,
    /// Offset into the backing file
    pub offset: u64,
    /// Backing file or pseudo-name (`[stack]`, `[anon:.bss]`), if any
    pub path: Option<String>,
}

impl MapEntry {
    /// Returns true if `[address, address + len)` lies within this mapping.
    pub fn contains(&self, address: usize, len: usize) -> bool {
        match address.checked_add(len) {
            Some(end) => address >= self.start && end <= self.end,
            None => false,
        }
    }

    fn file_name(&self) -> Option<&str> {
        self.path
            .as_deref()
            .filter(|path| path.starts_with('/'))
            .and_then(|path| path.rsplit('/').next())
    }
}

impl FromStr for MapEntry {
    type Err = Error;

    /// Parses `start-end perms offset dev inode [path]`.
    fn from_str(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let (Some(range), Some(perms), Some(offset), Some(_dev), Some(_inode)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(malformed_error!("Truncated memory map line - {}", line));
        };

        let Some((start, end)) = range.split_once('-') else {
            return Err(malformed_error!("Invalid address range - {}", range));
        };
        let start = usize::from_str_radix(start, 16)
            .map_err(|_| malformed_error!("Invalid start address - {}", start))?;
        let end = usize::from_str_radix(end, 16)
            .map_err(|_| malformed_error!("Invalid end address - {}", end))?;
        if end < start {
            return Err(malformed_error!("Inverted address range - {}", range));
        }

        let offset = u64::from_str_radix(offset, 16)
            .map_err(|_| malformed_error!("Invalid offset - {}", offset))?;

        // The path is the remainder of the line and may itself contain spaces
        let path = fields
            .next()
            .map(|first| line[first.as_ptr() as usize - line.as_ptr() as usize..].trim_end())
            .map(str::to_string);

        Ok(MapEntry {
            start,
            end,
            perms: perms.parse()?,
            offset,
            path,
        })
    }
}

/// Address range a module occupies, including its trailing anonymous `.bss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Lowest mapped address of the module
    pub base: usize,
    /// One past the highest mapped address of the module
    pub end: usize,
}

impl Extent {
    /// Size of the extent in bytes.
    pub fn size(&self) -> usize {
        self.end - self.base
    }
}

/// A snapshot of the process memory map.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    entries: Vec<MapEntry>,
}

impl MemoryMap {
    /// Reads the memory map of the current process.
    ///
    /// # Errors
    /// Returns [`crate::Error::Io`] if the map cannot be read, or
    /// [`crate::Error::Malformed`] if a line cannot be parsed.
    pub fn current() -> Result<Self> {
        Self::from_file(Path::new(PROC_SELF_MAPS))
    }

    /// Reads a memory map from a file in `/proc/<pid>/maps` format.
    ///
    /// # Errors
    /// Returns [`crate::Error::Io`] if the file cannot be read, or
    /// [`crate::Error::Malformed`] if a line cannot be parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Parses memory map text. Blank lines are ignored.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a line cannot be parsed.
    pub fn parse(text: &str) -> Result<Self> {
        let entries = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<MapEntry>>>()?;

        Ok(MemoryMap { entries })
    }

    /// Builds a map from already parsed entries.
    pub fn from_entries(mut entries: Vec<MapEntry>) -> Self {
        entries.sort_by_key(|entry| entry.start);
        MemoryMap { entries }
    }

    /// All entries, in ascending address order.
    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    /// Returns the mapping containing `address`.
    pub fn find(&self, address: usize) -> Option<&MapEntry> {
        self.entries
            .iter()
            .find(|entry| address >= entry.start && address < entry.end)
    }

    /// Returns the path the given library name is mapped from.
    ///
    /// An exact path match always wins. A bare file name matches only when exactly one
    /// distinct mapped path ends in that name, so two copies of the same library from
    /// different directories are never conflated.
    pub fn mapped_path(&self, library: &str) -> Option<String> {
        if self
            .entries
            .iter()
            .any(|entry| entry.path.as_deref() == Some(library))
        {
            return Some(library.to_string());
        }

        if library.contains('/') {
            return None;
        }

        let mut candidates: Vec<&str> = self
            .entries
            .iter()
            .filter(|entry| entry.file_name() == Some(library))
            .filter_map(|entry| entry.path.as_deref())
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        match candidates.as_slice() {
            [only] => Some((*only).to_string()),
            _ => None,
        }
    }

    /// Returns the extent of the module mapped from exactly `path`.
    ///
    /// The extent spans every mapping backed by `path`, plus anonymous `.bss` mappings
    /// directly following the last of them.
    pub fn module_extent(&self, path: &str) -> Option<Extent> {
        let mut extent: Option<Extent> = None;
        let mut last_index = 0;

        for (index, entry) in self.entries.iter().enumerate() {
            if entry.path.as_deref() != Some(path) {
                continue;
            }

            extent = Some(match extent {
                Some(extent) => Extent {
                    base: extent.base.min(entry.start),
                    end: extent.end.max(entry.end),
                },
                None => Extent {
                    base: entry.start,
                    end: entry.end,
                },
            });
            last_index = index;
        }

        let mut extent = extent?;
        for entry in &self.entries[last_index + 1..] {
            if entry.start != extent.end || entry.path.as_deref() != Some(BSS_NAME) {
                break;
            }
            extent.end = entry.end;
        }

        Some(extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
12c00000-32c00000 rw-p 00000000 00:00 0                                  [anon:dalvik-main space]
7a1c200000-7a1c2a0000 r--p 00000000 fd:00 1042                           /system/lib64/libandroid_runtime.so
7a1c2a0000-7a1c3c0000 r-xp 000a0000 fd:00 1042                           /system/lib64/libandroid_runtime.so
7a1c3c0000-7a1c3d0000 rw-p 001c0000 fd:00 1042                           /system/lib64/libandroid_runtime.so
7a1c3d0000-7a1c3d2000 rw-p 00000000 00:00 0                              [anon:.bss]
7a1c3d2000-7a1c3d4000 rw-p 00000000 00:00 0                              [anon:.bss]
7a1c400000-7a1c410000 r--p 00000000 fd:00 2001                           /apex/com.android.art/lib64/libart.so
7a1c500000-7a1c510000 r--p 00000000 fd:00 3001                           /data/local/tmp/my lib.so
7fff0000-7fff2000 rw-p 00000000 00:00 0                                  [stack]
";

    #[test]
    fn parse_lines() {
        let map = MemoryMap::parse(SAMPLE).unwrap();
        assert_eq!(map.entries().len(), 9);

        let code = &map.entries()[2];
        assert_eq!(code.start, 0x7a1c2a0000);
        assert_eq!(code.end, 0x7a1c3c0000);
        assert_eq!(code.offset, 0xa0000);
        assert_eq!(code.perms, Permissions::READ | Permissions::EXEC | Permissions::PRIVATE);
        assert_eq!(
            code.path.as_deref(),
            Some("/system/lib64/libandroid_runtime.so")
        );

        let spaced = &map.entries()[7];
        assert_eq!(spaced.path.as_deref(), Some("/data/local/tmp/my lib.so"));
    }

    #[test]
    fn anonymous_mapping_has_no_path() {
        let entry: MapEntry = "7fff0000-7fff2000 rw-s 00000000 00:00 0".parse().unwrap();
        assert!(entry.path.is_none());
        assert!(entry.perms.contains(Permissions::SHARED | Permissions::WRITE));
    }

    #[test]
    fn module_extent_includes_bss() {
        let map = MemoryMap::parse(SAMPLE).unwrap();
        let extent = map
            .module_extent("/system/lib64/libandroid_runtime.so")
            .unwrap();

        assert_eq!(extent.base, 0x7a1c200000);
        assert_eq!(extent.end, 0x7a1c3d4000);
        assert_eq!(extent.size(), 0x1d4000);
        assert!(map.module_extent("/system/lib64/libmissing.so").is_none());
    }

    #[test]
    fn mapped_path_by_name() {
        let map = MemoryMap::parse(SAMPLE).unwrap();

        assert_eq!(
            map.mapped_path("libart.so").as_deref(),
            Some("/apex/com.android.art/lib64/libart.so")
        );
        assert_eq!(
            map.mapped_path("/system/lib64/libandroid_runtime.so")
                .as_deref(),
            Some("/system/lib64/libandroid_runtime.so")
        );
        assert!(map.mapped_path("libmissing.so").is_none());
        assert!(map.mapped_path("/system/lib64/libart.so").is_none());
    }

    #[test]
    fn ambiguous_name_is_not_conflated() {
        let text = "\
1000-2000 r--p 00000000 fd:00 1 /system/lib64/libfoo.so
3000-4000 r--p 00000000 fd:00 2 /vendor/lib64/libfoo.so
";
        let map = MemoryMap::parse(text).unwrap();
        assert!(map.mapped_path("libfoo.so").is_none());
        assert!(map.mapped_path("/vendor/lib64/libfoo.so").is_some());
    }

    #[test]
    fn find_and_contains() {
        let map = MemoryMap::parse(SAMPLE).unwrap();
        let entry = map.find(0x7a1c3c0008).unwrap();

        assert!(entry.perms.contains(Permissions::WRITE));
        assert!(entry.contains(0x7a1c3c0008, 8));
        assert!(!entry.contains(0x7a1c3cfffc, 8));
        assert!(!entry.contains(usize::MAX, 8));
        assert!(map.find(0x10).is_none());
    }

    #[test]
    fn invalid_lines() {
        assert!("zzzz-1000 r--p 00000000 fd:00 1".parse::<MapEntry>().is_err());
        assert!("2000-1000 r--p 00000000 fd:00 1".parse::<MapEntry>().is_err());
        assert!("1000-2000 r--q 00000000 fd:00 1".parse::<MapEntry>().is_err());
        assert!("1000-2000 r--p".parse::<MapEntry>().is_err());
    }

    #[test]
    fn current_process() {
        let map = MemoryMap::current().unwrap();
        let probe = &map as *const MemoryMap as usize;

        assert!(!map.entries().is_empty());
        assert!(map.find(probe).is_some());
    }
}
