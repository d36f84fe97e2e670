use bitflags::bitflags;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

use crate::{split_into_num, KmemResult, PageProtection};

bitflags! {
    /// The permissions of a memory mapping, as shown in the `perms` column of `/proc/<pid>/maps`.
    #[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct MMPermissions: u8 {
        /// No permissions
        const NONE = 0;
        /// Read permission
        const READ = 1 << 0;
        /// Write permission
        const WRITE = 1 << 1;
        /// Execute permission
        const EXECUTE = 1 << 2;
        /// Memory is shared with another process.
        ///
        /// Mutually exclusive with PRIVATE.
        const SHARED = 1 << 3;
        /// Memory is private (and copy-on-write)
        ///
        /// Mutually exclusive with SHARED.
        const PRIVATE = 1 << 4;
    }
}

impl MMPermissions {
    fn from_ascii_char(b: u8) -> Self {
        match b {
            b'r' => Self::READ,
            b'w' => Self::WRITE,
            b'x' => Self::EXECUTE,
            b's' => Self::SHARED,
            b'p' => Self::PRIVATE,
            _ => Self::NONE,
        }
    }

    /// The page protection the kernel gives pages of a mapping with these permissions.
    pub fn page_protection(&self) -> PageProtection {
        PageProtection::from_access(
            self.contains(Self::READ),
            self.contains(Self::WRITE),
            self.contains(Self::EXECUTE),
            self.contains(Self::SHARED),
        )
    }
}

impl std::str::FromStr for MMPermissions {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Only operate on ASCII (byte) values
        Ok(s.bytes()
            .map(Self::from_ascii_char)
            .fold(Self::default(), std::ops::BitOr::bitor))
    }
}

impl Default for MMPermissions {
    fn default() -> Self {
        Self::NONE
    }
}

/// What backs a memory mapping.
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MMapPath {
    /// The file that is backing the mapping.
    Path(PathBuf),
    /// The process's heap.
    Heap,
    /// The initial process's (also known as the main thread's) stack.
    Stack,
    /// The virtual dynamically linked shared object.
    Vdso,
    /// Shared kernel variables
    Vvar,
    /// obsolete virtual syscalls, succeeded by vdso
    Vsyscall,
    /// An anonymous mapping as obtained via mmap(2).
    Anonymous,
    /// Some other pseudo-path
    Other(String),
}

impl MMapPath {
    fn from(path: &str) -> MMapPath {
        match path.trim() {
            "" => MMapPath::Anonymous,
            "[heap]" => MMapPath::Heap,
            "[stack]" => MMapPath::Stack,
            "[vdso]" => MMapPath::Vdso,
            "[vvar]" => MMapPath::Vvar,
            "[vsyscall]" => MMapPath::Vsyscall,
            x if x.starts_with('[') && x.ends_with(']') => MMapPath::Other(x[1..x.len() - 1].to_string()),
            x => MMapPath::Path(PathBuf::from(x)),
        }
    }
}

/// Represents an entry in a `/proc/<pid>/maps` file.
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryMap {
    /// The address space in the process that the mapping occupies.
    pub address: (u64, u64),
    pub perms: MMPermissions,
    /// The offset into the file/whatever
    pub offset: u64,
    /// The device (major, minor)
    pub dev: (i32, i32),
    /// The inode on that device
    ///
    /// 0 indicates that no inode is associated with the memory region, as would be the case with
    /// BSS (uninitialized data).
    pub inode: u64,
    pub pathname: MMapPath,
}

impl MemoryMap {
    fn from_line(line: &str) -> KmemResult<MemoryMap> {
        let mut s = line.splitn(6, ' ');
        let address = expect!(s.next());
        let perms = expect!(s.next());
        let offset = expect!(s.next());
        let dev = expect!(s.next());
        let inode = expect!(s.next());
        let path = s.next().unwrap_or("");

        Ok(MemoryMap {
            address: split_into_num(address, '-', 16)?,
            perms: expect!(perms.parse()),
            offset: from_str!(u64, offset, 16),
            dev: split_into_num(dev, ':', 16)?,
            inode: from_str!(u64, inode),
            pathname: MMapPath::from(path),
        })
    }

    /// Whether the byte address `address` lies inside this mapping.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address.0 && address < self.address.1
    }
}

/// The memory mappings of a process, as read from `/proc/<pid>/maps`.
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMaps(pub Vec<MemoryMap>);

impl MemoryMaps {
    /// Parses the contents of a `maps` file.
    pub fn from_read<R: Read>(r: R) -> KmemResult<MemoryMaps> {
        let reader = BufReader::new(r);
        let mut maps = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            maps.push(MemoryMap::from_line(&line)?);
        }
        Ok(MemoryMaps(maps))
    }

    /// Finds the mapping covering the byte address `address`.
    pub fn find(&self, address: u64) -> Option<&MemoryMap> {
        self.0.iter().find(|map| map.contains(address))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MemoryMap> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a MemoryMaps {
    type IntoIter = std::slice::Iter<'a, MemoryMap>;
    type Item = &'a MemoryMap;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = r#"55d3c1a00000-55d3c1a28000 r--p 00000000 08:02 173521                     /usr/bin/bash
55d3c1a28000-55d3c1b17000 r-xp 00028000 08:02 173521                     /usr/bin/bash
55d3c2c5e000-55d3c2e02000 rw-p 00000000 00:00 0                          [heap]
7f3e9a000000-7f3e9a021000 rw-s 00000000 00:05 32769                      /SYSV00000000 (deleted)
7ffc6a8e7000-7ffc6a908000 rw-p 00000000 00:00 0                          [stack]
7ffc6a9d8000-7ffc6a9dc000 r--p 00000000 00:00 0                          [vvar]
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0                  [vsyscall]
"#;

    #[test]
    fn test_parse_maps() {
        let maps = MemoryMaps::from_read(MAPS.as_bytes()).unwrap();
        assert_eq!(maps.len(), 7);

        let text = &maps.0[1];
        assert_eq!(text.address, (0x55d3c1a28000, 0x55d3c1b17000));
        assert_eq!(text.perms, MMPermissions::READ | MMPermissions::EXECUTE | MMPermissions::PRIVATE);
        assert_eq!(text.offset, 0x28000);
        assert_eq!(text.dev, (8, 2));
        assert_eq!(text.inode, 173521);
        assert_eq!(text.pathname, MMapPath::Path(PathBuf::from("/usr/bin/bash")));

        assert_eq!(maps.0[2].pathname, MMapPath::Heap);
        assert_eq!(maps.0[4].pathname, MMapPath::Stack);
        assert_eq!(maps.0[6].pathname, MMapPath::Vsyscall);
        assert_eq!(maps.0[6].perms, MMPermissions::EXECUTE | MMPermissions::PRIVATE);
    }

    #[test]
    fn test_find_and_protection() {
        let maps = MemoryMaps::from_read(MAPS.as_bytes()).unwrap();

        let heap = maps.find(0x55d3c2c5f010).unwrap();
        assert_eq!(heap.pathname, MMapPath::Heap);
        assert!(!heap.perms.page_protection().contains(PageProtection::RW));

        let shm = maps.find(0x7f3e9a000000).unwrap();
        assert!(shm.perms.page_protection().contains(PageProtection::RW));

        assert!(maps.find(0x55d3c1b17000).is_none());
        assert!(maps.find(0x1000).is_none());
    }

    #[test]
    fn test_empty_maps() {
        let maps = MemoryMaps::from_read("".as_bytes()).unwrap();
        assert!(maps.is_empty());
    }
}
