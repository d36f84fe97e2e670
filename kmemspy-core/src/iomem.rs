#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read};
use std::ops::Range;

use crate::{split_into_num, KmemResult};

/// The name of the `/proc/iomem` entries that describe usable RAM.
pub const SYSTEM_RAM: &str = "System RAM";

/// One entry of `/proc/iomem`.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
pub struct PhysicalMemoryMap {
    /// The physical address range, both ends inclusive.
    pub address: (u64, u64),
    pub name: String,
}

impl PhysicalMemoryMap {
    fn from_line(line: &str) -> KmemResult<(usize, PhysicalMemoryMap)> {
        let indent = line.chars().take_while(|c| *c == ' ').count() / 2;
        let line = line.trim();
        let mut s = line.split(" : ");
        let address = expect!(s.next());
        let name = expect!(s.next());

        Ok((
            indent,
            PhysicalMemoryMap {
                address: split_into_num(address, '-', 16)?,
                name: String::from(name),
            },
        ))
    }

    /// Get the range of frames lying wholly inside the mapping, for pages of `page_size` bytes.
    ///
    /// The start is included, the end is excluded.  Partial frames at either end are left out.
    pub fn frame_range(&self, page_size: u64) -> Range<u64> {
        let start = match self.address.0.checked_add(page_size - 1) {
            Some(end_of_first) => end_of_first / page_size,
            None => u64::MAX,
        };
        let end = self.address.1.saturating_add(1) / page_size;
        start..end
    }

    pub fn is_ram(&self) -> bool {
        self.name == SYSTEM_RAM
    }
}

/// The physical memory map in `/proc/iomem`, with the nesting depth of each entry.
///
/// Requires root, otherwise every address reads as zero.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
pub struct Iomem(pub Vec<(usize, PhysicalMemoryMap)>);

impl Iomem {
    pub fn from_read<R: Read>(r: R) -> KmemResult<Iomem> {
        let reader = BufReader::new(r);
        let mut vec = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            vec.push(PhysicalMemoryMap::from_line(&line)?);
        }

        Ok(Iomem(vec))
    }

    /// Whether frame `pfn` lies entirely inside a top-level `System RAM` entry.
    pub fn is_ram_frame(&self, pfn: u64, page_size: u64) -> bool {
        self.0
            .iter()
            .filter(|(depth, map)| *depth == 0 && map.is_ram())
            .any(|(_, map)| map.frame_range(page_size).contains(&pfn))
    }

    /// Iterates over the top-level `System RAM` entries.
    pub fn ram(&self) -> impl Iterator<Item = &PhysicalMemoryMap> {
        self.0.iter().filter(|(depth, map)| *depth == 0 && map.is_ram()).map(|(_, map)| map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IOMEM: &str = "00000000-00000fff : Reserved
00001000-0009fbff : System RAM
0009fc00-0009ffff : Reserved
000a0000-000bffff : PCI Bus 0000:00
000f0000-000fffff : System ROM
00100000-bffd9fff : System RAM
  01000000-01e00d90 : Kernel code
  01e00d91-0244f2ff : Kernel data
bffda000-bfffffff : Reserved
fd000000-fdffffff : 0000:00:02.0
  fd000000-fdffffff : bochs-drm
";

    #[test]
    fn test_parse_iomem() {
        let iomem = Iomem::from_read(IOMEM.as_bytes()).unwrap();
        assert_eq!(iomem.0.len(), 11);
        assert_eq!(iomem.0[6].0, 1);
        assert_eq!(iomem.0[6].1.name, "Kernel code");
        assert_eq!(iomem.0[5].1.address, (0x100000, 0xbffd9fff));
        assert_eq!(iomem.ram().count(), 2);
    }

    #[test]
    fn test_frame_range() {
        let iomem = Iomem::from_read(IOMEM.as_bytes()).unwrap();
        // 0x1000..=0x9fbff only covers 0x1000..0x9f000 in whole pages
        assert_eq!(iomem.0[1].1.frame_range(4096), 1..0x9f);
        assert_eq!(iomem.0[5].1.frame_range(4096), 0x100..0xbffda);
    }

    #[test]
    fn test_is_ram_frame() {
        let iomem = Iomem::from_read(IOMEM.as_bytes()).unwrap();
        assert!(!iomem.is_ram_frame(0, 4096));
        assert!(iomem.is_ram_frame(1, 4096));
        assert!(!iomem.is_ram_frame(0x9f, 4096));
        assert!(!iomem.is_ram_frame(0xa0, 4096));
        assert!(iomem.is_ram_frame(0x1000, 4096));
        assert!(iomem.is_ram_frame(0xbffd9, 4096));
        assert!(!iomem.is_ram_frame(0xbffda, 4096));
        assert!(!iomem.is_ram_frame(0xfd000, 4096));
    }

    #[test]
    fn test_unaligned_ram_start() {
        let iomem = Iomem::from_read(
            "00100000-001007ff : Reserved\n00100800-00200fff : System RAM\n".as_bytes(),
        )
        .unwrap();
        assert_eq!(iomem.0[1].1.frame_range(4096), 0x101..0x201);
        // half of 0x100 is reserved
        assert!(!iomem.is_ram_frame(0x100, 4096));
        assert!(iomem.is_ram_frame(0x101, 4096));
        assert!(iomem.is_ram_frame(0x200, 4096));
        assert!(!iomem.is_ram_frame(0x201, 4096));

        let top = PhysicalMemoryMap {
            address: (u64::MAX - 0x7ff, u64::MAX),
            name: SYSTEM_RAM.to_string(),
        };
        assert!(top.frame_range(4096).is_empty());
    }
}
