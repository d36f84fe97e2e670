use byteorder::{ByteOrder, NativeEndian};
use std::fmt;
use std::io;

use crate::{KmemResult, MemoryRegion, TranslationEntry, WORD_SIZE};

/// Bytes per rendered row.
pub const ROW_SIZE: u64 = 16;

/// An annotated hex dump of an assembled region.
///
/// Rows are [`ROW_SIZE`] bytes, each starting with its absolute address and followed by 4-byte
/// words in host byte order.  In virtual mode, the translation entry of a page is printed before
/// the first row that starts inside that page:
///
/// ```text
/// PTE: 0x8000000012345025
/// 0x2000:       0x464c457f      0x00010102      0x00000000      0x00000000
/// 0x2010:       0x003e0003      0x00000001      0x00001040      0x00000000
/// ```
///
/// Physical dumps never carry translation lines.
pub struct HexDump<'a> {
    region: &'a MemoryRegion,
    page_size: u64,
    data: &'a [u8],
    translations: &'a [TranslationEntry],
}

impl<'a> HexDump<'a> {
    /// Checks that `data` and `translations` match `region` and wraps them up for rendering.
    ///
    /// `translations` holds one entry per frame of the region's footprint for a virtual region,
    /// and must be empty for a physical one.
    pub fn new(
        region: &'a MemoryRegion,
        page_size: u64,
        data: &'a [u8],
        translations: &'a [TranslationEntry],
    ) -> KmemResult<HexDump<'a>> {
        if data.len() as u64 != region.size() {
            return Err(build_internal_error!(format!(
                "{} bytes assembled for a region of 0x{:x} bytes",
                data.len(),
                region.size()
            )));
        }

        let expected = if region.is_physical() {
            0
        } else {
            region.footprint(page_size).len()
        };
        if translations.len() != expected {
            return Err(build_internal_error!(format!(
                "{} translation entries for {} pages",
                translations.len(),
                expected
            )));
        }

        Ok(HexDump {
            region,
            page_size,
            data,
            translations,
        })
    }

    /// Writes the dump to `out`.
    pub fn write_to<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        write!(out, "{}", self)
    }
}

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.region.start();
        let end = self.region.end();
        let first_page = start / self.page_size;
        let mut shown_page = None;

        let mut row_start = start;
        while row_start < end {
            if !self.region.is_physical() {
                let page_idx = (row_start / self.page_size - first_page) as usize;
                if shown_page != Some(page_idx) {
                    shown_page = Some(page_idx);
                    writeln!(f, "PTE: {}", self.translations[page_idx])?;
                }
            }

            write!(f, "0x{:x}: ", row_start)?;

            let columns = (ROW_SIZE / WORD_SIZE).min((end - row_start) / WORD_SIZE);
            let row_offset = (row_start - start) as usize;
            for col in 0..columns as usize {
                let offset = row_offset + col * WORD_SIZE as usize;
                let word = NativeEndian::read_u32(&self.data[offset..offset + WORD_SIZE as usize]);
                write!(f, "      0x{:08x}", word)?;
            }
            writeln!(f)?;

            row_start = match row_start.checked_add(ROW_SIZE) {
                Some(next) => next,
                None => break,
            };
        }

        Ok(())
    }
}

/// Renders `data`, the assembled contents of `region`, to `out`.
///
/// See [`HexDump`] for the format.
pub fn render_hex_dump<W: io::Write>(
    out: &mut W,
    region: &MemoryRegion,
    page_size: u64,
    data: &[u8],
    translations: &[TranslationEntry],
) -> KmemResult<()> {
    let dump = HexDump::new(region, page_size, data, translations)?;
    dump.write_to(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PageProtection, RegionKind};

    const PAGE_SIZE: u64 = 4096;

    fn words(start: u64, size: u64) -> Vec<u8> {
        (0..size / 4)
            .flat_map(|i| ((start + i * 4) as u32).to_ne_bytes())
            .collect()
    }

    fn pte(pfn: u64) -> TranslationEntry {
        TranslationEntry::new(pfn * PAGE_SIZE, PageProtection::from_access(true, true, false, false))
    }

    #[test]
    fn test_single_page_virtual() {
        let region = MemoryRegion::new(0x2000, 0x20, RegionKind::Virtual(42)).unwrap();
        let data = words(0x2000, 0x20);
        let ptes = [pte(0x1234)];
        let dump = HexDump::new(&region, PAGE_SIZE, &data, &ptes).unwrap().to_string();

        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 3, "{}", dump);
        assert_eq!(lines[0], "PTE: 0x8000000001234025");
        assert_eq!(
            lines[1],
            "0x2000:       0x00002000      0x00002004      0x00002008      0x0000200c"
        );
        assert_eq!(
            lines[2],
            "0x2010:       0x00002010      0x00002014      0x00002018      0x0000201c"
        );
    }

    #[test]
    fn test_page_crossing_virtual() {
        let region = MemoryRegion::new(0x1ff0, 0x20, RegionKind::Virtual(42)).unwrap();
        let data = words(0x1ff0, 0x20);
        let ptes = [pte(0x10), pte(0x20)];
        let dump = HexDump::new(&region, PAGE_SIZE, &data, &ptes).unwrap().to_string();

        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 4, "{}", dump);
        assert_eq!(lines[0], format!("PTE: {}", ptes[0]));
        assert!(lines[1].starts_with("0x1ff0: "));
        assert_eq!(lines[2], format!("PTE: {}", ptes[1]));
        assert!(lines[3].starts_with("0x2000: "));
    }

    #[test]
    fn test_partial_last_row() {
        let region = MemoryRegion::new(0x1000, 0x18, RegionKind::Physical).unwrap();
        let data = words(0x1000, 0x18);
        let dump = HexDump::new(&region, PAGE_SIZE, &data, &[]).unwrap().to_string();

        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "0x1010:       0x00001010      0x00001014");
    }

    #[test]
    fn test_physical_has_no_translations() {
        let region = MemoryRegion::new(0x0ff0, 0x3020, RegionKind::Physical).unwrap();
        let data = words(0x0ff0, 0x3020);
        let dump = HexDump::new(&region, PAGE_SIZE, &data, &[]).unwrap().to_string();
        assert!(!dump.contains("PTE"));
        assert_eq!(dump.lines().count(), 0x302);

        let stray = [pte(1)];
        assert!(HexDump::new(&region, PAGE_SIZE, &data, &stray).is_err());
    }

    #[test]
    fn test_unaligned_rows_cross_pages() {
        // rows start at 0xff4, 0x1004, ...: the second page's entry comes before the 0x1004 row
        let region = MemoryRegion::new(0x0ff4, 0x20, RegionKind::Virtual(1)).unwrap();
        let data = words(0x0ff4, 0x20);
        let ptes = [pte(5), pte(6)];
        let dump = HexDump::new(&region, PAGE_SIZE, &data, &ptes).unwrap().to_string();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], format!("PTE: {}", ptes[0]));
        assert!(lines[1].starts_with("0xff4: "));
        assert_eq!(lines[2], format!("PTE: {}", ptes[1]));
        assert!(lines[3].starts_with("0x1004: "));
    }

    #[test]
    fn test_render_to_writer() {
        let region = MemoryRegion::new(0x40, 0x4, RegionKind::Physical).unwrap();
        let mut out = Vec::new();
        render_hex_dump(&mut out, &region, PAGE_SIZE, &[0x78, 0x56, 0x34, 0x12], &[]).unwrap();
        let expected = format!("0x40:       0x{:08x}\n", u32::from_ne_bytes([0x78, 0x56, 0x34, 0x12]));
        assert_eq!(String::from_utf8(out).unwrap(), expected);

        let short = render_hex_dump(&mut Vec::new(), &region, PAGE_SIZE, &[0; 2], &[]);
        assert!(short.is_err());
    }
}
