use std::ops::Range;

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

use crate::{KmemError, KmemResult, PageFrame};

/// Regions are rendered in 4-byte words, so `start` and `size` must be multiples of this.
pub const WORD_SIZE: u64 = 4;

/// Which address space a [`MemoryRegion`] lives in.
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// The virtual address space of the process with this id.
    Virtual(u32),
    /// Physical memory.
    Physical,
}

/// A range of memory requested by the operator.
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    start: u64,
    size: u64,
    kind: RegionKind,
}

impl MemoryRegion {
    /// Creates a region, checking it can be rendered.
    ///
    /// Fails with [`KmemError::InvalidArgument`] if `start` or `size` is not 4-byte aligned, or
    /// if the region would run past the end of the address space.
    pub fn new(start: u64, size: u64, kind: RegionKind) -> KmemResult<MemoryRegion> {
        if start % WORD_SIZE != 0 {
            return Err(KmemError::InvalidArgument("address must be 4-byte aligned".to_string()));
        }
        if size % WORD_SIZE != 0 {
            return Err(KmemError::InvalidArgument("size must be 4-byte aligned".to_string()));
        }
        if start.checked_add(size).is_none() {
            return Err(KmemError::InvalidArgument(format!(
                "region 0x{:x}+0x{:x} overflows the address space",
                start, size
            )));
        }
        Ok(MemoryRegion { start, size, kind })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last byte of the region.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn is_physical(&self) -> bool {
        self.kind == RegionKind::Physical
    }

    /// Computes the page-aligned frames covering this region.
    ///
    /// `page_size` must be a power of two.
    pub fn footprint(&self, page_size: u64) -> FrameFootprint {
        debug_assert!(page_size.is_power_of_two());
        if self.size == 0 {
            let first = self.start / page_size;
            return FrameFootprint {
                frames: first..first,
                page_size,
            };
        }

        let end = self.end();
        let last = end / page_size + u64::from(end % page_size != 0);
        FrameFootprint {
            frames: self.start / page_size..last,
            page_size,
        }
    }
}

/// The ordered frame numbers covering a [`MemoryRegion`].
///
/// The upper bound of the range is exclusive.  A zero-sized region has no frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameFootprint {
    frames: Range<u64>,
    page_size: u64,
}

impl FrameFootprint {
    pub fn frames(&self) -> Range<u64> {
        self.frames.clone()
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn len(&self) -> usize {
        (self.frames.end - self.frames.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> Range<u64> {
        self.frames()
    }

    /// Returns the part of frame `frame_number` that lies inside `region`, as offsets into the
    /// frame.
    ///
    /// Interior frames yield `0..page_size`; the first and last frame may yield less.
    pub fn intersection(&self, region: &MemoryRegion, frame_number: u64) -> Range<usize> {
        let page_start = frame_number * self.page_size;
        // the last page of the address space ends one past u64::MAX
        let page_end = page_start.saturating_add(self.page_size);
        let lo = page_start.max(region.start()).min(page_end);
        let hi = page_end.min(region.end()).max(lo);
        (lo - page_start) as usize..(hi - page_start) as usize
    }
}

impl IntoIterator for &FrameFootprint {
    type Item = u64;
    type IntoIter = Range<u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames()
    }
}

/// Stitches `region` together out of whole-page reads.
///
/// `frames` must be the region's footprint, in order, each holding exactly `page_size` bytes.
/// The result is always `region.size()` bytes long.
pub fn assemble_region(region: &MemoryRegion, frames: &[PageFrame], page_size: u64) -> KmemResult<Vec<u8>> {
    let footprint = region.footprint(page_size);
    if frames.len() != footprint.len() {
        return Err(build_internal_error!(format!(
            "{} frames fetched for a footprint of {}",
            frames.len(),
            footprint.len()
        )));
    }

    let mut data = Vec::with_capacity(region.size() as usize);
    for (frame_number, frame) in footprint.iter().zip(frames) {
        if frame.frame_number != frame_number || frame.page_size() != page_size {
            return Err(build_internal_error!(format!(
                "frame 0x{:x} ({} bytes) fetched where frame 0x{:x} was expected",
                frame.frame_number,
                frame.page_size(),
                frame_number
            )));
        }
        data.extend_from_slice(&frame.contents[footprint.intersection(region, frame_number)]);
    }

    debug_assert_eq!(data.len() as u64, region.size());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    const PAGE_SIZE: u64 = 4096;

    fn frames_for(region: &MemoryRegion) -> Vec<PageFrame> {
        region
            .footprint(PAGE_SIZE)
            .iter()
            .map(|pfn| {
                let contents = (0..PAGE_SIZE).map(|i| ((pfn * PAGE_SIZE + i) % 251) as u8).collect();
                PageFrame::new(pfn, contents)
            })
            .collect()
    }

    #[test]
    fn test_alignment() {
        let err = MemoryRegion::new(0x2002, 0x20, RegionKind::Physical).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.to_string(), "address must be 4-byte aligned");

        let err = MemoryRegion::new(0x2000, 0x21, RegionKind::Virtual(1)).unwrap_err();
        assert_eq!(err.to_string(), "size must be 4-byte aligned");

        let err = MemoryRegion::new(u64::MAX - 3, 0x8, RegionKind::Physical).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        assert!(MemoryRegion::new(u64::MAX - 7, 0x4, RegionKind::Physical).is_ok());
    }

    #[test]
    fn test_footprint() {
        let region = MemoryRegion::new(0x2000, 0x20, RegionKind::Virtual(1)).unwrap();
        assert_eq!(region.footprint(PAGE_SIZE).frames(), 2..3);

        let region = MemoryRegion::new(0x1ff0, 0x20, RegionKind::Virtual(1)).unwrap();
        let footprint = region.footprint(PAGE_SIZE);
        assert_eq!(footprint.iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(footprint.intersection(&region, 1), 0xff0..0x1000);
        assert_eq!(footprint.intersection(&region, 2), 0..0x10);

        let region = MemoryRegion::new(0x1000, 0x3000, RegionKind::Physical).unwrap();
        let footprint = region.footprint(PAGE_SIZE);
        assert_eq!(footprint.len(), 3);
        for pfn in &footprint {
            assert_eq!(footprint.intersection(&region, pfn), 0..PAGE_SIZE as usize);
        }

        let region = MemoryRegion::new(0x2004, 0, RegionKind::Physical).unwrap();
        assert!(region.footprint(PAGE_SIZE).is_empty());

        let region = MemoryRegion::new(u64::MAX - 7, 4, RegionKind::Physical).unwrap();
        let footprint = region.footprint(PAGE_SIZE);
        assert_eq!(footprint.len(), 1);
        assert_eq!(footprint.intersection(&region, u64::MAX / PAGE_SIZE), 4088..4092);
    }

    #[test]
    fn test_footprint_covers_span() {
        for &(start, size) in &[(0u64, 4u64), (0xffc, 8), (0x1234, 0x5678), (0x3000, 0x1000), (0x3ffc, 0x1004)] {
            let region = MemoryRegion::new(start, size, RegionKind::Physical).unwrap();
            let footprint = region.footprint(PAGE_SIZE);
            let first_byte = start / PAGE_SIZE * PAGE_SIZE;
            let expected = (start + size - first_byte + PAGE_SIZE - 1) / PAGE_SIZE;
            assert_eq!(footprint.len() as u64, expected, "start 0x{:x} size 0x{:x}", start, size);

            let covered: usize = footprint.iter().map(|pfn| footprint.intersection(&region, pfn).len()).sum();
            assert_eq!(covered as u64, size);
        }
    }

    #[test]
    fn test_assemble() {
        for &(start, size) in &[(0x1ff0u64, 0x20u64), (0x2000, 0x20), (0x0ffc, 0x2008), (0x5000, 0)] {
            let region = MemoryRegion::new(start, size, RegionKind::Physical).unwrap();
            let frames = frames_for(&region);
            let data = assemble_region(&region, &frames, PAGE_SIZE).unwrap();
            assert_eq!(data.len() as u64, size);
            for (i, byte) in data.iter().enumerate() {
                assert_eq!(*byte, ((start + i as u64) % 251) as u8);
            }
        }
    }

    #[test]
    fn test_assemble_rejects_wrong_frames() {
        let region = MemoryRegion::new(0x1ff0, 0x20, RegionKind::Physical).unwrap();
        let mut frames = frames_for(&region);
        frames.swap(0, 1);
        let err = assemble_region(&region, &frames, PAGE_SIZE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        frames.pop();
        assert!(assemble_region(&region, &frames, PAGE_SIZE).is_err());
    }

    #[cfg(feature = "serde1")]
    #[test]
    fn test_serde() {
        let region = MemoryRegion::new(0x2000, 0x20, RegionKind::Virtual(7)).unwrap();
        let json = serde_json::to_string(&region).unwrap();
        assert_eq!(json, r#"{"start":8192,"size":32,"kind":{"Virtual":7}}"#);
        let back: MemoryRegion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, region);

        let json = serde_json::to_string(&RegionKind::Physical).unwrap();
        assert_eq!(json, r#""Physical""#);
    }
}
