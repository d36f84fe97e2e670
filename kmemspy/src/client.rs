//! The unprivileged half of kmemspy: reads a byte range a page at a time.
//!
//! A [`Client`] computes the footprint of a [`MemoryRegion`], fetches its frames one by one in
//! increasing order, and assembles the exact range out of them.  The first failed fetch aborts
//! the read, so a [`RegionSnapshot`] is always complete.

use log::debug;
use std::io;

use crate::channel::ControlChannel;
use crate::protocol::Request;
use crate::{assemble_region, HexDump, KmemResult, MemoryRegion, PageFrame, RegionKind, TranslationEntry};

/// Reads regions of memory through a [`ControlChannel`].
#[derive(Debug)]
pub struct Client<C> {
    channel: C,
}

impl<C: ControlChannel> Client<C> {
    pub fn new(channel: C) -> Client<C> {
        Client { channel }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_inner(self) -> C {
        self.channel
    }

    pub fn page_size(&self) -> u64 {
        self.channel.page_size()
    }

    /// Fetches one page: virtual page `frame_number` of the process for a virtual `kind`, or
    /// physical frame `frame_number`.
    ///
    /// The translation entry is only returned for virtual pages.  Errors are wrapped in
    /// [`KmemError::Page`](crate::KmemError::Page).
    pub fn fetch_frame(
        &mut self,
        frame_number: u64,
        kind: RegionKind,
    ) -> KmemResult<(PageFrame, Option<TranslationEntry>)> {
        let page_size = self.page_size();
        let (mut request, physical) = match kind {
            RegionKind::Virtual(pid) => (Request::virtual_page(pid, frame_number), false),
            RegionKind::Physical => (Request::physical_frame(frame_number), true),
        };

        debug!(
            "fetching {} page 0x{:x}",
            if physical { "physical" } else { "virtual" },
            frame_number
        );
        let mut contents = vec![0; page_size as usize];
        self.channel
            .transact(&mut request, &mut contents)
            .map_err(|e| e.at_page(frame_number.saturating_mul(page_size), physical))?;

        Ok((PageFrame::new(frame_number, contents), request.translation_entry()))
    }

    /// Reads all of `region`.
    pub fn read_region(&mut self, region: &MemoryRegion) -> KmemResult<RegionSnapshot> {
        let page_size = self.page_size();
        let footprint = region.footprint(page_size);
        debug!(
            "reading 0x{:x} bytes at 0x{:x}: {} pages",
            region.size(),
            region.start(),
            footprint.len()
        );

        // not preallocated: the footprint of a valid region can be far larger than memory
        let mut frames = Vec::new();
        let mut translations = Vec::new();
        for frame_number in &footprint {
            let (frame, pte) = self.fetch_frame(frame_number, region.kind())?;
            frames.push(frame);
            translations.extend(pte);
        }

        let data = assemble_region(region, &frames, page_size)?;
        Ok(RegionSnapshot {
            region: *region,
            page_size,
            data,
            translations,
        })
    }
}

/// The contents of a region, along with the translation entry of each of its pages for a
/// virtual region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSnapshot {
    region: MemoryRegion,
    page_size: u64,
    data: Vec<u8>,
    translations: Vec<TranslationEntry>,
}

impl RegionSnapshot {
    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Exactly `region().size()` bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// One entry per page of the footprint, in order.  Empty for physical regions.
    pub fn translations(&self) -> &[TranslationEntry] {
        &self.translations
    }

    pub fn hex_dump(&self) -> KmemResult<HexDump<'_>> {
        HexDump::new(&self.region, self.page_size, &self.data, &self.translations)
    }

    /// Renders the snapshot to `out`.
    pub fn write_hex_dump<W: io::Write>(&self, out: &mut W) -> KmemResult<()> {
        self.hex_dump()?.write_to(out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, KmemError};

    /// Serves every page as its own frame number, repeated, and fails on pages in `bad`.
    struct FakeChannel {
        page_size: u64,
        bad: Vec<u64>,
        requests: Vec<Request>,
    }

    impl FakeChannel {
        fn new(page_size: u64) -> FakeChannel {
            FakeChannel {
                page_size,
                bad: Vec::new(),
                requests: Vec::new(),
            }
        }
    }

    impl ControlChannel for FakeChannel {
        fn page_size(&self) -> u64 {
            self.page_size
        }

        fn transact(&mut self, request: &mut Request, data: &mut [u8]) -> KmemResult<()> {
            self.requests.push(*request);
            let page = request.page_number();
            if self.bad.contains(&page) {
                return Err(KmemError::InvalidAddress(page * self.page_size));
            }
            data.fill(page as u8);
            if let Request::ReadVirtualPage(args) = request {
                args.pte = (0x100000 + page * self.page_size) | 0x25;
            }
            Ok(())
        }
    }

    #[test]
    fn test_read_virtual_region() {
        let mut client = Client::new(FakeChannel::new(4096));
        let region = MemoryRegion::new(0x1ff0, 0x20, RegionKind::Virtual(77)).unwrap();
        let snapshot = client.read_region(&region).unwrap();

        assert_eq!(snapshot.data().len(), 0x20);
        assert!(snapshot.data()[..0x10].iter().all(|b| *b == 1));
        assert!(snapshot.data()[0x10..].iter().all(|b| *b == 2));
        assert_eq!(snapshot.translations().len(), 2);
        assert_eq!(snapshot.translations()[1].bits(), 0x102025);

        let requests = &client.channel().requests;
        assert_eq!(
            requests.iter().map(|r| r.page_number()).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(requests.iter().all(|r| matches!(r, Request::ReadVirtualPage(args) if args.pid == 77)));

        let dump = snapshot.hex_dump().unwrap().to_string();
        assert_eq!(dump.lines().filter(|l| l.starts_with("PTE: ")).count(), 2);
    }

    #[test]
    fn test_read_physical_region() {
        let mut client = Client::new(FakeChannel::new(4096));
        let region = MemoryRegion::new(0x3000, 0x1000, RegionKind::Physical).unwrap();
        let snapshot = client.read_region(&region).unwrap();
        assert!(snapshot.translations().is_empty());
        assert!(snapshot.data().iter().all(|b| *b == 3));

        let mut out = Vec::new();
        snapshot.write_hex_dump(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.lines().count(), 0x100);
        assert!(!out.contains("PTE"));
    }

    #[test]
    fn test_zero_sized_region() {
        let mut client = Client::new(FakeChannel::new(4096));
        let region = MemoryRegion::new(0x3000, 0, RegionKind::Virtual(1)).unwrap();
        let snapshot = client.read_region(&region).unwrap();
        assert!(snapshot.data().is_empty());
        assert!(client.channel().requests.is_empty());
        assert_eq!(snapshot.hex_dump().unwrap().to_string(), "");
    }

    #[test]
    fn test_first_error_aborts() {
        let mut channel = FakeChannel::new(4096);
        channel.bad.push(5);
        let mut client = Client::new(channel);
        let region = MemoryRegion::new(0x4000, 0x3000, RegionKind::Virtual(1)).unwrap();

        let err = client.read_region(&region).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);
        assert!(matches!(err, KmemError::Page { address: 0x5000, physical: false, .. }));
        assert_eq!(
            err.to_string(),
            "failed to read virtual page at 0x5000: invalid address 0x5000"
        );
        // no retries, and nothing after the failed page
        assert_eq!(client.into_inner().requests.len(), 2);
    }

    #[test]
    fn test_huge_region_fails_on_first_page() {
        let mut channel = FakeChannel::new(4096);
        channel.bad.push(0);
        let mut client = Client::new(channel);
        let region = MemoryRegion::new(0, 0xffff_ffff_ffff_0000, RegionKind::Physical).unwrap();

        let err = client.read_region(&region).unwrap_err();
        assert!(matches!(err, KmemError::Page { address: 0, physical: true, .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);
        assert_eq!(client.into_inner().requests.len(), 1);
    }
}
