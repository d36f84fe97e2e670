#[cfg(test)]
mod tests {
    use kmemspy::client::Client;
    use kmemspy::device::PageDevice;
    use kmemspy::host::EmulatedHost;
    use kmemspy::process::MMPermissions;
    use kmemspy::{ErrorKind, KmemError, MemoryRegion, RegionKind};

    const PAGE_SIZE: u64 = 4096;
    const PID: u32 = 42;

    /// Word `i` of frame `pfn` reads as `pfn << 28 | i`.
    fn frame_words(pfn: u64) -> Vec<u8> {
        (0..PAGE_SIZE as u32 / 4)
            .flat_map(|i| (((pfn as u32) << 28) | i).to_ne_bytes())
            .collect()
    }

    /// Eight RAM frames and one device frame.  Pid 42 has frame 6 at 0x1000 and frame 3 at 0x2000.
    fn device() -> PageDevice<EmulatedHost> {
        let host = EmulatedHost::builder()
            .page_size(PAGE_SIZE)
            .ram(8)
            .device(1)
            .build()
            .unwrap();
        for pfn in 0..9 {
            host.write_frame(pfn, 0, &frame_words(pfn)).unwrap();
        }
        host.spawn_process(PID).unwrap();
        host.map(
            PID,
            1,
            MMPermissions::READ | MMPermissions::WRITE | MMPermissions::PRIVATE,
            &[6, 3],
        )
        .unwrap();
        PageDevice::register(host)
    }

    fn dump(device: &PageDevice<EmulatedHost>, start: u64, size: u64, kind: RegionKind) -> String {
        let region = MemoryRegion::new(start, size, kind).unwrap();
        let snapshot = Client::new(device.open()).read_region(&region).unwrap();
        let mut out = Vec::new();
        snapshot.write_hex_dump(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn assert_released(device: &PageDevice<EmulatedHost>) {
        let host = device.service().host();
        assert_eq!(host.pinned_pages(), 0);
        assert_eq!(host.active_mappings(), 0);
        assert!(!host.copied_under_lock());
    }

    #[test]
    fn test_virtual_dump_within_one_page() {
        let device = device();
        let region = MemoryRegion::new(0x2000, 0x20, RegionKind::Virtual(PID)).unwrap();
        let snapshot = Client::new(device.open()).read_region(&region).unwrap();
        assert_eq!(snapshot.translations().len(), 1);
        let pte = snapshot.translations()[0];
        assert_eq!(pte.frame_number(PAGE_SIZE), 3);

        let pte_line = format!("PTE: 0x{:x}", pte.bits());
        let out = dump(&device, 0x2000, 0x20, RegionKind::Virtual(PID));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                pte_line.as_str(),
                "0x2000:       0x30000000      0x30000001      0x30000002      0x30000003",
                "0x2010:       0x30000004      0x30000005      0x30000006      0x30000007",
            ]
        );
        assert_released(&device);
    }

    #[test]
    fn test_virtual_dump_across_pages() {
        let device = device();
        let out = dump(&device, 0x1ff0, 0x20, RegionKind::Virtual(PID));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("PTE: 0x"));
        assert_eq!(
            lines[1],
            "0x1ff0:       0x600003fc      0x600003fd      0x600003fe      0x600003ff"
        );
        assert!(lines[2].starts_with("PTE: 0x"));
        assert_ne!(lines[0], lines[2]);
        assert_eq!(
            lines[3],
            "0x2000:       0x30000000      0x30000001      0x30000002      0x30000003"
        );
        assert_eq!(device.service().host().pins_taken(), 2);
        assert_released(&device);
    }

    #[test]
    fn test_partial_row() {
        let device = device();
        let out = dump(&device, 0x2008, 0xc, RegionKind::Virtual(PID));
        let lines: Vec<&str> = out.lines().collect();
        // a short last row, and nothing past the end
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "0x2008:       0x30000002      0x30000003      0x30000004");
    }

    #[test]
    fn test_physical_dump() {
        let device = device();
        let out = dump(&device, 0x5ff8, 0x10, RegionKind::Physical);
        assert!(!out.contains("PTE"));
        assert_eq!(
            out,
            "0x5ff8:       0x500003fe      0x500003ff      0x60000000      0x60000001\n"
        );
        assert_released(&device);
    }

    #[test]
    fn test_physical_frame_not_ram() {
        let device = device();
        let region = MemoryRegion::new(0x7ff0, 0x20, RegionKind::Physical).unwrap();
        let err = Client::new(device.open()).read_region(&region).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);
        assert!(matches!(err, KmemError::Page { address: 0x8000, physical: true, .. }));

        let region = MemoryRegion::new(0x100_0000, 0x10, RegionKind::Physical).unwrap();
        let err = Client::new(device.open()).read_region(&region).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);
        assert_released(&device);
    }

    #[test]
    fn test_huge_physical_region() {
        let host = EmulatedHost::builder().reserved(1).ram(1).build().unwrap();
        let device = PageDevice::register(host);
        let region = MemoryRegion::new(0, 0xffff_ffff_ffff_0000, RegionKind::Physical).unwrap();
        let err = Client::new(device.open()).read_region(&region).unwrap_err();
        assert!(matches!(err, KmemError::Page { address: 0, physical: true, .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);
        assert_released(&device);
    }

    #[test]
    fn test_virtual_errors() {
        let device = device();

        let region = MemoryRegion::new(0x2000, 0x20, RegionKind::Virtual(PID + 1)).unwrap();
        let err = Client::new(device.open()).read_region(&region).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(device.service().host().pins_taken(), 0);

        let region = MemoryRegion::new(0x2ff0, 0x20, RegionKind::Virtual(PID)).unwrap();
        let err = Client::new(device.open()).read_region(&region).unwrap_err();
        assert!(matches!(err, KmemError::Page { address: 0x3000, physical: false, .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);

        assert_released(&device);
    }

    #[test]
    fn test_misaligned_region() {
        let err = MemoryRegion::new(0x2002, 0x20, RegionKind::Virtual(PID)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = MemoryRegion::new(0x2000, 0x1e, RegionKind::Physical).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_process_exit_between_reads() {
        let device = device();
        assert!(!dump(&device, 0x1000, 0x10, RegionKind::Virtual(PID)).is_empty());

        device.service().host().exit(PID).unwrap();
        let region = MemoryRegion::new(0x1000, 0x10, RegionKind::Virtual(PID)).unwrap();
        let err = Client::new(device.open()).read_region(&region).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_released(&device);
    }

    #[test]
    fn test_concurrent_clients() {
        let device = device();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..25 {
                        let virt = MemoryRegion::new(0x1000, 0x2000, RegionKind::Virtual(PID)).unwrap();
                        let snapshot = Client::new(device.open()).read_region(&virt).unwrap();
                        assert_eq!(&snapshot.data()[..0x1000], &frame_words(6)[..]);
                        assert_eq!(&snapshot.data()[0x1000..], &frame_words(3)[..]);

                        let phys = MemoryRegion::new(0, 0x8000, RegionKind::Physical).unwrap();
                        let snapshot = Client::new(device.open()).read_region(&phys).unwrap();
                        assert_eq!(&snapshot.data()[0x7000..], &frame_words(7)[..]);
                    }
                });
            }
        });
        assert_eq!(device.service().host().pins_taken(), 4 * 25 * 2);
        assert_released(&device);
    }

    /// Our error type can be used with `?` in functions returning `anyhow::Result`
    #[test]
    fn test_anyhow() {
        fn inner(device: &PageDevice<EmulatedHost>, pid: u32) -> anyhow::Result<usize> {
            let region = MemoryRegion::new(0x1000, 0x100, RegionKind::Virtual(pid))?;
            let snapshot = Client::new(device.open()).read_region(&region)?;
            Ok(snapshot.data().len())
        }

        let device = device();
        assert_eq!(inner(&device, PID).unwrap(), 0x100);

        let err = inner(&device, 7).unwrap_err();
        let err = err.downcast::<KmemError>().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
