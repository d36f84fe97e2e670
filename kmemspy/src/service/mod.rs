//! The privileged half of kmemspy: resolves and copies out one page per request.
//!
//! The service keeps no state between requests.  Each virtual lookup takes only the target's
//! memory context read lock, and only while pinning the page; the page contents are copied after
//! the lock is released.  Every pin and frame mapping is a guard, so it is released on every
//! path out of a request.

use log::{debug, warn};

use crate::host::{HostTask, LockedContext, MappedPage, MemoryContext, MemoryHost, PinnedPage, UserMemory};
use crate::protocol::Request;
use crate::{KmemError, KmemResult, PageFrame, PageProtection, TranslationEntry};


/// Serves page reads out of a [`MemoryHost`].
#[derive(Debug)]
pub struct PageService<H> {
    host: H,
}

impl<H: MemoryHost> PageService<H> {
    pub fn new(host: H) -> PageService<H> {
        PageService { host }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn page_size(&self) -> u64 {
        self.host.page_size()
    }

    fn page_address(&self, page_number: u64) -> KmemResult<u64> {
        page_number
            .checked_mul(self.page_size())
            .ok_or(KmemError::InvalidAddress(u64::MAX))
    }

    /// Reads virtual page `vpn` of process `pid`, along with its translation entry.
    ///
    /// The returned frame is numbered by `vpn`.
    ///
    /// # Errors
    ///
    /// * [`KmemError::NotFound`] when there's no such process or it has no memory context.
    /// * [`KmemError::InvalidAddress`] when nothing can be pinned at `vpn`, or the page isn't RAM.
    /// * [`KmemError::IoFault`] when the contents can't be copied.
    pub fn resolve_virtual_page(&self, pid: u32, vpn: u64) -> KmemResult<(PageFrame, TranslationEntry)> {
        let task = self
            .host
            .find_task(pid)?
            .ok_or_else(|| KmemError::NotFound(format!("pid {}", pid)))?;
        let context = task
            .memory_context()?
            .ok_or_else(|| KmemError::NotFound(format!("pid {} has no memory context", pid)))?;
        let address = self.page_address(vpn)?;

        let (pin, protection) = {
            let locked = context.read_lock()?;
            let pin = locked.pin_remote(vpn)?;
            if !self.host.page_is_ram(pin.frame_number())? {
                warn!(
                    "refusing page 0x{:x} of pid {}: frame 0x{:x} is not RAM",
                    address,
                    pid,
                    pin.frame_number()
                );
                return Err(KmemError::InvalidAddress(address));
            }
            let protection = locked.protection(vpn).unwrap_or(PageProtection::NONE);
            (pin, protection)
        };

        let pfn = pin.frame_number();
        let mut contents = vec![0; self.page_size() as usize];
        pin.copy_out(&mut contents)?;
        drop(pin);

        let physical_base = pfn
            .checked_mul(self.page_size())
            .ok_or_else(|| build_internal_error!(format!("frame 0x{:x} is beyond the address space", pfn)))?;
        Ok((PageFrame::new(vpn, contents), TranslationEntry::new(physical_base, protection)))
    }

    /// Reads physical frame `pfn`.
    ///
    /// # Errors
    ///
    /// * [`KmemError::InvalidAddress`] when `pfn` is out of range or isn't RAM.
    /// * [`KmemError::IoFault`] when the contents can't be copied.
    pub fn resolve_physical_frame(&self, pfn: u64) -> KmemResult<PageFrame> {
        let address = self.page_address(pfn)?;
        if pfn > self.host.max_frame() {
            return Err(KmemError::InvalidAddress(address));
        }
        if !self.host.page_is_ram(pfn)? {
            warn!("refusing physical frame 0x{:x}: not RAM", pfn);
            return Err(KmemError::InvalidAddress(address));
        }

        let mut contents = vec![0; self.page_size() as usize];
        let mapping = self.host.map_frame(pfn)?;
        let copied = mapping.copy_out(&mut contents);
        drop(mapping);
        copied?;

        Ok(PageFrame::new(pfn, contents))
    }

    /// Copies virtual page `vpn` of `pid` to `data_buf` in `user`, and returns its translation
    /// entry.
    pub fn read_virtual_page<U: UserMemory + ?Sized>(
        &self,
        pid: u32,
        vpn: u64,
        data_buf: u64,
        user: &mut U,
    ) -> KmemResult<TranslationEntry> {
        let (frame, pte) = self.resolve_virtual_page(pid, vpn)?;
        user.copy_to_user(data_buf, &frame.contents)?;
        Ok(pte)
    }

    /// Copies physical frame `pfn` to `data_buf` in `user`.
    pub fn read_physical_frame<U: UserMemory + ?Sized>(&self, pfn: u64, data_buf: u64, user: &mut U) -> KmemResult<()> {
        let frame = self.resolve_physical_frame(pfn)?;
        user.copy_to_user(data_buf, &frame.contents)
    }

    /// Serves `request`, filling in the fields the service writes back.
    pub fn handle<U: UserMemory + ?Sized>(&self, request: &mut Request, user: &mut U) -> KmemResult<()> {
        debug!("{:?}", request);
        match request {
            Request::ReadVirtualPage(args) => {
                args.pte = self.read_virtual_page(args.pid, args.pfn_virt, args.data_buf, user)?.bits();
            }
            Request::ReadPhysicalFrame(args) => {
                self.read_physical_frame(args.pfn_phys, args.data_buf, user)?;
            }
        }
        Ok(())
    }
}
