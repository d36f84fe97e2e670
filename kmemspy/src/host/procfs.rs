use log::debug;
use parking_lot::{RwLock, RwLockReadGuard};
use rustix::fd::OwnedFd;
use rustix::fs::{Mode, OFlags};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{HostTask, LockedContext, MappedPage, MemoryContext, MemoryHost, PinnedPage};
use crate::process::{MemoryMaps, PageInfo, PAGEMAP_ENTRY_SIZE};
use crate::{FileWrapper, Iomem, KmemError, KmemResult, PageProtection};

/// Where procfs is usually mounted.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// The character device exposing physical memory.
pub const DEFAULT_MEM_DEVICE: &str = "/dev/mem";

/// Resolves pages of the running Linux system.
///
/// * Tasks are the `/proc/<pid>` directories.  A task whose `maps` file is empty (a kernel thread,
///   or a zombie) has no memory context.
/// * Pinning a virtual page faults it in with a one byte read through `/proc/<pid>/mem`, then
///   looks the backing frame up in `/proc/<pid>/pagemap`.  Contents are read through `mem` too.
/// * Protections are synthesized from the permissions in `maps`.
/// * The RAM check uses the top level `System RAM` entries of `/proc/iomem`.
/// * Physical frames are read through `/dev/mem`.
///
/// Frame numbers and `/proc/iomem` addresses read as zero without `CAP_SYS_ADMIN`, so this host
/// can only serve pages when running as root.
#[derive(Debug, Clone)]
pub struct ProcfsHost {
    proc_root: PathBuf,
    mem_device: PathBuf,
    page_size: u64,
    max_frame: u64,
}

impl ProcfsHost {
    /// A host using `/proc` and `/dev/mem`.
    pub fn new() -> KmemResult<ProcfsHost> {
        Self::with_paths(DEFAULT_PROC_ROOT, DEFAULT_MEM_DEVICE)
    }

    /// A host using procfs mounted at `proc_root` and the memory device at `mem_device`.
    pub fn with_paths<P: Into<PathBuf>, Q: Into<PathBuf>>(proc_root: P, mem_device: Q) -> KmemResult<ProcfsHost> {
        let mut host = ProcfsHost {
            proc_root: proc_root.into(),
            mem_device: mem_device.into(),
            page_size: crate::page_size(),
            max_frame: 0,
        };
        host.max_frame = host
            .iomem()?
            .0
            .iter()
            .filter(|(depth, _)| *depth == 0)
            .map(|(_, map)| map.address.1 / host.page_size)
            .max()
            .unwrap_or(0);
        Ok(host)
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    pub fn mem_device(&self) -> &Path {
        &self.mem_device
    }

    /// Reads and parses `/proc/iomem`.
    pub fn iomem(&self) -> KmemResult<Iomem> {
        Iomem::from_read(FileWrapper::open(self.proc_root.join("iomem"))?)
    }
}

impl MemoryHost for ProcfsHost {
    type Task = ProcfsTask;
    type Mapping = ProcfsMapping;

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn max_frame(&self) -> u64 {
        self.max_frame
    }

    fn find_task(&self, pid: u32) -> KmemResult<Option<ProcfsTask>> {
        let root = self.proc_root.join(pid.to_string());
        let flags = OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC;
        match wrap_io_error!(root, rustix::fs::openat(rustix::fs::CWD, &root, flags, Mode::empty())) {
            Ok(fd) => Ok(Some(ProcfsTask {
                fd,
                root,
                page_size: self.page_size,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn page_is_ram(&self, pfn: u64) -> KmemResult<bool> {
        Ok(self.iomem()?.is_ram_frame(pfn, self.page_size))
    }

    fn map_frame(&self, pfn: u64) -> KmemResult<ProcfsMapping> {
        let offset = pfn
            .checked_mul(self.page_size)
            .ok_or(KmemError::InvalidAddress(u64::MAX))?;
        let file = FileWrapper::open(&self.mem_device)?;
        Ok(ProcfsMapping { file, offset })
    }
}

/// A `/proc/<pid>` directory.
#[derive(Debug)]
pub struct ProcfsTask {
    fd: OwnedFd,
    root: PathBuf,
    page_size: u64,
}

impl ProcfsTask {
    fn open(&self, name: &str) -> KmemResult<Option<FileWrapper>> {
        match FileWrapper::open_at(&self.root, &self.fd, name) {
            Ok(file) => Ok(Some(file)),
            // the process went away after we found it
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl HostTask for ProcfsTask {
    type Context = ProcfsContext;

    fn memory_context(&self) -> KmemResult<Option<ProcfsContext>> {
        let maps = match self.open("maps")? {
            Some(file) => MemoryMaps::from_read(file)?,
            None => return Ok(None),
        };
        if maps.is_empty() {
            return Ok(None);
        }
        let (pagemap, mem) = match (self.open("pagemap")?, self.open("mem")?) {
            (Some(pagemap), Some(mem)) => (pagemap, mem),
            _ => return Ok(None),
        };
        Ok(Some(ProcfsContext {
            maps: RwLock::new(maps),
            pagemap,
            mem: Arc::new(mem),
            page_size: self.page_size,
        }))
    }
}

/// The address space of a [`ProcfsTask`], as seen through its `maps`, `pagemap` and `mem` files.
///
/// The mappings are a snapshot taken when the context was created.
#[derive(Debug)]
pub struct ProcfsContext {
    maps: RwLock<MemoryMaps>,
    pagemap: FileWrapper,
    mem: Arc<FileWrapper>,
    page_size: u64,
}

impl MemoryContext for ProcfsContext {
    type Locked<'a> = ProcfsLockedContext<'a>;

    fn read_lock(&self) -> KmemResult<ProcfsLockedContext<'_>> {
        Ok(ProcfsLockedContext {
            context: self,
            maps: self.maps.read(),
        })
    }
}

pub struct ProcfsLockedContext<'a> {
    context: &'a ProcfsContext,
    maps: RwLockReadGuard<'a, MemoryMaps>,
}

impl LockedContext for ProcfsLockedContext<'_> {
    type Pin = ProcfsPin;

    fn pin_remote(&self, vpn: u64) -> KmemResult<ProcfsPin> {
        let context = self.context;
        let address = vpn
            .checked_mul(context.page_size)
            .ok_or(KmemError::InvalidAddress(u64::MAX))?;
        if self.maps.find(address).is_none() {
            return Err(KmemError::InvalidAddress(address));
        }

        let mut probe = [0u8; 1];
        if let Err(e) = context.mem.read_exact_at(&mut probe, address) {
            debug!("couldn't fault in 0x{:x}: {}", address, e);
            return Err(KmemError::InvalidAddress(address));
        }

        let mut entry = [0u8; PAGEMAP_ENTRY_SIZE];
        let entry_offset = vpn
            .checked_mul(PAGEMAP_ENTRY_SIZE as u64)
            .ok_or(KmemError::InvalidAddress(address))?;
        context.pagemap.read_exact_at(&mut entry, entry_offset)?;
        let info = PageInfo::parse_info(u64::from_ne_bytes(entry));
        let pfn = info.present_frame().ok_or(KmemError::InvalidAddress(address))?;

        Ok(ProcfsPin {
            mem: Arc::clone(&context.mem),
            address,
            pfn,
        })
    }

    fn protection(&self, vpn: u64) -> Option<PageProtection> {
        let address = vpn.checked_mul(self.context.page_size)?;
        self.maps.find(address).map(|map| map.perms.page_protection())
    }
}

/// A faulted-in page of a [`ProcfsContext`].
///
/// User space can't take a real page reference, so the page stays resident only as long as the
/// kernel leaves it be.
#[derive(Debug)]
pub struct ProcfsPin {
    mem: Arc<FileWrapper>,
    address: u64,
    pfn: u64,
}

impl MappedPage for ProcfsPin {
    fn copy_out(&self, dst: &mut [u8]) -> KmemResult<()> {
        self.mem.read_exact_at(dst, self.address).map_err(|e| {
            KmemError::IoFault(format!(
                "reading 0x{:x} from {}: {}",
                self.address,
                self.mem.path().display(),
                e
            ))
        })
    }
}

impl PinnedPage for ProcfsPin {
    fn frame_number(&self) -> u64 {
        self.pfn
    }
}

/// One frame of `/dev/mem`, open until dropped.
#[derive(Debug)]
pub struct ProcfsMapping {
    file: FileWrapper,
    offset: u64,
}

impl MappedPage for ProcfsMapping {
    fn copy_out(&self, dst: &mut [u8]) -> KmemResult<()> {
        self.file.read_exact_at(dst, self.offset).map_err(|e| {
            KmemError::IoFault(format!(
                "reading 0x{:x} from {}: {}",
                self.offset,
                self.file.path().display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn my_pid() -> u32 {
        std::process::id()
    }

    #[test]
    fn test_find_task() {
        let host = ProcfsHost::new().unwrap();
        assert!(host.page_size().is_power_of_two());
        assert!(host.find_task(my_pid()).unwrap().is_some());
        assert!(host.find_task(u32::MAX).unwrap().is_none());
    }

    #[test]
    fn test_pin_own_page() {
        let host = ProcfsHost::new().unwrap();
        let ps = host.page_size() as usize;

        let mut buf = vec![0u8; ps * 2];
        let aligned = (buf.as_ptr() as usize + ps - 1) / ps * ps;
        let offset = aligned - buf.as_ptr() as usize;
        for (i, b) in buf[offset..offset + ps].iter_mut().enumerate() {
            *b = (i % 253) as u8;
        }
        let vpn = (aligned / ps) as u64;

        let task = host.find_task(my_pid()).unwrap().unwrap();
        let context = task.memory_context().unwrap().unwrap();
        let pin = {
            let locked = context.read_lock().unwrap();
            let prot = locked.protection(vpn).unwrap();
            assert!(prot.contains(PageProtection::PRESENT | PageProtection::NX));
            locked.pin_remote(vpn).unwrap()
        };

        let mut page = vec![0u8; ps];
        pin.copy_out(&mut page).unwrap();
        assert_eq!(&page[..], &buf[offset..offset + ps]);
    }

    #[test]
    fn test_unmapped_page() {
        let host = ProcfsHost::new().unwrap();
        let task = host.find_task(my_pid()).unwrap().unwrap();
        let context = task.memory_context().unwrap().unwrap();
        let locked = context.read_lock().unwrap();
        // the zero page is never mapped
        assert!(matches!(locked.pin_remote(0), Err(KmemError::InvalidAddress(0))));
        assert!(locked.protection(0).is_none());
        assert!(locked.pin_remote(u64::MAX).is_err());
    }

    #[test]
    fn test_ram_frames() {
        if !rustix::process::geteuid().is_root() {
            // iomem addresses are zeroed for unprivileged readers
            return;
        }
        let host = ProcfsHost::new().unwrap();
        let iomem = host.iomem().unwrap();
        let ram = iomem.ram().next().unwrap().frame_range(host.page_size());
        assert!(host.page_is_ram(ram.start).unwrap());
        assert!(host.max_frame() >= ram.end - 1);
    }
}
