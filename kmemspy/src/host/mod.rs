//! The kernel facilities the page service is built on.
//!
//! A [`MemoryHost`] knows the page size, finds tasks by process id and tells RAM frames apart
//! from device or reserved memory.  A task may own a [`MemoryContext`] (its address space), whose
//! read lock gives a [`LockedContext`] that can pin a page of the address space and report the
//! protection of the mapping covering it.
//!
//! Everything that keeps a page alive is a guard: a [`PinnedPage`] releases its pin and a frame
//! mapping (any [`MappedPage`]) unmaps its frame when dropped.  The service never sees a raw
//! pointer into another address space.
//!
//! Two hosts are provided:
//!
//! * [`ProcfsHost`], which resolves pages of the running Linux system through procfs and
//!   `/dev/mem`.
//! * [`EmulatedHost`] (with the `software-emulation` feature), an in-memory frame table with fake
//!   processes.

use crate::{KmemError, KmemResult, PageProtection};

mod procfs;
pub use self::procfs::*;

#[cfg(any(test, feature = "software-emulation"))]
mod emulated;
#[cfg(any(test, feature = "software-emulation"))]
pub use self::emulated::*;

/// Access to the memory of the machine the page service runs on.
pub trait MemoryHost {
    /// A process found by [`find_task`](MemoryHost::find_task).
    type Task: HostTask;
    /// A temporary mapping of one physical frame.
    type Mapping: MappedPage;

    /// Size of a page, in bytes.  Always a power of two.
    fn page_size(&self) -> u64;

    /// The highest physical frame number the host can address.
    fn max_frame(&self) -> u64;

    /// Looks up the process with id `pid`.
    fn find_task(&self, pid: u32) -> KmemResult<Option<Self::Task>>;

    /// Whether frame `pfn` is ordinary RAM, as opposed to device or reserved memory.
    fn page_is_ram(&self, pfn: u64) -> KmemResult<bool>;

    /// Maps frame `pfn` until the returned guard is dropped.
    fn map_frame(&self, pfn: u64) -> KmemResult<Self::Mapping>;
}

/// A process known to the host.
pub trait HostTask {
    type Context: MemoryContext;

    /// The address space of the task.
    ///
    /// `None` for tasks without one, such as kernel threads and processes that have exited.
    fn memory_context(&self) -> KmemResult<Option<Self::Context>>;
}

/// The address space of a task.
pub trait MemoryContext {
    type Locked<'a>: LockedContext
    where
        Self: 'a;

    /// Takes the shared lock that keeps the set of mappings stable.
    fn read_lock(&self) -> KmemResult<Self::Locked<'_>>;
}

/// An address space whose mappings can't change until this is dropped.
pub trait LockedContext {
    type Pin: PinnedPage;

    /// Pins the page backing virtual page `vpn`, faulting it in if needed.
    ///
    /// The pin outlives the lock.  Fails with [`KmemError::InvalidAddress`] when nothing is
    /// mapped at `vpn` or the page can't be brought in.
    fn pin_remote(&self, vpn: u64) -> KmemResult<Self::Pin>;

    /// The protection of the mapping covering virtual page `vpn`.
    fn protection(&self, vpn: u64) -> Option<PageProtection>;
}

/// A page whose contents can be copied out.
pub trait MappedPage {
    /// Copies the whole page into `dst`, which holds exactly one page.
    ///
    /// Fails with [`KmemError::IoFault`] when the contents can't be read.
    fn copy_out(&self, dst: &mut [u8]) -> KmemResult<()>;
}

/// A page kept resident by a pin.  Dropping it releases the pin.
pub trait PinnedPage: MappedPage {
    /// The physical frame backing the page.
    fn frame_number(&self) -> u64;
}

/// A writable region of the requesting client's address space.
///
/// This is the only way the page service hands page contents back to a caller.
pub trait UserMemory {
    /// Copies `src` to the client address `address`.
    ///
    /// Fails with [`KmemError::IoFault`] if any byte of the destination isn't writable.
    fn copy_to_user(&mut self, address: u64, src: &[u8]) -> KmemResult<()>;
}

/// A client buffer that lives in the same address space as the page service.
///
/// The buffer's client address is the address of its first byte.
#[derive(Debug)]
pub struct UserSlice<'a> {
    base: u64,
    buf: &'a mut [u8],
}

impl<'a> UserSlice<'a> {
    pub fn new(buf: &'a mut [u8]) -> UserSlice<'a> {
        UserSlice {
            base: buf.as_ptr() as u64,
            buf,
        }
    }

    /// The client address of the first byte of the buffer.
    pub fn base(&self) -> u64 {
        self.base
    }
}

impl UserMemory for UserSlice<'_> {
    fn copy_to_user(&mut self, address: u64, src: &[u8]) -> KmemResult<()> {
        let offset = address
            .checked_sub(self.base)
            .map(|o| o as usize)
            .filter(|o| o.checked_add(src.len()).map_or(false, |end| end <= self.buf.len()));
        match offset {
            Some(offset) => {
                self.buf[offset..offset + src.len()].copy_from_slice(src);
                Ok(())
            }
            None => Err(KmemError::IoFault(format!(
                "0x{:x} bytes at 0x{:x} are outside the client buffer",
                src.len(),
                address
            ))),
        }
    }
}
