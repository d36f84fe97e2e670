//! Software emulation of a host, for testing without privileges.
//!
//! The emulated machine is a flat table of frames, each either RAM, device memory or reserved,
//! plus a set of fake processes.  A process may own an address space: a list of mappings with
//! their permissions, and a page table from virtual page numbers to frame numbers.  The address
//! space sits behind a read/write lock, like a kernel `mm`.
//!
//! The host keeps count of live pins and frame mappings, and records whether page contents were
//! ever copied while the copying thread held an address space lock.

use log::trace;
use parking_lot::{RwLock, RwLockReadGuard};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{HostTask, LockedContext, MappedPage, MemoryContext, MemoryHost, PinnedPage};
use crate::process::MMPermissions;
use crate::{KmemError, KmemResult, PageProtection, ROW_SIZE};

/// What backs an emulated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Ram,
    Device,
    Reserved,
}

struct Frame {
    kind: FrameKind,
    data: RwLock<Vec<u8>>,
    pins: AtomicUsize,
}

#[derive(Default)]
struct Counters {
    pinned: AtomicUsize,
    mapped: AtomicUsize,
    pins_taken: AtomicUsize,
    copied_under_lock: AtomicBool,
}

thread_local! {
    // address space read locks held by this thread
    static LOCKS_HELD: Cell<usize> = Cell::new(0);
}

/// Builds an [`EmulatedHost`] frame by frame.
///
/// Frames are numbered in the order they are added, starting at 0.
#[derive(Debug, Clone)]
pub struct EmulatedHostBuilder {
    page_size: u64,
    frames: Vec<FrameKind>,
}

impl Default for EmulatedHostBuilder {
    fn default() -> Self {
        EmulatedHostBuilder {
            page_size: 4096,
            frames: Vec::new(),
        }
    }
}

impl EmulatedHostBuilder {
    pub fn new() -> EmulatedHostBuilder {
        Self::default()
    }

    /// Sets the page size.  Defaults to 4096.
    pub fn page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Appends `count` frames of RAM.
    pub fn ram(self, count: usize) -> Self {
        self.frames(FrameKind::Ram, count)
    }

    /// Appends `count` frames of device memory.
    pub fn device(self, count: usize) -> Self {
        self.frames(FrameKind::Device, count)
    }

    /// Appends `count` reserved frames.
    pub fn reserved(self, count: usize) -> Self {
        self.frames(FrameKind::Reserved, count)
    }

    pub fn frames(mut self, kind: FrameKind, count: usize) -> Self {
        self.frames.extend(std::iter::repeat(kind).take(count));
        self
    }

    /// Creates the host.  Every frame starts out zeroed.
    ///
    /// Fails with [`KmemError::InvalidArgument`] unless the page size is a power of two that
    /// holds at least one hex dump row.
    pub fn build(self) -> KmemResult<EmulatedHost> {
        if !self.page_size.is_power_of_two() || self.page_size < ROW_SIZE {
            return Err(KmemError::InvalidArgument(format!(
                "page size {} is not a power of two of at least {}",
                self.page_size, ROW_SIZE
            )));
        }

        let frames = self
            .frames
            .into_iter()
            .map(|kind| {
                Arc::new(Frame {
                    kind,
                    data: RwLock::new(vec![0; self.page_size as usize]),
                    pins: AtomicUsize::new(0),
                })
            })
            .collect();

        Ok(EmulatedHost {
            page_size: self.page_size,
            frames: Arc::new(frames),
            processes: RwLock::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        })
    }
}

/// An in-memory host.  See the [module documentation](self).
pub struct EmulatedHost {
    page_size: u64,
    frames: Arc<Vec<Arc<Frame>>>,
    processes: RwLock<HashMap<u32, Option<Arc<AddressSpace>>>>,
    counters: Arc<Counters>,
}

impl EmulatedHost {
    pub fn builder() -> EmulatedHostBuilder {
        EmulatedHostBuilder::new()
    }

    fn frame(&self, pfn: u64) -> KmemResult<&Arc<Frame>> {
        usize::try_from(pfn)
            .ok()
            .and_then(|idx| self.frames.get(idx))
            .ok_or_else(|| KmemError::InvalidArgument(format!("no frame 0x{:x}", pfn)))
    }

    /// Overwrites part of frame `pfn`, starting `offset` bytes in.
    pub fn write_frame(&self, pfn: u64, offset: usize, bytes: &[u8]) -> KmemResult<()> {
        let frame = self.frame(pfn)?;
        let mut data = frame.data.write();
        match offset.checked_add(bytes.len()) {
            Some(end) if end <= data.len() => {
                data[offset..end].copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(KmemError::InvalidArgument(format!(
                "write of {} bytes at offset {} overruns frame 0x{:x}",
                bytes.len(),
                offset,
                pfn
            ))),
        }
    }

    /// The current contents of frame `pfn`.
    pub fn frame_contents(&self, pfn: u64) -> KmemResult<Vec<u8>> {
        Ok(self.frame(pfn)?.data.read().clone())
    }

    /// Adds a process with an empty address space.
    pub fn spawn_process(&self, pid: u32) -> KmemResult<()> {
        let space = AddressSpace {
            mappings: RwLock::new(Mappings::default()),
            page_size: self.page_size,
            frames: Arc::clone(&self.frames),
            counters: Arc::clone(&self.counters),
        };
        self.insert_task(pid, Some(Arc::new(space)))
    }

    /// Adds a task without an address space, like a kernel thread.
    pub fn spawn_kernel_task(&self, pid: u32) -> KmemResult<()> {
        self.insert_task(pid, None)
    }

    fn insert_task(&self, pid: u32, space: Option<Arc<AddressSpace>>) -> KmemResult<()> {
        let mut processes = self.processes.write();
        if processes.contains_key(&pid) {
            return Err(KmemError::InvalidArgument(format!("pid {} already exists", pid)));
        }
        processes.insert(pid, space);
        Ok(())
    }

    /// Tears down the address space of `pid`.  The task itself stays around, like a zombie.
    pub fn exit(&self, pid: u32) -> KmemResult<()> {
        match self.processes.write().get_mut(&pid) {
            Some(space) => {
                space.take();
                Ok(())
            }
            None => Err(KmemError::NotFound(format!("pid {}", pid))),
        }
    }

    fn address_space(&self, pid: u32) -> KmemResult<Arc<AddressSpace>> {
        match self.processes.read().get(&pid) {
            Some(Some(space)) => Ok(Arc::clone(space)),
            Some(None) => Err(KmemError::NotFound(format!("pid {} has no address space", pid))),
            None => Err(KmemError::NotFound(format!("pid {}", pid))),
        }
    }

    /// Maps `frames` into `pid` at consecutive virtual pages starting at `start_vpn`.
    pub fn map(&self, pid: u32, start_vpn: u64, perms: MMPermissions, frames: &[u64]) -> KmemResult<()> {
        for &pfn in frames {
            self.frame(pfn)?;
        }
        let space = self.address_space(pid)?;
        let mut mappings = space.mappings.write();
        let end = mappings.add_vma(start_vpn, frames.len() as u64, perms)?;
        for (vpn, &pfn) in (start_vpn..end).zip(frames) {
            mappings.ptes.insert(vpn, pfn);
        }
        Ok(())
    }

    /// Adds a mapping of `pages` pages to `pid` without populating it.
    ///
    /// Pinning a page of such a mapping fails, like touching a mapping that can't be faulted in.
    pub fn reserve(&self, pid: u32, start_vpn: u64, pages: u64, perms: MMPermissions) -> KmemResult<()> {
        let space = self.address_space(pid)?;
        let mut mappings = space.mappings.write();
        mappings.add_vma(start_vpn, pages, perms)?;
        Ok(())
    }

    /// Removes every mapping of `pid` that overlaps `start_vpn..start_vpn + pages`.
    pub fn unmap(&self, pid: u32, start_vpn: u64, pages: u64) -> KmemResult<()> {
        let space = self.address_space(pid)?;
        let mut mappings = space.mappings.write();
        let end = start_vpn.saturating_add(pages);
        mappings.vmas.retain(|vma| vma.end <= start_vpn || vma.start >= end);
        let doomed: Vec<u64> = mappings.ptes.range(start_vpn..end).map(|(vpn, _)| *vpn).collect();
        for vpn in doomed {
            mappings.ptes.remove(&vpn);
        }
        Ok(())
    }

    /// Number of pins currently held.
    pub fn pinned_pages(&self) -> usize {
        self.counters.pinned.load(Ordering::SeqCst)
    }

    /// Number of pins ever taken.
    pub fn pins_taken(&self) -> usize {
        self.counters.pins_taken.load(Ordering::SeqCst)
    }

    /// Number of frame mappings currently live.
    pub fn active_mappings(&self) -> usize {
        self.counters.mapped.load(Ordering::SeqCst)
    }

    /// Whether a page was ever copied out while an address space lock was held.
    pub fn copied_under_lock(&self) -> bool {
        self.counters.copied_under_lock.load(Ordering::SeqCst)
    }

    /// Number of pins held on frame `pfn`.
    pub fn frame_pins(&self, pfn: u64) -> KmemResult<usize> {
        Ok(self.frame(pfn)?.pins.load(Ordering::SeqCst))
    }
}

impl MemoryHost for EmulatedHost {
    type Task = EmulatedTask;
    type Mapping = EmulatedMapping;

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn max_frame(&self) -> u64 {
        (self.frames.len() as u64).saturating_sub(1)
    }

    fn find_task(&self, pid: u32) -> KmemResult<Option<EmulatedTask>> {
        Ok(self.processes.read().get(&pid).map(|space| EmulatedTask { space: space.clone() }))
    }

    fn page_is_ram(&self, pfn: u64) -> KmemResult<bool> {
        Ok(self.frame(pfn).map_or(false, |frame| frame.kind == FrameKind::Ram))
    }

    fn map_frame(&self, pfn: u64) -> KmemResult<EmulatedMapping> {
        let frame = self
            .frame(pfn)
            .map_err(|_| KmemError::InvalidAddress(pfn.saturating_mul(self.page_size)))?;
        self.counters.mapped.fetch_add(1, Ordering::SeqCst);
        trace!("mapped frame 0x{:x}", pfn);
        Ok(EmulatedMapping {
            frame: Arc::clone(frame),
            counters: Arc::clone(&self.counters),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Vma {
    start: u64,
    end: u64,
    perms: MMPermissions,
}

#[derive(Default)]
struct Mappings {
    vmas: Vec<Vma>,
    ptes: BTreeMap<u64, u64>,
}

impl Mappings {
    fn add_vma(&mut self, start: u64, pages: u64, perms: MMPermissions) -> KmemResult<u64> {
        let end = match start.checked_add(pages) {
            Some(end) if pages > 0 => end,
            _ => {
                return Err(KmemError::InvalidArgument(format!(
                    "bad mapping of {} pages at 0x{:x}",
                    pages, start
                )))
            }
        };
        if self.vmas.iter().any(|vma| vma.start < end && start < vma.end) {
            return Err(KmemError::InvalidArgument(format!(
                "mapping at 0x{:x} overlaps an existing one",
                start
            )));
        }
        self.vmas.push(Vma { start, end, perms });
        Ok(end)
    }

    fn vma(&self, vpn: u64) -> Option<&Vma> {
        self.vmas.iter().find(|vma| vma.start <= vpn && vpn < vma.end)
    }
}

struct AddressSpace {
    mappings: RwLock<Mappings>,
    page_size: u64,
    frames: Arc<Vec<Arc<Frame>>>,
    counters: Arc<Counters>,
}

/// A process of an [`EmulatedHost`].
pub struct EmulatedTask {
    space: Option<Arc<AddressSpace>>,
}

impl HostTask for EmulatedTask {
    type Context = EmulatedContext;

    fn memory_context(&self) -> KmemResult<Option<EmulatedContext>> {
        Ok(self.space.clone().map(EmulatedContext))
    }
}

/// The address space of an [`EmulatedTask`].
pub struct EmulatedContext(Arc<AddressSpace>);

impl MemoryContext for EmulatedContext {
    type Locked<'a> = EmulatedLockedContext<'a>;

    fn read_lock(&self) -> KmemResult<EmulatedLockedContext<'_>> {
        let mappings = self.0.mappings.read();
        LOCKS_HELD.with(|held| held.set(held.get() + 1));
        Ok(EmulatedLockedContext {
            space: &self.0,
            mappings,
        })
    }
}

pub struct EmulatedLockedContext<'a> {
    space: &'a AddressSpace,
    mappings: RwLockReadGuard<'a, Mappings>,
}

impl Drop for EmulatedLockedContext<'_> {
    fn drop(&mut self) {
        LOCKS_HELD.with(|held| held.set(held.get().saturating_sub(1)));
    }
}

impl LockedContext for EmulatedLockedContext<'_> {
    type Pin = EmulatedPin;

    fn pin_remote(&self, vpn: u64) -> KmemResult<EmulatedPin> {
        let address = vpn.saturating_mul(self.space.page_size);
        if self.mappings.vma(vpn).is_none() {
            return Err(KmemError::InvalidAddress(address));
        }
        let pfn = *self.mappings.ptes.get(&vpn).ok_or(KmemError::InvalidAddress(address))?;
        let frame = usize::try_from(pfn)
            .ok()
            .and_then(|idx| self.space.frames.get(idx))
            .ok_or(KmemError::InvalidAddress(address))?;

        frame.pins.fetch_add(1, Ordering::SeqCst);
        self.space.counters.pinned.fetch_add(1, Ordering::SeqCst);
        self.space.counters.pins_taken.fetch_add(1, Ordering::SeqCst);
        Ok(EmulatedPin {
            frame: Arc::clone(frame),
            pfn,
            counters: Arc::clone(&self.space.counters),
        })
    }

    fn protection(&self, vpn: u64) -> Option<PageProtection> {
        self.mappings.vma(vpn).map(|vma| vma.perms.page_protection())
    }
}

fn copy_frame(frame: &Frame, counters: &Counters, dst: &mut [u8]) -> KmemResult<()> {
    if LOCKS_HELD.with(|held| held.get()) > 0 {
        counters.copied_under_lock.store(true, Ordering::SeqCst);
    }
    let data = frame.data.read();
    if dst.len() != data.len() {
        return Err(KmemError::IoFault(format!(
            "{} byte buffer for a {} byte page",
            dst.len(),
            data.len()
        )));
    }
    dst.copy_from_slice(&data);
    Ok(())
}

/// A pin on a page of an emulated address space.
pub struct EmulatedPin {
    frame: Arc<Frame>,
    pfn: u64,
    counters: Arc<Counters>,
}

impl MappedPage for EmulatedPin {
    fn copy_out(&self, dst: &mut [u8]) -> KmemResult<()> {
        copy_frame(&self.frame, &self.counters, dst)
    }
}

impl PinnedPage for EmulatedPin {
    fn frame_number(&self) -> u64 {
        self.pfn
    }
}

impl Drop for EmulatedPin {
    fn drop(&mut self) {
        self.frame.pins.fetch_sub(1, Ordering::SeqCst);
        self.counters.pinned.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A temporary mapping of an emulated frame.
pub struct EmulatedMapping {
    frame: Arc<Frame>,
    counters: Arc<Counters>,
}

impl MappedPage for EmulatedMapping {
    fn copy_out(&self, dst: &mut [u8]) -> KmemResult<()> {
        copy_frame(&self.frame, &self.counters, dst)
    }
}

impl Drop for EmulatedMapping {
    fn drop(&mut self) {
        self.counters.mapped.fetch_sub(1, Ordering::SeqCst);
    }
}
