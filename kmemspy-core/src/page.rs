use bitflags::bitflags;
use std::fmt;

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

bitflags! {
    /// Protection bits of a virtual memory mapping, in x86-64 page table entry layout.
    ///
    /// These are the bits a [`TranslationEntry`] carries below (and, for `NX`, above) the
    /// physical frame base.
    #[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct PageProtection: u64 {
        /// The page is present in memory
        const PRESENT = 1 << 0;
        /// Writes are allowed
        const RW = 1 << 1;
        /// User mode may access the page
        const USER = 1 << 2;
        /// Write-through caching
        const PWT = 1 << 3;
        /// Caching disabled
        const PCD = 1 << 4;
        /// The page has been accessed
        const ACCESSED = 1 << 5;
        /// The page has been written to
        const DIRTY = 1 << 6;
        /// Huge page
        const PSE = 1 << 7;
        /// Global translation.  Without `PRESENT` this marks a `PROT_NONE` mapping.
        const GLOBAL = 1 << 8;
        /// Instruction fetches are not allowed
        const NX = 1 << 63;
    }
}

impl PageProtection {
    /// The protection a `PROT_NONE` mapping carries.
    pub const NONE: PageProtection = PageProtection::GLOBAL.union(PageProtection::ACCESSED);

    /// Synthesizes the page protection of a mapping from its access rights.
    ///
    /// This follows the kernel's protection map: a private writable mapping is copy-on-write,
    /// so its pages are mapped read-only until written.
    pub fn from_access(read: bool, write: bool, execute: bool, shared: bool) -> PageProtection {
        if !read && !write && !execute {
            return PageProtection::NONE;
        }

        let mut prot = PageProtection::PRESENT | PageProtection::USER | PageProtection::ACCESSED;
        if write && shared {
            prot |= PageProtection::RW;
        }
        if !execute {
            prot |= PageProtection::NX;
        }
        prot
    }
}

/// A physical frame base combined with the protection bits of the mapping that resolves to it.
///
/// Only virtual lookups produce one.  The value is synthesized per request by the page service.
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TranslationEntry(u64);

impl TranslationEntry {
    /// Builds an entry from a page-aligned physical address and a protection.
    pub fn new(physical_base: u64, protection: PageProtection) -> TranslationEntry {
        TranslationEntry(physical_base | protection.bits())
    }

    /// Wraps a raw entry, as read back from the control channel.
    pub const fn from_bits(bits: u64) -> TranslationEntry {
        TranslationEntry(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// The protection bits of the entry.
    pub fn protection(&self) -> PageProtection {
        PageProtection::from_bits_truncate(self.0)
    }

    /// The physical base address of the frame, for a host with pages of `page_size` bytes.
    pub fn physical_address(&self, page_size: u64) -> u64 {
        self.0 & !(page_size - 1) & !PageProtection::NX.bits()
    }

    /// The physical frame number, for a host with pages of `page_size` bytes.
    pub fn frame_number(&self, page_size: u64) -> u64 {
        self.physical_address(page_size) / page_size
    }
}

impl fmt::Display for TranslationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Debug for TranslationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TranslationEntry(0x{:x}, {:?})", self.0, self.protection())
    }
}

/// One page of memory as returned by the page service.
///
/// For virtual lookups `frame_number` is the virtual page number that was requested, for
/// physical lookups it is the physical frame number.
#[derive(Clone, PartialEq, Eq)]
pub struct PageFrame {
    pub frame_number: u64,
    pub contents: Vec<u8>,
}

impl PageFrame {
    pub fn new(frame_number: u64, contents: Vec<u8>) -> PageFrame {
        PageFrame { frame_number, contents }
    }

    /// The size of this frame, in bytes.
    pub fn page_size(&self) -> u64 {
        self.contents.len() as u64
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview = &self.contents[..self.contents.len().min(16)];
        f.debug_struct("PageFrame")
            .field("frame_number", &format_args!("0x{:x}", self.frame_number))
            .field("len", &self.contents.len())
            .field("head", &hex::encode(preview))
            .finish()
    }
}
