#![allow(unknown_lints)]
#![deny(rustdoc::broken_intra_doc_links, rustdoc::invalid_html_tags)]
//! This crate grants page-granular read access to physical memory and to the virtual memory of
//! any process, and turns it into annotated hex dumps.
//!
//! It is split in two halves that talk over a small control channel:
//!
//! * A privileged [page service](crate::service::PageService) that resolves one page at a time,
//!   either a (process, virtual page) pair or a physical frame number, and copies the page to a
//!   buffer supplied by the caller.  Virtual lookups also get a synthesized translation entry.
//!   The service is registered as a [`PageDevice`](crate::device::PageDevice).
//! * An unprivileged [client](crate::client::Client) that splits an arbitrary byte range into
//!   page requests, sends them one by one over a [`ControlChannel`](crate::channel::ControlChannel)
//!   and stitches the exact range back together.
//!
//! The kernel facilities the service needs are abstracted behind the
//! [`MemoryHost`](crate::host::MemoryHost) trait.  On Linux, [`ProcfsHost`](crate::host::ProcfsHost)
//! resolves pages through `/proc/<pid>/pagemap`, `/proc/<pid>/mem`, `/proc/iomem` and `/dev/mem`.
//!
//! # Example
//!
//! ```no_run
//! use kmemspy::channel::DeviceChannel;
//! use kmemspy::client::Client;
//! use kmemspy::{MemoryRegion, RegionKind};
//!
//! let region = MemoryRegion::new(0x2000, 0x20, RegionKind::Virtual(1)).unwrap();
//! let channel = DeviceChannel::open("/dev/kmemspy").unwrap();
//! let snapshot = Client::new(channel).read_region(&region).unwrap();
//! print!("{}", snapshot.hex_dump().unwrap());
//! ```
//!
//! # Panicing
//!
//! The crate aims to be panic-free.  Whenever it encounters a bug in its own code, it returns an
//! [`InternalError`](enum.KmemError.html#variant.InternalError) error, which should be reported.
//!
//! # Cargo features
//!
//! * `cli` -- Default.  Builds the `kmemspy` binary.
//! * `software-emulation` -- Optional.  Enables [`EmulatedHost`](crate::host::EmulatedHost), an
//!   in-memory host with a frame table and fake processes, for tests and benchmarks.
//! * `serde1` -- Optional.  Derives `Serialize`/`Deserialize` for the data model.
//! * `backtrace` -- Optional.  Captures a stack trace whenever an `InternalError` is raised.

pub use kmemspy_core::*;

use lazy_static::lazy_static;

use rustix::fd::AsFd;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

#[allow(unused_macros)]
macro_rules! build_internal_error {
    ($err: expr) => {
        crate::KmemError::InternalError(crate::InternalError {
            msg: format!("Internal Unwrap Error: {}", $err),
            file: file!(),
            line: line!(),
            #[cfg(feature = "backtrace")]
            backtrace: backtrace::Backtrace::new(),
        })
    };
    ($err: expr, $msg: expr) => {
        crate::KmemError::InternalError(crate::InternalError {
            msg: format!("Internal Unwrap Error: {}: {}", $msg, $err),
            file: file!(),
            line: line!(),
            #[cfg(feature = "backtrace")]
            backtrace: backtrace::Backtrace::new(),
        })
    };
}

macro_rules! wrap_io_error {
    ($path:expr, $expr:expr) => {
        match $expr {
            Ok(v) => Ok(v),
            Err(e) => {
                let kind = e.kind();
                Err(::std::io::Error::new(
                    kind,
                    crate::IoErrorWrapper {
                        path: $path.to_owned(),
                        inner: e.into(),
                    },
                ))
            }
        }
    };
}

pub mod host;

pub mod service;

pub mod device;

pub mod channel;

pub mod client;

lazy_static! {
    /// Memory page size, in bytes.
    ///
    /// This is calculated from `sysconf(_SC_PAGESIZE)`.
    static ref PAGESIZE: u64 = {
        rustix::param::page_size() as u64
    };
}

/// Memory page size of the running system, in bytes.
///
/// This is calculated from `sysconf(_SC_PAGESIZE)`.
pub fn page_size() -> u64 {
    *PAGESIZE
}

/// A wrapper around a `File` that remembers the name of the path
#[derive(Debug)]
pub(crate) struct FileWrapper {
    inner: File,
    path: PathBuf,
}

impl FileWrapper {
    pub(crate) fn open<P: AsRef<Path>>(path: P) -> Result<FileWrapper, io::Error> {
        let p = path.as_ref();
        let f = wrap_io_error!(p, File::open(p))?;
        Ok(FileWrapper {
            inner: f,
            path: p.to_owned(),
        })
    }

    pub(crate) fn open_rw<P: AsRef<Path>>(path: P) -> Result<FileWrapper, io::Error> {
        let p = path.as_ref();
        let f = wrap_io_error!(p, OpenOptions::new().read(true).write(true).open(p))?;
        Ok(FileWrapper {
            inner: f,
            path: p.to_owned(),
        })
    }

    pub(crate) fn open_at<P, Q, Fd: AsFd>(root: P, dirfd: Fd, path: Q) -> Result<FileWrapper, io::Error>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        use rustix::fs::{Mode, OFlags};

        let p = root.as_ref().join(path.as_ref());
        let fd = wrap_io_error!(
            p,
            rustix::fs::openat(dirfd, path.as_ref(), OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())
        )?;
        Ok(FileWrapper {
            inner: File::from(fd),
            path: p,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Fills `buf` from the absolute file offset `offset`, without moving the cursor.
    pub(crate) fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        wrap_io_error!(self.path, self.inner.read_exact_at(buf, offset))
    }

    pub(crate) fn as_file(&self) -> &File {
        &self.inner
    }
}

impl Read for FileWrapper {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        wrap_io_error!(self.path, self.inner.read(buf))
    }
    fn read_to_end(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        wrap_io_error!(self.path, self.inner.read_to_end(buf))
    }
    fn read_to_string(&mut self, buf: &mut String) -> io::Result<usize> {
        wrap_io_error!(self.path, self.inner.read_to_string(buf))
    }
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        wrap_io_error!(self.path, self.inner.read_exact(buf))
    }
}

impl Seek for FileWrapper {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        wrap_io_error!(self.path, self.inner.seek(pos))
    }
}
