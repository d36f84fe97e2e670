//! The control channel between a client and the page service.
//!
//! Each request is a fixed-layout record (C layout, native byte order) tagged with an ioctl-style
//! command code.  The service reads the record, resolves one page, writes the page to the
//! record's `data_buf` address in the client's address space and, for virtual lookups, writes a
//! translation entry back into the record.
//!
//! Errors cross the channel as a negative errno value.  [`KmemError::errno`] and
//! [`KmemError::from_errno`] translate between those and the structured error kinds.
//!
//! ```
//! use kmemspy_core::protocol::{Command, Request};
//!
//! let mut request = Request::virtual_page(1234, 0x7f00_1234);
//! request.set_data_buf(0x5555_0000);
//! let record = request.encode();
//! assert_eq!(record.len(), Command::ReadVirtualPage.record_size());
//!
//! let decoded = Request::decode(Command::ReadVirtualPage.code(), &record).unwrap();
//! assert_eq!(decoded, request);
//! ```

use byteorder::{ByteOrder, NativeEndian};

use crate::{KmemError, KmemResult, TranslationEntry};

/// The type byte shared by every kmemspy command code.
pub const IOCTL_MAGIC: u8 = b'M';

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;
const IOC_SIZEMASK: u32 = (1 << 14) - 1;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT) | ((size as u32) << IOC_SIZESHIFT) | ((ty as u32) << IOC_TYPESHIFT) | ((nr as u32) << IOC_NRSHIFT)
}

/// Extracts the type byte of a command code.
pub const fn ioc_type(code: u32) -> u8 {
    ((code >> IOC_TYPESHIFT) & 0xff) as u8
}

/// Extracts the record size encoded in a command code.
pub const fn ioc_size(code: u32) -> usize {
    ((code >> IOC_SIZESHIFT) & IOC_SIZEMASK) as usize
}

/// Size of a `ReadVirtualPage` record, including the trailing padding.
pub const READ_VIRTUAL_PAGE_RECORD_SIZE: usize = 32;
/// Size of a `ReadPhysicalFrame` record.
pub const READ_PHYSICAL_FRAME_RECORD_SIZE: usize = 16;

/// Linux errno values used on the wire.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const ESRCH: i32 = 3;
    pub const EIO: i32 = 5;
    pub const ENXIO: i32 = 6;
    pub const EFAULT: i32 = 14;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOTTY: i32 = 25;
}

/// The commands the page service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Read one page of a process's virtual memory, and its translation entry.
    ReadVirtualPage,
    /// Read one physical frame.
    ReadPhysicalFrame,
}

impl Command {
    pub const READ_VIRTUAL_PAGE: u32 = ioc(IOC_READ | IOC_WRITE, IOCTL_MAGIC, 1, READ_VIRTUAL_PAGE_RECORD_SIZE);
    pub const READ_PHYSICAL_FRAME: u32 = ioc(IOC_WRITE, IOCTL_MAGIC, 2, READ_PHYSICAL_FRAME_RECORD_SIZE);

    /// The command code sent over the channel.
    pub const fn code(self) -> u32 {
        match self {
            Command::ReadVirtualPage => Command::READ_VIRTUAL_PAGE,
            Command::ReadPhysicalFrame => Command::READ_PHYSICAL_FRAME,
        }
    }

    pub fn from_code(code: u32) -> Option<Command> {
        match code {
            Command::READ_VIRTUAL_PAGE => Some(Command::ReadVirtualPage),
            Command::READ_PHYSICAL_FRAME => Some(Command::ReadPhysicalFrame),
            _ => None,
        }
    }

    /// The size of the record this command carries.
    pub const fn record_size(self) -> usize {
        match self {
            Command::ReadVirtualPage => READ_VIRTUAL_PAGE_RECORD_SIZE,
            Command::ReadPhysicalFrame => READ_PHYSICAL_FRAME_RECORD_SIZE,
        }
    }
}

/// The `ReadVirtualPage` record.
///
/// ```text
/// offset  field      direction
///      0  pfn_virt   in
///      8  pte        out
///     16  data_buf   in
///     24  pid        in
///     28  (padding)
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadVirtualPageArgs {
    /// Virtual page number to read.
    pub pfn_virt: u64,
    /// Translation entry written back by the service.
    pub pte: u64,
    /// Address of a page-sized buffer in the caller's address space.
    pub data_buf: u64,
    /// Target process.
    pub pid: u32,
}

impl ReadVirtualPageArgs {
    pub fn encode_into(&self, record: &mut [u8]) -> KmemResult<()> {
        check_record_len(record, READ_VIRTUAL_PAGE_RECORD_SIZE)?;
        let record = expect!(
            <&mut [u8; READ_VIRTUAL_PAGE_RECORD_SIZE]>::try_from(&mut record[..READ_VIRTUAL_PAGE_RECORD_SIZE]).ok(),
            "record length was checked"
        );
        self.write_record(record);
        Ok(())
    }

    fn write_record(&self, record: &mut [u8; READ_VIRTUAL_PAGE_RECORD_SIZE]) {
        NativeEndian::write_u64(&mut record[0..8], self.pfn_virt);
        NativeEndian::write_u64(&mut record[8..16], self.pte);
        NativeEndian::write_u64(&mut record[16..24], self.data_buf);
        NativeEndian::write_u32(&mut record[24..28], self.pid);
        record[28..32].fill(0);
    }

    pub fn decode(record: &[u8]) -> KmemResult<ReadVirtualPageArgs> {
        check_record_len(record, READ_VIRTUAL_PAGE_RECORD_SIZE)?;
        Ok(ReadVirtualPageArgs {
            pfn_virt: NativeEndian::read_u64(&record[0..8]),
            pte: NativeEndian::read_u64(&record[8..16]),
            data_buf: NativeEndian::read_u64(&record[16..24]),
            pid: NativeEndian::read_u32(&record[24..28]),
        })
    }
}

/// The `ReadPhysicalFrame` record.
///
/// ```text
/// offset  field      direction
///      0  pfn_phys   in
///      8  data_buf   in
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadPhysicalFrameArgs {
    /// Physical frame number to read.
    pub pfn_phys: u64,
    /// Address of a page-sized buffer in the caller's address space.
    pub data_buf: u64,
}

impl ReadPhysicalFrameArgs {
    pub fn encode_into(&self, record: &mut [u8]) -> KmemResult<()> {
        check_record_len(record, READ_PHYSICAL_FRAME_RECORD_SIZE)?;
        let record = expect!(
            <&mut [u8; READ_PHYSICAL_FRAME_RECORD_SIZE]>::try_from(&mut record[..READ_PHYSICAL_FRAME_RECORD_SIZE]).ok(),
            "record length was checked"
        );
        self.write_record(record);
        Ok(())
    }

    fn write_record(&self, record: &mut [u8; READ_PHYSICAL_FRAME_RECORD_SIZE]) {
        NativeEndian::write_u64(&mut record[0..8], self.pfn_phys);
        NativeEndian::write_u64(&mut record[8..16], self.data_buf);
    }

    pub fn decode(record: &[u8]) -> KmemResult<ReadPhysicalFrameArgs> {
        check_record_len(record, READ_PHYSICAL_FRAME_RECORD_SIZE)?;
        Ok(ReadPhysicalFrameArgs {
            pfn_phys: NativeEndian::read_u64(&record[0..8]),
            data_buf: NativeEndian::read_u64(&record[8..16]),
        })
    }
}

/// A request to the page service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    ReadVirtualPage(ReadVirtualPageArgs),
    ReadPhysicalFrame(ReadPhysicalFrameArgs),
}

impl Request {
    /// A request for virtual page `vpn` of process `pid`.
    pub fn virtual_page(pid: u32, vpn: u64) -> Request {
        Request::ReadVirtualPage(ReadVirtualPageArgs {
            pfn_virt: vpn,
            pid,
            ..Default::default()
        })
    }

    /// A request for physical frame `pfn`.
    pub fn physical_frame(pfn: u64) -> Request {
        Request::ReadPhysicalFrame(ReadPhysicalFrameArgs {
            pfn_phys: pfn,
            ..Default::default()
        })
    }

    pub fn command(&self) -> Command {
        match self {
            Request::ReadVirtualPage(_) => Command::ReadVirtualPage,
            Request::ReadPhysicalFrame(_) => Command::ReadPhysicalFrame,
        }
    }

    /// The virtual page number or physical frame number this request is for.
    pub fn page_number(&self) -> u64 {
        match self {
            Request::ReadVirtualPage(args) => args.pfn_virt,
            Request::ReadPhysicalFrame(args) => args.pfn_phys,
        }
    }

    pub fn data_buf(&self) -> u64 {
        match self {
            Request::ReadVirtualPage(args) => args.data_buf,
            Request::ReadPhysicalFrame(args) => args.data_buf,
        }
    }

    pub fn set_data_buf(&mut self, address: u64) {
        match self {
            Request::ReadVirtualPage(args) => args.data_buf = address,
            Request::ReadPhysicalFrame(args) => args.data_buf = address,
        }
    }

    /// The translation entry the service wrote back, for virtual lookups.
    pub fn translation_entry(&self) -> Option<TranslationEntry> {
        match self {
            Request::ReadVirtualPage(args) => Some(TranslationEntry::from_bits(args.pte)),
            Request::ReadPhysicalFrame(_) => None,
        }
    }

    /// Encodes the request record.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::ReadVirtualPage(args) => {
                let mut record = [0; READ_VIRTUAL_PAGE_RECORD_SIZE];
                args.write_record(&mut record);
                record.to_vec()
            }
            Request::ReadPhysicalFrame(args) => {
                let mut record = [0; READ_PHYSICAL_FRAME_RECORD_SIZE];
                args.write_record(&mut record);
                record.to_vec()
            }
        }
    }

    pub fn encode_into(&self, record: &mut [u8]) -> KmemResult<()> {
        match self {
            Request::ReadVirtualPage(args) => args.encode_into(record),
            Request::ReadPhysicalFrame(args) => args.encode_into(record),
        }
    }

    /// Decodes a record received with command `code`.
    ///
    /// Unknown codes fail with [`KmemError::Unsupported`], short records with
    /// [`KmemError::IoFault`].
    pub fn decode(code: u32, record: &[u8]) -> KmemResult<Request> {
        match Command::from_code(code) {
            Some(Command::ReadVirtualPage) => Ok(Request::ReadVirtualPage(ReadVirtualPageArgs::decode(record)?)),
            Some(Command::ReadPhysicalFrame) => Ok(Request::ReadPhysicalFrame(ReadPhysicalFrameArgs::decode(record)?)),
            None => Err(KmemError::Unsupported(code)),
        }
    }

    /// Reads the fields the service writes back out of a completed record.
    pub fn update_from(&mut self, record: &[u8]) -> KmemResult<()> {
        if let Request::ReadVirtualPage(args) = self {
            args.pte = ReadVirtualPageArgs::decode(record)?.pte;
        }
        Ok(())
    }
}

fn check_record_len(record: &[u8], expected: usize) -> KmemResult<()> {
    if record.len() < expected {
        return Err(KmemError::IoFault(format!(
            "request record is {} bytes, expected {}",
            record.len(),
            expected
        )));
    }
    Ok(())
}

/// Turns the status returned for a request into a result.
///
/// `address` is the byte address of the page that was requested, and is attached to
/// `InvalidAddress` errors.
pub fn check_status(status: i32, address: u64) -> KmemResult<()> {
    if status >= 0 {
        Ok(())
    } else {
        Err(KmemError::from_errno(-status, address))
    }
}

impl KmemError {
    /// The errno this error is reported as on the control channel.
    pub fn errno(&self) -> i32 {
        match self {
            KmemError::InvalidArgument(_) | KmemError::InvalidAddress(_) => errno::EINVAL,
            KmemError::NotFound(_) => errno::ESRCH,
            KmemError::Unsupported(_) => errno::ENOTTY,
            KmemError::IoFault(_) => errno::EFAULT,
            KmemError::ServiceUnavailable(_) => errno::ENODEV,
            KmemError::Io(e, _) => e.raw_os_error().unwrap_or(errno::EIO),
            KmemError::Page { source, .. } => source.errno(),
            KmemError::InternalError(_) => errno::EIO,
        }
    }

    /// Translates a positive errno received from the control channel.
    pub fn from_errno(errno: i32, address: u64) -> KmemError {
        match errno {
            errno::EINVAL => KmemError::InvalidAddress(address),
            errno::ESRCH => KmemError::NotFound("no such process".to_string()),
            errno::ENOENT => KmemError::NotFound(format!("no page at 0x{:x}", address)),
            errno::ENOTTY => KmemError::NotFound("command not supported by the page service".to_string()),
            errno::ENODEV | errno::ENXIO => KmemError::ServiceUnavailable(None),
            errno::EFAULT => KmemError::IoFault(format!("copy of page 0x{:x} failed", address)),
            other => KmemError::IoFault(format!("page service returned errno {}", other)),
        }
    }
}
