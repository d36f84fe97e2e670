//! Control channels from a client to the page service.

use log::debug;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::device::PageDevice;
use crate::host::{MemoryHost, UserSlice};
use crate::protocol::{check_status, errno, Request};
use crate::{FileWrapper, KmemError, KmemResult};

/// A way of sending requests to the page service.
pub trait ControlChannel {
    /// Size of the pages the service hands out.
    fn page_size(&self) -> u64;

    /// Sends `request` and waits for the service to serve it.
    ///
    /// The page is written to `data`, which must hold at least one page; the request's `data_buf`
    /// is pointed at it before sending.  Fields the service writes back are updated in `request`.
    fn transact(&mut self, request: &mut Request, data: &mut [u8]) -> KmemResult<()>;
}

fn prepare(request: &mut Request, data: &mut [u8], page_size: u64) -> KmemResult<u64> {
    if (data.len() as u64) < page_size {
        return Err(KmemError::InvalidArgument(format!(
            "a {} byte buffer can't hold a {} byte page",
            data.len(),
            page_size
        )));
    }
    request.set_data_buf(data.as_mut_ptr() as u64);
    Ok(request.page_number().saturating_mul(page_size))
}

/// A channel through the page service's character device.
#[derive(Debug)]
pub struct DeviceChannel {
    file: FileWrapper,
    page_size: u64,
}

impl DeviceChannel {
    /// Opens the character device at `path`.
    ///
    /// Fails with [`KmemError::ServiceUnavailable`] when the device can't be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> KmemResult<DeviceChannel> {
        let path = path.as_ref();
        let file = FileWrapper::open_rw(path).map_err(|e| {
            debug!("opening {}: {}", path.display(), e);
            KmemError::ServiceUnavailable(Some(path.to_owned()))
        })?;
        Ok(DeviceChannel {
            file,
            page_size: crate::page_size(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl ControlChannel for DeviceChannel {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn transact(&mut self, request: &mut Request, data: &mut [u8]) -> KmemResult<()> {
        let address = prepare(request, data, self.page_size)?;
        let mut record = request.encode();

        // SAFETY: `record` is the full record for this command, and `data_buf` points at `data`,
        // which holds at least a page; both outlive the call.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_file().as_raw_fd(),
                request.command().code() as _,
                record.as_mut_ptr(),
            )
        };
        let status = if rc < 0 {
            -std::io::Error::last_os_error().raw_os_error().unwrap_or(errno::EIO)
        } else {
            0
        };

        check_status(status, address)?;
        request.update_from(&record)
    }
}

/// A channel to a [`PageDevice`] in the same process.
///
/// Requests take the same path as through the character device: they are encoded to a record,
/// dispatched by command code and decoded again.
pub struct LocalChannel<'a, H: MemoryHost> {
    device: &'a PageDevice<H>,
}

impl<'a, H: MemoryHost> LocalChannel<'a, H> {
    pub fn new(device: &'a PageDevice<H>) -> LocalChannel<'a, H> {
        LocalChannel { device }
    }
}

impl<H: MemoryHost> ControlChannel for LocalChannel<'_, H> {
    fn page_size(&self) -> u64 {
        self.device.service().page_size()
    }

    fn transact(&mut self, request: &mut Request, data: &mut [u8]) -> KmemResult<()> {
        let address = prepare(request, data, self.page_size())?;
        let mut record = request.encode();
        let status = self
            .device
            .ioctl(request.command().code(), &mut record, &mut UserSlice::new(data));
        check_status(status, address)?;
        request.update_from(&record)
    }
}
