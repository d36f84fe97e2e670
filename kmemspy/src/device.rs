//! The page service endpoint.
//!
//! A [`PageDevice`] is the registration handle of the service: it is created once when the
//! service starts, dispatches control requests for as long as it lives, and unregisters the
//! service when dropped.

use log::{debug, info};

use crate::channel::LocalChannel;
use crate::host::{MemoryHost, UserMemory};
use crate::protocol::{ioc_type, Request, IOCTL_MAGIC};
use crate::service::PageService;
use crate::{KmemError, KmemResult};

/// The name the endpoint is registered under.
pub const DEVICE_NAME: &str = "kmemspy";

/// Where the endpoint's character device usually lives.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/kmemspy";

/// The registered page service.
pub struct PageDevice<H: MemoryHost> {
    service: PageService<H>,
}

impl<H: MemoryHost> PageDevice<H> {
    /// Brings up the endpoint for the page service over `host`.
    pub fn register(host: H) -> PageDevice<H> {
        let device = PageDevice {
            service: PageService::new(host),
        };
        info!("{}: All memory is now accessible from user mode", DEVICE_NAME);
        device
    }

    pub fn service(&self) -> &PageService<H> {
        &self.service
    }

    /// Serves one control request.
    ///
    /// `record` holds the request record for command `code`; fields the service writes back are
    /// updated in place.  Page contents go to the record's `data_buf` in `user`.
    ///
    /// Returns 0 on success, or a negative errno.
    pub fn ioctl<U: UserMemory + ?Sized>(&self, code: u32, record: &mut [u8], user: &mut U) -> i32 {
        match self.dispatch(code, record, user) {
            Ok(()) => 0,
            Err(e) => {
                debug!("{}: command 0x{:08x} failed: {}", DEVICE_NAME, code, e);
                -e.errno()
            }
        }
    }

    fn dispatch<U: UserMemory + ?Sized>(&self, code: u32, record: &mut [u8], user: &mut U) -> KmemResult<()> {
        if ioc_type(code) != IOCTL_MAGIC {
            return Err(KmemError::Unsupported(code));
        }
        let mut request = Request::decode(code, record)?;
        self.service.handle(&mut request, user)?;
        request.encode_into(record)
    }

    /// Opens an in-process channel to this endpoint.
    pub fn open(&self) -> LocalChannel<'_, H> {
        LocalChannel::new(self)
    }
}

impl<H: MemoryHost> Drop for PageDevice<H> {
    fn drop(&mut self) {
        info!("{}: Shutting down", DEVICE_NAME);
    }
}
