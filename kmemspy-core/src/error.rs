use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// The broad class of a [`KmemError`].
///
/// Every error raised by the page service, a control channel or the client falls into one of
/// these.  The basic kinds survive a trip across the control channel as an errno value, see
/// [`KmemError::errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or misaligned input, or conflicting modes.
    InvalidArgument,
    /// No such process, no memory context, or an unsupported command.
    NotFound,
    /// The page is unmapped, could not be pinned, or is not backed by RAM.
    InvalidAddress,
    /// A copy across the address space boundary could not complete.
    IoFault,
    /// The control channel could not be opened.
    ServiceUnavailable,
    /// A bug in kmemspy.
    Internal,
}

/// The various error conditions in the kmemspy crates.
pub enum KmemError {
    /// Rejected operator input, such as a region that isn't 4-byte aligned.
    InvalidArgument(String),
    /// A process, memory context or page could not be found.
    NotFound(String),
    /// A command code the page service doesn't implement.
    Unsupported(u32),
    /// The page at the given byte address cannot be served.
    InvalidAddress(u64),
    /// Copying page contents to or from a caller buffer failed.
    IoFault(String),
    /// The control channel at the given path could not be opened.
    ServiceUnavailable(Option<PathBuf>),
    /// Any other IO error, with the path of the file involved when known.
    Io(io::Error, Option<PathBuf>),
    /// A fetch of one page of a region failed.
    Page {
        /// Byte address of the page that failed.
        address: u64,
        /// Whether the page was requested by physical frame number.
        physical: bool,
        source: Box<KmemError>,
    },
    /// A bug in kmemspy.  Please report it.
    InternalError(InternalError),
}

/// The result type used throughout.
pub type KmemResult<T> = Result<T, KmemError>;

impl KmemError {
    /// Returns the class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KmemError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            KmemError::NotFound(_) | KmemError::Unsupported(_) => ErrorKind::NotFound,
            KmemError::InvalidAddress(_) => ErrorKind::InvalidAddress,
            KmemError::IoFault(_) | KmemError::Io(..) => ErrorKind::IoFault,
            KmemError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            KmemError::Page { source, .. } => source.kind(),
            KmemError::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Attaches the address of the page being fetched when this error happened.
    pub fn at_page(self, address: u64, physical: bool) -> KmemError {
        KmemError::Page {
            address,
            physical,
            source: Box::new(self),
        }
    }
}

/// An internal error in kmemspy.
///
/// If you encounter this error, consider it a bug and please report it.
///
/// If you compile with the optional `backtrace` feature the backtrace is captured too.
pub struct InternalError {
    pub msg: String,
    pub file: &'static str,
    pub line: u32,
    #[cfg(feature = "backtrace")]
    pub backtrace: backtrace::Backtrace,
}

impl fmt::Debug for InternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bug at {}:{} (please report): {}", self.file, self.line, self.msg)?;
        #[cfg(feature = "backtrace")]
        write!(f, "\n{:?}", self.backtrace)?;
        Ok(())
    }
}

impl fmt::Display for InternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bug at {}:{} (please report): {}", self.file, self.line, self.msg)
    }
}

/// Wraps an IO error together with the path that produced it.
///
/// The `kmemspy` file wrapper stashes one of these inside every `io::Error` it returns, so that
/// the conversion into a [`KmemError`] can recover the path.
#[derive(Debug)]
pub struct IoErrorWrapper {
    pub path: PathBuf,
    pub inner: Box<dyn Error + Send + Sync>,
}

impl Error for IoErrorWrapper {}

impl fmt::Display for IoErrorWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoErrorWrapper({}): {}", self.path.display(), self.inner)
    }
}

impl From<io::Error> for KmemError {
    fn from(io: io::Error) -> Self {
        // the only way we'll have a path for the IO error is if this IO error is a inner type of IoErrorWrapper
        let path: Option<PathBuf> = io
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<IoErrorWrapper>())
            .map(|inner| inner.path.clone());
        match io.kind() {
            io::ErrorKind::NotFound => {
                KmemError::NotFound(path.map_or_else(|| io.to_string(), |p| p.display().to_string()))
            }
            _ => KmemError::Io(io, path),
        }
    }
}

impl From<InternalError> for KmemError {
    fn from(e: InternalError) -> Self {
        KmemError::InternalError(e)
    }
}

impl fmt::Display for KmemError {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            KmemError::InvalidArgument(msg) => write!(f, "{}", msg),
            KmemError::NotFound(what) => write!(f, "not found: {}", what),
            KmemError::Unsupported(code) => write!(f, "command 0x{:08x} not supported", code),
            KmemError::InvalidAddress(address) => write!(f, "invalid address 0x{:x}", address),
            KmemError::IoFault(msg) => write!(f, "I/O fault: {}", msg),
            KmemError::ServiceUnavailable(Some(p)) => write!(f, "failed to open {}", p.display()),
            KmemError::ServiceUnavailable(None) => write!(f, "page service unavailable"),
            KmemError::Io(inner, Some(p)) => write!(f, "error accessing {}: {}", p.display(), inner),
            KmemError::Io(inner, None) => write!(f, "IO error: {}", inner),
            KmemError::Page {
                address,
                physical,
                source,
            } => write!(
                f,
                "failed to read {} page at 0x{:x}: {}",
                if *physical { "physical" } else { "virtual" },
                address,
                source
            ),
            KmemError::InternalError(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl fmt::Debug for KmemError {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            KmemError::InvalidArgument(msg) => f.debug_tuple("InvalidArgument").field(msg).finish(),
            KmemError::NotFound(what) => f.debug_tuple("NotFound").field(what).finish(),
            KmemError::Unsupported(code) => write!(f, "Unsupported(0x{:08x})", code),
            KmemError::InvalidAddress(address) => write!(f, "InvalidAddress(0x{:x})", address),
            KmemError::IoFault(msg) => f.debug_tuple("IoFault").field(msg).finish(),
            KmemError::ServiceUnavailable(p) => f.debug_tuple("ServiceUnavailable").field(p).finish(),
            KmemError::Io(inner, p) => f.debug_tuple("Io").field(inner).field(p).finish(),
            KmemError::Page {
                address,
                physical,
                source,
            } => f
                .debug_struct("Page")
                .field("address", &format_args!("0x{:x}", address))
                .field("physical", physical)
                .field("source", source)
                .finish(),
            KmemError::InternalError(e) => f.debug_tuple("InternalError").field(e).finish(),
        }
    }
}

impl Error for KmemError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            KmemError::Io(inner, _) => Some(inner),
            KmemError::Page { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
