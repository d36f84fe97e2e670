#![allow(unknown_lints)]
#![deny(rustdoc::broken_intra_doc_links, rustdoc::invalid_html_tags)]
//! Data structures and parsing for the kmemspy page service.
//!
//! This crate holds everything that doesn't need to touch the running system:
//!
//! * The control channel [protocol](crate::protocol): command codes, the fixed-layout request
//!   records and the errno translation done at the protocol boundary.
//! * The request model: a [`MemoryRegion`], its [`FrameFootprint`], fetched [`PageFrame`]s and
//!   the [`TranslationEntry`] synthesized for virtual lookups.
//! * Reconstruction of an unaligned byte range out of whole pages ([`assemble_region`]) and the
//!   annotated [`HexDump`] rendering.
//! * Parsers for the procfs files a Linux host resolves pages with: `/proc/<pid>/maps`,
//!   `/proc/<pid>/pagemap` entries and `/proc/iomem`.
//!
//! The `kmemspy` crate builds the page service, the channels and the client on top of this.
//!
//! # Cargo features
//!
//! * `serde1` -- Optional.  Derives `Serialize`/`Deserialize` for the data model.
//! * `backtrace` -- Optional.  Captures a stack trace whenever an `InternalError` is raised.

use std::fmt;

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

macro_rules! expect {
    ($e:expr) => {
        match crate::IntoResult::into($e) {
            Ok(v) => v,
            Err(e) => return Err(build_internal_error!(e)),
        }
    };
    ($e:expr, $msg:expr) => {
        match crate::IntoResult::into($e) {
            Ok(v) => v,
            Err(e) => return Err(build_internal_error!(e, $msg)),
        }
    };
}

macro_rules! from_str {
    ($t:tt, $e:expr) => {{
        let e = $e;
        expect!(
            $t::from_str_radix(e, 10),
            format!("Failed to parse {} ({:?}) as a {}", stringify!($e), e, stringify!($t),)
        )
    }};
    ($t:tt, $e:expr, $radix:expr) => {{
        let e = $e;
        expect!(
            $t::from_str_radix(e, $radix),
            format!("Failed to parse {} ({:?}) as a {}", stringify!($e), e, stringify!($t))
        )
    }};
}

mod error;
pub use error::*;

pub mod protocol;

mod page;
pub use page::*;

mod region;
pub use region::*;

mod hexdump;
pub use hexdump::*;

mod iomem;
pub use iomem::*;

pub mod process;

pub(crate) trait IntoResult<T, E> {
    fn into(t: Self) -> Result<T, E>;
}

impl<T> IntoResult<T, NoneError> for Option<T> {
    fn into(t: Option<T>) -> Result<T, NoneError> {
        t.ok_or(NoneError)
    }
}

impl<T, E> IntoResult<T, E> for Result<T, E> {
    fn into(t: Result<T, E>) -> Result<T, E> {
        t
    }
}

/// Carried by an `InternalError` when `expect!` was handed a `None`.
#[derive(Debug)]
pub(crate) struct NoneError;

impl fmt::Display for NoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NoneError")
    }
}

/// Parses something like `0000000000400000-0000000000452000` into a pair of numbers.
fn split_into_num<T: FromStrRadix>(s: &str, sep: char, radix: u32) -> KmemResult<(T, T)> {
    let mut s = s.split(sep);
    let a = expect!(FromStrRadix::from_str_radix(expect!(s.next()), radix));
    let b = expect!(FromStrRadix::from_str_radix(expect!(s.next()), radix));
    Ok((a, b))
}

trait FromStrRadix: Sized {
    fn from_str_radix(t: &str, radix: u32) -> Result<Self, std::num::ParseIntError>;
}

impl FromStrRadix for u64 {
    fn from_str_radix(s: &str, radix: u32) -> Result<u64, std::num::ParseIntError> {
        u64::from_str_radix(s, radix)
    }
}

impl FromStrRadix for i32 {
    fn from_str_radix(s: &str, radix: u32) -> Result<i32, std::num::ParseIntError> {
        i32::from_str_radix(s, radix)
    }
}
