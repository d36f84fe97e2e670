//! Dumps physical memory, or the virtual memory of a process, as annotated hex.
//!
//! ```text
//! kmemspy [--phys | -p <pid>] <start_hex> <size_hex>
//! ```

use clap::{ArgGroup, Parser, ValueEnum};
use log::debug;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use kmemspy::channel::DeviceChannel;
use kmemspy::client::{Client, RegionSnapshot};
use kmemspy::device::{PageDevice, DEFAULT_DEVICE_PATH};
use kmemspy::host::{ProcfsHost, DEFAULT_MEM_DEVICE, DEFAULT_PROC_ROOT};
use kmemspy::{KmemResult, MemoryRegion, RegionKind};

/// How to reach the page service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Through the page service's character device
    Device,
    /// Run the page service in-process, on top of procfs and the memory device
    Procfs,
}

/// Dump physical memory or the virtual memory of a process
#[derive(Debug, Parser)]
#[command(name = "kmemspy", version)]
#[command(group(ArgGroup::new("mode").required(true).args(["phys", "pid"])))]
struct Args {
    /// Read physical memory
    #[arg(long)]
    phys: bool,

    /// Read the virtual memory of this process
    #[arg(short, long)]
    pid: Option<u32>,

    /// Start address, in hex, 4-byte aligned
    #[arg(value_parser = parse_hex)]
    start: u64,

    /// Number of bytes, in hex, 4-byte aligned
    #[arg(value_parser = parse_hex)]
    size: u64,

    /// The page service's character device
    #[arg(long, env = "KMEMSPY_DEVICE", default_value = DEFAULT_DEVICE_PATH)]
    device: PathBuf,

    #[arg(long, value_enum, env = "KMEMSPY_BACKEND", default_value_t = Backend::Device)]
    backend: Backend,

    /// Where procfs is mounted, for the procfs backend
    #[arg(long, default_value = DEFAULT_PROC_ROOT)]
    proc_root: PathBuf,

    /// The physical memory device, for the procfs backend
    #[arg(long, default_value = DEFAULT_MEM_DEVICE)]
    mem_device: PathBuf,
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex number {:?}: {}", s, e))
}

fn read(args: &Args, region: &MemoryRegion) -> KmemResult<RegionSnapshot> {
    match args.backend {
        Backend::Device => Client::new(DeviceChannel::open(&args.device)?).read_region(region),
        Backend::Procfs => {
            let device = PageDevice::register(ProcfsHost::with_paths(&args.proc_root, &args.mem_device)?);
            let snapshot = Client::new(device.open()).read_region(region);
            snapshot
        }
    }
}

fn run(args: &Args) -> KmemResult<()> {
    let kind = match args.pid {
        Some(pid) => RegionKind::Virtual(pid),
        None => RegionKind::Physical,
    };
    let region = MemoryRegion::new(args.start, args.size, kind)?;
    debug!("{:?} over {:?}", region, args.backend);

    let snapshot = read(args, &region)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    snapshot.write_hex_dump(&mut out)?;
    out.flush()?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("KMEMSPY_LOG", "warn")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    if let Err(e) = run(&args) {
        eprintln!("kmemspy: {}", e);
        process::exit(1);
    }
}
