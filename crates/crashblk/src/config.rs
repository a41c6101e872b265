use std::path::PathBuf;

use clap::Parser;
use crashblk_transport::DEFAULT_SLOT_CAPACITY;
use thiserror::Error;

const LONG_ABOUT: &str = "\
Provide files locally as block devices, one device per file.

Unless --index is given, a free device slot is chosen automatically for every file. The slot \
assigned to each file is logged once it is connected.

This build has no kernel transport: devices are registered in an in-process slot table only. No \
node is created under /dev, so nothing outside this process can read or write them, and the \
workflow below needs a kernel-backed transport.

Fault injection: send SIGUSR1 to toggle read-only mode. In read-only mode every write request is \
denied with EPERM while reads keep working. This is useful for testing the crash-resilience of an \
application on a given filesystem: create a filesystem of your choice on the device and let the \
application under test write to it. To simulate a crash, send SIGUSR1 and unmount the device. \
Then send another SIGUSR1 and remount the filesystem to check whether the application's \
invariants survived the \"crash\".

Send SIGINT (Ctrl+C) or SIGTERM to disconnect every device and exit.";

#[derive(Parser, Debug)]
#[command(
    name = "crashblk",
    version,
    about = "Provide files locally as block devices with switchable write failures",
    long_about = LONG_ABOUT
)]
pub struct Args {
    /// Backing files to expose
    #[arg(value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Device index for the first file; the following files use consecutive indices
    #[arg(long, env = "CRASHBLK_INDEX", value_name = "N")]
    pub index: Option<u32>,

    /// Number of device slots available to the transport
    #[arg(long, value_name = "N", default_value_t = DEFAULT_SLOT_CAPACITY)]
    pub max_devices: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub files: Vec<PathBuf>,
    pub base_index: Option<u32>,
    pub max_devices: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--max-devices must be at least 1")]
    NoDeviceSlots,

    #[error("--index {index} is outside the {max_devices} available device slots")]
    IndexOutOfRange { index: u32, max_devices: u32 },
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.max_devices == 0 {
            return Err(ConfigError::NoDeviceSlots);
        }
        if let Some(index) = args.index {
            if index >= args.max_devices {
                return Err(ConfigError::IndexOutOfRange {
                    index,
                    max_devices: args.max_devices,
                });
            }
        }
        Ok(Self {
            files: args.files,
            base_index: args.index,
            max_devices: args.max_devices,
        })
    }
}
