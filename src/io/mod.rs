//! Target I/O drivers.
//!
//! Every storage target speaks the same contract: write bytes at an offset,
//! read bytes at an offset, flush. Targets hold a tagged variant rather than
//! a trait object; dispatch is a `match`, and adding a device kind means
//! adding a variant.
//!
//! Drivers never interpret the bytes they carry. Offsets are assigned by the
//! per-target allocator, and a driver's only obligations are bounds checking
//! and the zero-fill rule: a read of a never-written region yields zeroes,
//! not an error.

use std::io;

use bytes::Bytes;
use snafu::Snafu;

use crate::id::TargetId;
use crate::rpc::TransportError;

mod file;
mod ram;
mod remote;

pub use file::FileDriver;
pub use ram::RamDriver;
pub use remote::RemoteDriver;

/// Error raised by a target driver. Surfaced to the blob engine as a tier
/// fault.
#[derive(Debug, Snafu)]
pub enum DriverError {
    #[snafu(display("I/O failed at offset {}: {}", offset, source))]
    Io { offset: u64, source: io::Error },

    #[snafu(display(
        "access [{}, +{}) exceeds target capacity {}",
        offset,
        len,
        capacity
    ))]
    OutOfBounds { offset: u64, len: u64, capacity: u64 },

    #[snafu(display("remote target {} unreachable: {}", target, source))]
    RemoteUnreachable {
        target: TargetId,
        source: TransportError,
    },

    #[snafu(display("remote target {} rejected the request: {}", target, message))]
    RemoteFault { target: TargetId, message: String },
}

/// A storage device driver with a uniform read/write-at-offset contract.
#[derive(Debug)]
pub enum TargetDriver {
    Ram(RamDriver),
    File(FileDriver),
    Remote(RemoteDriver),
}

impl TargetDriver {
    /// Writes `data` at `offset`.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DriverError> {
        match self {
            Self::Ram(driver) => driver.write_at(offset, data),
            Self::File(driver) => driver.write_at(offset, data).await,
            Self::Remote(driver) => driver.write_at(offset, data).await,
        }
    }

    /// Reads `len` bytes starting at `offset`.
    pub async fn read_at(&self, offset: u64, len: u64) -> Result<Bytes, DriverError> {
        match self {
            Self::Ram(driver) => driver.read_at(offset, len),
            Self::File(driver) => driver.read_at(offset, len).await,
            Self::Remote(driver) => driver.read_at(offset, len).await,
        }
    }

    /// Synchronizes any buffered state to the underlying device.
    pub async fn flush(&self) -> Result<(), DriverError> {
        match self {
            Self::Ram(_) => Ok(()),
            Self::File(driver) => driver.flush().await,
            Self::Remote(driver) => driver.flush().await,
        }
    }
}

pub(crate) fn check_bounds(offset: u64, len: u64, capacity: u64) -> Result<(), DriverError> {
    if offset.checked_add(len).is_none_or(|end| end > capacity) {
        return Err(DriverError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}
