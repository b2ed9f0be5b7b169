//! Memory-backed target driver.

use bytes::Bytes;
use memmap2::MmapMut;
use parking_lot::RwLock;
use snafu::ResultExt;

use super::{check_bounds, DriverError, IoSnafu};

/// A target backed by one pre-allocated anonymous memory region.
///
/// Reads and writes are bounds-checked copies. The region is mapped once at
/// construction; running out of address space at startup is a hard error,
/// never a runtime one.
#[derive(Debug)]
pub struct RamDriver {
    capacity: u64,
    region: RwLock<MmapMut>,
}

impl RamDriver {
    pub fn new(capacity: u64) -> Result<Self, DriverError> {
        let len = usize::try_from(capacity).unwrap_or(usize::MAX);
        let region = MmapMut::map_anon(len).context(IoSnafu { offset: 0u64 })?;
        Ok(Self {
            capacity,
            region: RwLock::new(region),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DriverError> {
        check_bounds(offset, data.len() as u64, self.capacity)?;
        let mut region = self.region.write();
        let start = usize::try_from(offset).expect("offset fits after bounds check");
        region[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_at(&self, offset: u64, len: u64) -> Result<Bytes, DriverError> {
        check_bounds(offset, len, self.capacity)?;
        let region = self.region.read();
        let start = usize::try_from(offset).expect("offset fits after bounds check");
        let len = usize::try_from(len).expect("length fits after bounds check");
        Ok(Bytes::copy_from_slice(&region[start..start + len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes() {
        let driver = RamDriver::new(4096).unwrap();
        driver.write_at(128, b"tiered").unwrap();
        let read = driver.read_at(128, 6).unwrap();
        assert_eq!(&read[..], b"tiered");
    }

    #[test]
    fn unwritten_regions_read_as_zeroes() {
        let driver = RamDriver::new(4096).unwrap();
        let read = driver.read_at(0, 64).unwrap();
        assert!(read.iter().all(|b| *b == 0));
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let driver = RamDriver::new(4096).unwrap();
        assert!(matches!(
            driver.write_at(4090, &[0u8; 16]),
            Err(DriverError::OutOfBounds { .. })
        ));
        assert!(matches!(
            driver.read_at(u64::MAX, 16),
            Err(DriverError::OutOfBounds { .. })
        ));
    }
}
