//! Local-file-backed target driver.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use snafu::ResultExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{check_bounds, DriverError, IoSnafu};

#[cfg(unix)]
const FILE_MODE_OWNER_RW_GROUP_RO: u32 = 0o640;

/// A target backed by one local file, created fresh at init.
///
/// The file is an opaque slab addressed by allocator offsets; its previous
/// contents are never recovered, so it is truncated on open. Reads past the
/// written extent zero-fill: an EOF short-read is not an error, it is an
/// unwritten region.
#[derive(Debug)]
pub struct FileDriver {
    path: PathBuf,
    capacity: u64,
    file: Mutex<tokio::fs::File>,
}

impl FileDriver {
    pub async fn open(path: &Path, capacity: u64) -> Result<Self, DriverError> {
        let mut open_options = OpenOptions::new();
        open_options.read(true).write(true).create(true).truncate(true);

        #[cfg(unix)]
        open_options.mode(FILE_MODE_OWNER_RW_GROUP_RO);

        let file = open_options
            .open(path)
            .await
            .context(IoSnafu { offset: 0u64 })?;

        Ok(Self {
            path: path.to_path_buf(),
            capacity,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DriverError> {
        check_bounds(offset, data.len() as u64, self.capacity)?;
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .context(IoSnafu { offset })?;
        file.write_all(data).await.context(IoSnafu { offset })?;
        Ok(())
    }

    pub async fn read_at(&self, offset: u64, len: u64) -> Result<Bytes, DriverError> {
        check_bounds(offset, len, self.capacity)?;
        let len = usize::try_from(len).expect("length fits after bounds check");
        let mut buf = BytesMut::zeroed(len);

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .context(IoSnafu { offset })?;

        // Read until the buffer fills or EOF; whatever EOF leaves behind
        // stays zeroed.
        let mut filled = 0;
        while filled < len {
            let n = file
                .read(&mut buf[filled..])
                .await
                .context(IoSnafu { offset })?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        Ok(buf.freeze())
    }

    pub async fn flush(&self) -> Result<(), DriverError> {
        let file = self.file.lock().await;
        file.sync_all().await.context(IoSnafu { offset: 0u64 })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use temp_dir::TempDir;

    use super::*;

    #[tokio::test]
    async fn round_trips_bytes_at_offsets() {
        let dir = TempDir::new().unwrap();
        let driver = FileDriver::open(&dir.path().join("slab"), 1 << 20).await.unwrap();
        driver.write_at(8192, b"cold bytes").await.unwrap();
        let read = driver.read_at(8192, 10).await.unwrap();
        assert_eq!(&read[..], b"cold bytes");
    }

    #[tokio::test]
    async fn reads_of_unwritten_regions_zero_fill() {
        let dir = TempDir::new().unwrap();
        let driver = FileDriver::open(&dir.path().join("slab"), 1 << 20).await.unwrap();
        driver.write_at(0, b"xyz").await.unwrap();

        // Entirely past EOF.
        let read = driver.read_at(65536, 128).await.unwrap();
        assert_eq!(read.len(), 128);
        assert!(read.iter().all(|b| *b == 0));

        // Straddling EOF: the written prefix comes back, the tail zero-fills.
        let read = driver.read_at(0, 8).await.unwrap();
        assert_eq!(&read[..3], b"xyz");
        assert!(read[3..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn open_truncates_previous_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slab");
        {
            let driver = FileDriver::open(&path, 1 << 20).await.unwrap();
            driver.write_at(0, b"stale").await.unwrap();
            driver.flush().await.unwrap();
        }
        let driver = FileDriver::open(&path, 1 << 20).await.unwrap();
        let read = driver.read_at(0, 5).await.unwrap();
        assert!(read.iter().all(|b| *b == 0));
    }
}
