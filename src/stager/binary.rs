//! Binary-file stager: pages of an opaque file.

use std::io::SeekFrom;
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use snafu::ResultExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{mapper, StagerParams, STAGE_NO_READ, STAGE_NO_WRITE};
use crate::engine::{CoreError, StagerUnavailableSnafu};
use crate::id::{TagId, UpdateSizeMode};
use crate::internal_events::{BlobStagedIn, BlobStagedOut};
use crate::node::Node;

// The backing file is shared with whatever wrote it originally, so it is
// opened world-accessible, unlike the engine's own slab files.
#[cfg(unix)]
const BACKING_FILE_MODE: u32 = 0o666;

/// Stages pages of one bucket against a binary backing file.
///
/// Handles are opened per call rather than cached; staging traffic is
/// bursty and cold, and per-call opens keep the stager free of shared
/// state.
#[derive(Debug)]
pub struct BinaryFileStager {
    path: PathBuf,
    page_size: u64,
    flags: u32,
}

impl BinaryFileStager {
    pub fn new(tag_name: &str, params: &StagerParams) -> Result<Self, CoreError> {
        if params.page_size == 0 {
            return Err(CoreError::invalid_argument("page_size cannot be zero"));
        }
        Ok(Self {
            path: PathBuf::from(tag_name),
            page_size: params.page_size,
            flags: params.flags,
        })
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    async fn open(&self) -> Result<File, CoreError> {
        let mut open_options = OpenOptions::new();
        open_options.read(true).write(true).create(true);

        #[cfg(unix)]
        open_options.mode(BACKING_FILE_MODE);

        open_options
            .open(&self.path)
            .await
            .context(StagerUnavailableSnafu)
    }

    /// Reads the named page from the backing file and puts it into the
    /// bucket. A short read yields a shorter blob; an empty read creates no
    /// blob at all.
    pub async fn stage_in(
        &self,
        node: &Node,
        tag_id: TagId,
        blob_name: &str,
        score: f32,
    ) -> Result<(), CoreError> {
        if self.flags & STAGE_NO_READ != 0 {
            return Ok(());
        }
        let placement = mapper::decode_page_name(blob_name, self.page_size)?;
        debug!(
            path = %self.path.display(),
            offset = placement.bucket_offset,
            page_size = self.page_size,
            "Staging page in from the backing file."
        );

        let mut file = self.open().await?;
        file.seek(SeekFrom::Start(placement.bucket_offset))
            .await
            .context(StagerUnavailableSnafu)?;

        let page_len = usize::try_from(self.page_size).unwrap_or(usize::MAX);
        let mut page = BytesMut::zeroed(page_len);
        let mut filled = 0;
        while filled < page_len {
            let n = file
                .read(&mut page[filled..])
                .await
                .context(StagerUnavailableSnafu)?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(());
        }

        page.truncate(filled);
        node.write_staged_page(tag_id, blob_name, page.freeze(), score)
            .await?;
        BlobStagedIn {
            bytes: filled as u64,
        }
        .emit();
        Ok(())
    }

    /// Writes blob bytes back to the page's position in the backing file.
    pub async fn stage_out(&self, blob_name: &str, data: &Bytes) -> Result<(), CoreError> {
        if self.flags & STAGE_NO_WRITE != 0 {
            return Ok(());
        }
        let placement = mapper::decode_page_name(blob_name, self.page_size)?;
        debug!(
            path = %self.path.display(),
            offset = placement.bucket_offset,
            bytes = data.len(),
            "Staging page out to the backing file."
        );

        let mut file = self.open().await?;
        file.seek(SeekFrom::Start(placement.bucket_offset))
            .await
            .context(StagerUnavailableSnafu)?;
        file.write_all(data).await.context(StagerUnavailableSnafu)?;
        file.sync_all().await.context(StagerUnavailableSnafu)?;

        BlobStagedOut {
            bytes: data.len() as u64,
        }
        .emit();
        Ok(())
    }

    /// Caps the bucket's externally reported size at the end of this write:
    /// page offset plus blob offset plus payload length.
    pub async fn update_size(
        &self,
        node: &Node,
        tag_id: TagId,
        blob_name: &str,
        blob_offset: u64,
        data_size: u64,
    ) -> Result<(), CoreError> {
        let placement = mapper::decode_page_name(blob_name, self.page_size)?;
        let end = placement.bucket_offset + blob_offset + data_size;
        let end = i64::try_from(end)
            .map_err(|_| CoreError::invalid_argument("bucket size overflows"))?;
        node.tag_update_size(tag_id, end, UpdateSizeMode::Cap).await
    }
}
