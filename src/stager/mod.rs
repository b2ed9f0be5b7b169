//! Staging: mirroring buckets against external backing sources.
//!
//! A stager is registered per bucket at creation time when the bucket's
//! parameter pack names a protocol. Stagers pull pages in from the backing
//! source on read misses, push dirty pages back out during flush passes,
//! and keep the bucket's externally reported size tracking the highest
//! written byte.
//!
//! Stagers hold a tagged variant per protocol; the parameter pack's leading
//! protocol string discriminates. Only the binary file protocol exists
//! today, and future protocols slot in as further variants.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::engine::CoreError;
use crate::id::TagId;
use crate::node::Node;

pub mod binary;
pub mod mapper;

pub use binary::BinaryFileStager;

/// Stage-in is disabled for the bucket: read misses stay misses.
pub const STAGE_NO_READ: u32 = 1 << 0;

/// Stage-out is disabled for the bucket: flushes never touch the backing
/// source.
pub const STAGE_NO_WRITE: u32 = 1 << 1;

const FILE_PROTOCOL: &str = "file";

/// Decoded stager parameter pack.
///
/// Wire form is a length-prefixed little-endian sequence: protocol string
/// length (`u64`) and bytes, flags (`u32`), page size (`u64`). The protocol
/// string discriminates future stager kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagerParams {
    pub protocol: String,
    pub flags: u32,
    pub page_size: u64,
}

impl StagerParams {
    /// Parameters for a binary-file-backed bucket.
    pub fn file(page_size: u64, flags: u32) -> Self {
        Self {
            protocol: FILE_PROTOCOL.to_string(),
            flags,
            page_size,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.protocol.len() + 20);
        buf.put_u64_le(self.protocol.len() as u64);
        buf.put_slice(self.protocol.as_bytes());
        buf.put_u32_le(self.flags);
        buf.put_u64_le(self.page_size);
        buf.to_vec()
    }

    pub fn decode(mut raw: &[u8]) -> Result<Self, CoreError> {
        if raw.remaining() < 8 {
            return Err(CoreError::invalid_argument(
                "stager parameter pack is truncated",
            ));
        }
        let protocol_len = usize::try_from(raw.get_u64_le())
            .map_err(|_| CoreError::invalid_argument("stager protocol length overflows"))?;
        if raw.remaining() < protocol_len {
            return Err(CoreError::invalid_argument(
                "stager parameter pack is truncated",
            ));
        }
        let protocol = String::from_utf8(raw.copy_to_bytes(protocol_len).to_vec())
            .map_err(|_| CoreError::invalid_argument("stager protocol is not UTF-8"))?;
        if raw.remaining() < 4 + 8 {
            return Err(CoreError::invalid_argument(
                "stager parameter pack is truncated",
            ));
        }
        let flags = raw.get_u32_le();
        let page_size = raw.get_u64_le();
        Ok(Self {
            protocol,
            flags,
            page_size,
        })
    }
}

/// A registered stager, one per file-backed bucket.
#[derive(Debug)]
pub enum StagerKind {
    File(BinaryFileStager),
}

impl StagerKind {
    /// Builds a stager from a bucket's parameter pack. The bucket's name is
    /// the backing path for the file protocol.
    pub fn from_params(tag_name: &str, params: &[u8]) -> Result<Self, CoreError> {
        let params = StagerParams::decode(params)?;
        match params.protocol.as_str() {
            FILE_PROTOCOL => Ok(Self::File(BinaryFileStager::new(tag_name, &params)?)),
            other => Err(CoreError::invalid_argument(format!(
                "unknown stager protocol '{other}'"
            ))),
        }
    }

    /// Pulls the named page in from the backing source and puts it into the
    /// bucket. A no-op when staging reads is disabled; a zero-length read
    /// creates no blob.
    pub async fn stage_in(
        &self,
        node: &Node,
        tag_id: TagId,
        blob_name: &str,
        score: f32,
    ) -> Result<(), CoreError> {
        match self {
            Self::File(stager) => stager.stage_in(node, tag_id, blob_name, score).await,
        }
    }

    /// Pushes blob bytes out to the backing source at the page's position.
    pub async fn stage_out(&self, blob_name: &str, data: &Bytes) -> Result<(), CoreError> {
        match self {
            Self::File(stager) => stager.stage_out(blob_name, data).await,
        }
    }

    /// Ratchets the bucket's externally reported size up to the end of this
    /// write.
    pub async fn update_size(
        &self,
        node: &Node,
        tag_id: TagId,
        blob_name: &str,
        blob_offset: u64,
        data_size: u64,
    ) -> Result<(), CoreError> {
        match self {
            Self::File(stager) => {
                stager
                    .update_size(node, tag_id, blob_name, blob_offset, data_size)
                    .await
            }
        }
    }

    pub fn page_size(&self) -> u64 {
        match self {
            Self::File(stager) => stager.page_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_pack_round_trips() {
        let params = StagerParams::file(4096, STAGE_NO_WRITE);
        let decoded = StagerParams::decode(&params.encode()).unwrap();
        assert_eq!(params, decoded);
    }

    #[test]
    fn truncated_packs_are_rejected() {
        let raw = StagerParams::file(4096, 0).encode();
        for cut in [0, 4, raw.len() - 1] {
            let err = StagerParams::decode(&raw[..cut]).unwrap_err();
            assert!(matches!(err, CoreError::InvalidArgument { .. }));
        }
    }

    #[test]
    fn unknown_protocols_are_rejected() {
        let params = StagerParams {
            protocol: "object-store".to_string(),
            flags: 0,
            page_size: 4096,
        };
        let err = StagerKind::from_params("/tmp/backing", &params.encode()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let params = StagerParams::file(0, 0);
        let err = StagerKind::from_params("/tmp/backing", &params.encode()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
    }
}
