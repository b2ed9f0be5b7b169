//! Page-name codec for file-backed buckets.
//!
//! A blob in a file-backed bucket is one page of the backing file, and its
//! name *is* its placement: a fixed-width decimal encoding of the page
//! index. The encoding round-trips, is stable across processes, and sorts
//! lexicographically in page order, so a directory listing of blob names
//! walks the file front to back.

use crate::engine::CoreError;

/// Width of an encoded page name: enough decimal digits for any `u64`.
pub const PAGE_NAME_WIDTH: usize = 20;

/// Where a page-named blob sits inside its bucket's backing file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PagePlacement {
    pub page_index: u64,
    pub page_size: u64,
    pub bucket_offset: u64,
}

/// Encodes a page index as a fixed-width blob name.
pub fn encode_page_name(page_index: u64) -> String {
    format!("{page_index:020}")
}

/// Decodes a page-named blob back into its placement.
pub fn decode_page_name(name: &str, page_size: u64) -> Result<PagePlacement, CoreError> {
    if page_size == 0 {
        return Err(CoreError::invalid_argument("page_size cannot be zero"));
    }
    if name.len() != PAGE_NAME_WIDTH || !name.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreError::invalid_argument(format!(
            "'{name}' is not a page name"
        )));
    }
    let page_index: u64 = name
        .parse()
        .map_err(|_| CoreError::invalid_argument(format!("page index in '{name}' overflows")))?;
    let bucket_offset = page_index
        .checked_mul(page_size)
        .ok_or_else(|| CoreError::invalid_argument(format!("page offset of '{name}' overflows")))?;

    Ok(PagePlacement {
        page_index,
        page_size,
        bucket_offset,
    })
}
