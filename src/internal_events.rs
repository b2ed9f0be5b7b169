//! Telemetry emitted by the engine, one struct per event.

use metrics::{counter, gauge};

use crate::id::TargetId;

pub struct TagCreated<'a> {
    pub name: &'a str,
    pub file_backed: bool,
}

impl TagCreated<'_> {
    pub fn emit(self) {
        debug!(message = "Tag created.", name = %self.name, file_backed = %self.file_backed);
        counter!("strata_tags_created_total", 1);
    }
}

pub struct TagDestroyed<'a> {
    pub name: &'a str,
}

impl TagDestroyed<'_> {
    pub fn emit(self) {
        debug!(message = "Tag destroyed.", name = %self.name);
        counter!("strata_tags_destroyed_total", 1);
    }
}

pub struct BlobWritten {
    pub bytes: u64,
}

impl BlobWritten {
    pub fn emit(self) {
        counter!("strata_blob_written_bytes_total", self.bytes);
        counter!("strata_blob_writes_total", 1);
    }
}

pub struct BlobRead {
    pub bytes: u64,
}

impl BlobRead {
    pub fn emit(self) {
        counter!("strata_blob_read_bytes_total", self.bytes);
        counter!("strata_blob_reads_total", 1);
    }
}

pub struct BlobDestroyed {
    pub bytes: u64,
}

impl BlobDestroyed {
    pub fn emit(self) {
        counter!("strata_blob_destroyed_bytes_total", self.bytes);
    }
}

pub struct BlobStagedIn {
    pub bytes: u64,
}

impl BlobStagedIn {
    pub fn emit(self) {
        counter!("strata_staged_in_bytes_total", self.bytes);
    }
}

pub struct BlobStagedOut {
    pub bytes: u64,
}

impl BlobStagedOut {
    pub fn emit(self) {
        counter!("strata_staged_out_bytes_total", self.bytes);
    }
}

pub struct BlobFlushed {
    pub bytes: u64,
}

impl BlobFlushed {
    pub fn emit(self) {
        counter!("strata_flushed_bytes_total", self.bytes);
    }
}

pub struct ReorganizationComplete {
    pub moved: bool,
}

impl ReorganizationComplete {
    pub fn emit(self) {
        if self.moved {
            counter!("strata_reorganizations_total", 1);
        } else {
            counter!("strata_reorganizations_abandoned_total", 1);
        }
    }
}

pub struct PlacementFailed {
    pub bytes: u64,
}

impl PlacementFailed {
    pub fn emit(self) {
        error!(
            message = "No placement covers the write.",
            bytes = %self.bytes,
        );
        counter!("strata_placement_failures_total", 1);
    }
}

pub struct TierFaultRecovered {
    pub target: TargetId,
}

impl TierFaultRecovered {
    pub fn emit(self) {
        counter!(
            "strata_tier_faults_total", 1,
            "target" => self.target.to_string(),
        );
    }
}

pub struct TargetUtilization {
    pub target: TargetId,
    pub capacity: u64,
    pub remaining: u64,
}

impl TargetUtilization {
    pub fn emit(self) {
        #[allow(clippy::cast_precision_loss)]
        let used = (self.capacity - self.remaining) as f64;
        gauge!(
            "strata_target_used_bytes", used,
            "target" => self.target.to_string(),
        );
    }
}
