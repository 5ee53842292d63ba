use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;

// per-run download accounting, displayed at the end of each entity run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DownloadStats {
    pub files_downloaded: i64,
    pub files_failed: i64,
    pub files_skipped: i64,
    pub bytes_downloaded: i64,
    pub bytes_skipped: i64,
    pub total_retries: i64,
    pub files_requiring_retry: i64,
    pub errors_by_kind: HashMap<String, i64>,
}

impl DownloadStats {
    pub fn record_success(&mut self, bytes: i64) {
        self.files_downloaded += 1;
        self.bytes_downloaded += bytes;
    }

    pub fn record_failure(&mut self, kind: &str) {
        self.files_failed += 1;
        *self.errors_by_kind.entry(kind.to_owned()).or_insert(0) += 1;
    }

    pub fn record_skip(&mut self, bytes: i64) {
        self.files_skipped += 1;
        self.bytes_skipped += bytes;
    }

    pub fn record_retry(&mut self) {
        self.total_retries += 1;
    }

    pub fn record_file_with_retry(&mut self) {
        self.files_requiring_retry += 1;
    }
}

// what process_entity hands back to the operator surface
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub entity_id: EntityId,
    pub messages: i64,
    pub downloaded: i64,
    pub skipped: i64,
    pub bytes_downloaded: i64,
    pub bytes_skipped: i64,
    pub elapsed_seconds: f64,
    pub errors_by_kind: HashMap<String, i64>,
}
