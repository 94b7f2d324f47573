//! In-flight large-file upload sessions.

use crate::models::file::PartInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One in-flight large-file upload.
///
/// Cached per `file_id` as a non-authoritative accelerator; the provider's
/// part listing is the source of truth.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub file_id: String,

    pub file_name: String,

    /// Declared size of the whole file in bytes.
    pub total_size: u64,

    /// Uploaded parts keyed (and therefore ordered) by part number.
    #[serde(default)]
    pub parts_uploaded: BTreeMap<u32, PartInfo>,
}

impl UploadSession {
    pub fn new(file_id: impl Into<String>, file_name: impl Into<String>, total_size: u64) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            total_size,
            parts_uploaded: BTreeMap::new(),
        }
    }

    /// Replace the recorded parts with a fresh listing.
    pub fn with_parts(mut self, parts: impl IntoIterator<Item = PartInfo>) -> Self {
        self.parts_uploaded = parts
            .into_iter()
            .map(|part| (part.part_number, part))
            .collect();
        self
    }

    pub fn has_part(&self, part_number: u32) -> bool {
        self.parts_uploaded.contains_key(&part_number)
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.parts_uploaded.values().map(|p| p.content_length).sum()
    }

    /// Part numbers in ascending order.
    pub fn part_numbers(&self) -> Vec<u32> {
        self.parts_uploaded.keys().copied().collect()
    }
}
