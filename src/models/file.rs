//! Wire records for B2 files, large-file parts and upload destinations.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `fileInfo` key holding the original size of a large file.
pub const SRC_SIZE: &str = "src_size";

/// `fileInfo` key holding the original last-modified time (millis).
pub const SRC_LAST_MODIFIED_MILLIS: &str = "src_last_modified_millis";

/// Content type that lets B2 pick the MIME type from the file name.
pub const AUTO_CONTENT_TYPE: &str = "b2/x-auto";

/// One file version as reported by `b2_list_file_versions`,
/// `b2_list_unfinished_large_files` and `b2_start_large_file`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    pub file_id: String,

    pub file_name: String,

    /// `upload` for a completed file, `start` for an unfinished large file.
    #[serde(default)]
    pub action: String,

    #[serde(default)]
    pub content_length: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default)]
    pub file_info: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_timestamp: Option<i64>,
}

impl FileVersion {
    pub fn is_completed(&self) -> bool {
        self.action == "upload"
    }

    pub fn is_unfinished_large_file(&self) -> bool {
        self.action == "start"
    }

    /// Original size recorded in `fileInfo` when the large file was started.
    ///
    /// B2 stores file info values as strings, but numbers are accepted too.
    pub fn src_size(&self) -> Option<u64> {
        match self.file_info.get(SRC_SIZE)? {
            Value::String(s) => s.trim().parse().ok(),
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }
}

/// A single uploaded part of an unfinished large file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartInfo {
    #[serde(default)]
    pub file_id: String,

    /// Part number (1-based).
    pub part_number: u32,

    pub content_length: u64,

    pub content_sha1: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_timestamp: Option<i64>,
}

/// Destination for uploading parts of one large file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartUrl {
    pub file_id: String,
    pub upload_url: String,
    pub authorization_token: String,
}

/// Destination for a single-shot file upload into a bucket.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrl {
    #[serde(default)]
    pub bucket_id: String,
    pub upload_url: String,
    pub authorization_token: String,
}
