//! Ephemeral credentials for the small-file relay.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Length of a small-file token (hex SHA-1).
pub const SMALL_FILE_TOKEN_LEN: usize = 40;

/// Stand-in for B2's single-file upload authorization, which cannot carry a
/// destination path.
///
/// The destination name lives only here; the relay never reads it from the
/// live request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SmallFileToken {
    /// Unguessable token value handed to the client.
    pub token: String,

    /// Server-controlled destination name.
    pub file_name: String,

    pub file_size: u64,

    /// Client-reported last-modified time in milliseconds.
    pub last_modified: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_id: Option<String>,
}

impl SmallFileToken {
    /// Issue a token for `file_name`, mixing in 128 random bytes.
    pub fn issue(
        file_name: impl Into<String>,
        file_size: u64,
        last_modified: impl Into<String>,
        bucket_id: Option<String>,
    ) -> Self {
        let file_name = file_name.into();
        let mut entropy = [0u8; 128];
        rand::thread_rng().fill_bytes(&mut entropy);

        let mut hasher = Sha1::new();
        hasher.update(format!("{}-{}-", file_name, file_size).as_bytes());
        hasher.update(entropy);

        Self {
            token: hex::encode(hasher.finalize()),
            file_name,
            file_size,
            last_modified: last_modified.into(),
            bucket_id,
        }
    }

    /// Whether `id` has the shape of a small-file token rather than a B2
    /// large-file id.
    pub fn looks_like_token(id: &str) -> bool {
        id.len() == SMALL_FILE_TOKEN_LEN
    }
}
