//! Account-level authorization returned by `b2_authorize_account`.

use serde::{Deserialize, Serialize};

/// The credential pair used to obtain an [`AccountAuth`].
///
/// Kept by the client only; never cached or serialized.
#[derive(Clone)]
pub struct B2Credentials {
    /// Application key id (the account id for master keys).
    pub account_id: String,

    /// Application key secret.
    pub application_key: String,
}

impl std::fmt::Debug for B2Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B2Credentials")
            .field("account_id", &self.account_id)
            .field("application_key", &"<redacted>")
            .finish()
    }
}

/// Account authorization for the B2 API.
///
/// Refreshed as a whole when B2 reports the token as bad or expired; never
/// mutated in place.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountAuth {
    /// Account the token belongs to.
    pub account_id: String,

    /// Bearer token sent in the `Authorization` header of API calls.
    pub authorization_token: String,

    /// Base URL for all API calls other than authorization.
    pub api_url: String,

    /// Base URL for downloads.
    #[serde(default)]
    pub download_url: String,

    /// Bucket restrictions attached to the application key.
    #[serde(default)]
    pub allowed: AllowedScope,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_part_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_minimum_part_size: Option<u64>,
}

/// The `allowed` block of an authorization response.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllowedScope {
    #[serde(default)]
    pub bucket_id: Option<String>,

    #[serde(default)]
    pub bucket_name: Option<String>,

    #[serde(default)]
    pub name_prefix: Option<String>,
}

impl AccountAuth {
    /// Bucket the key is restricted to, if any.
    pub fn allowed_bucket_id(&self) -> Option<&str> {
        self.allowed.bucket_id.as_deref()
    }

    /// Full URL of a v2 API operation, e.g. `b2_list_parts`.
    pub fn endpoint(&self, operation: &str) -> String {
        format!(
            "{}/b2api/v2/{}",
            self.api_url.trim_end_matches('/'),
            operation
        )
    }
}
