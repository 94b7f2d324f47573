//! Destination naming for uploads.
//!
//! Clients only ever suggest a name; the server decides where the object
//! lands in the bucket.

/// Maps a client-supplied file name to a server-controlled destination.
pub trait FileNamePolicy: Send + Sync {
    /// Destination name for `requested`, or `None` to refuse the upload.
    fn resolve(&self, requested: &str, file_size: u64) -> Option<String>;
}

/// Last path component of `name`, ignoring both `/` and `\` separators.
///
/// Returns `None` for names that reduce to nothing usable (empty, `.`, `..`)
/// or that contain control characters, which B2 rejects anyway.
pub fn basename(name: &str) -> Option<&str> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." || base.chars().any(char::is_control) {
        return None;
    }
    Some(base)
}

/// Places every upload under a fixed folder, keeping only the basename of
/// whatever the client asked for.
#[derive(Debug, Clone)]
pub struct PrefixedBasename {
    prefix: String,
}

impl PrefixedBasename {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl FileNamePolicy for PrefixedBasename {
    fn resolve(&self, requested: &str, _file_size: u64) -> Option<String> {
        basename(requested).map(|base| format!("{}{}", self.prefix, base))
    }
}
