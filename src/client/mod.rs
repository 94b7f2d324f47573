//! Client side of the upload protocol, used by `--upload`.

pub mod chunker;
pub mod uploader;
