//! Core data models for the B2 upload relay.
//!
//! These mirror the B2 v2 wire format (camelCase JSON) and are stored in the
//! token cache as JSON via `serde`.

pub mod auth;
pub mod file;
pub mod session;
pub mod small_file;
