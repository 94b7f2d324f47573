//! Services behind the HTTP handlers.

pub mod b2_client;
pub mod cache;
pub mod coordinator;
pub mod naming;
pub mod relay;
