//! Core data models for the media data plane.
//!
//! These entities describe upload sessions, storage allocations, and
//! transform jobs. They live only in memory — durable metadata belongs to
//! the external control plane — and serialize naturally as JSON via `serde`.

pub mod allocation;
pub mod session;
pub mod transform;
