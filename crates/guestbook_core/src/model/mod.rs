//! Guestbook data model.
//!
//! # Responsibility
//! - Define the storage-level document shape (`entity`).
//! - Define typed guestbook records on top of it (`guestbook`).
//!
//! # Invariants
//! - Every persisted record is addressed by a top-level `EntityKey`.
//! - Relationships are explicit key/id properties, not key paths.

pub mod entity;
pub mod guestbook;
