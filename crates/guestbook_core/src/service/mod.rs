//! Guestbook use-case services.
//!
//! # Responsibility
//! - Layer conditional writes (create-if-absent, unique create, guarded
//!   rename) over the store transaction primitive.
//! - Orchestrate Book, Greeting and Tag relationships for request handlers.

pub mod conditional_writer;
pub mod guestbook_service;
