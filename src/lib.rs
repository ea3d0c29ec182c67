// Shoutbox - topic-scoped short posts with likes, flags and moderation

// Core types and primitives
pub mod core;

// Row types and the SQLite store
pub mod models;
pub mod database;

// Request context, identity and storage boundaries
pub mod infrastructure;

// Business logic: visibility, flags, uploads, submission, moderation
pub mod services;

// HTTP surface and its wiring
pub mod shout_interface;
pub mod app_state;

// Common utilities
pub mod config;
pub mod error;

// Re-exports for convenience
pub use error::{AppError, AppResult};
