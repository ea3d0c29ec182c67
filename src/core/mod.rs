// Shoutbox core types - ids, timestamps and enums used across the crate

pub mod strong_types;

// Re-export commonly used types
pub use strong_types::{EntryId, FlagType, Role, ShoutTime, TopicId, UserId};
