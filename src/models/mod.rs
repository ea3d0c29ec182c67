// Shoutbox row types and the views built from explicit joins over them

use serde::Serialize;
use std::collections::HashMap;

use crate::core::{EntryId, Role, ShoutTime, TopicId, UserId};

/// Account record created on first successful authentication
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserInfo {
    pub id: UserId,
    pub ext_id: String,
    pub email: String,
    pub enabled: bool,
    pub role: Role,
}

impl UserInfo {
    /// Admin rights require both the role and an enabled account
    pub fn is_admin(&self) -> bool {
        self.enabled && self.role == Role::Admin
    }
}

/// Display identity owned 1:1 by a user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Author {
    pub id: i64,
    pub user_id: UserId,
    pub name: String,
    pub picture: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    pub description: String,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub id: EntryId,
    pub ts: ShoutTime,
    pub author_id: UserId,
    pub topic_id: Option<TopicId>,
    pub text: String,
    pub image: Option<String>,
    pub hidden: bool,
}

/// Values for a new `entries` row; the id is assigned by the database
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub ts: ShoutTime,
    pub author_id: UserId,
    pub topic_id: Option<TopicId>,
    pub text: String,
    pub image: Option<String>,
}

/// Author columns joined onto a listed entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorView {
    pub user_id: UserId,
    pub name: String,
    pub picture: Option<String>,
    /// Only populated for admin viewers (drives ban/unban)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// A visible entry as returned by a listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryView {
    pub id: EntryId,
    pub ts: ShoutTime,
    pub text: String,
    pub image: Option<String>,
    pub author: AuthorView,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlagCounts {
    pub like: i64,
    pub flag: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UserFlags {
    pub like: bool,
    pub flag: bool,
}

/// Everything a client needs to render one topic's feed
#[derive(Debug, Clone, Serialize)]
pub struct Feed {
    pub topic: Option<Topic>,
    pub entries: Vec<EntryView>,
    pub entry_flag_counts: HashMap<EntryId, FlagCounts>,
    pub user_entry_flags: HashMap<EntryId, UserFlags>,
}
