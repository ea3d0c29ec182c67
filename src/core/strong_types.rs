// Strong Types - newtype ids and small enums shared by every layer
// Rows reference each other only through these ids; joins are explicit.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Strongly-typed user id (primary key of `users`)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserId(pub i64);

/// Strongly-typed entry id (primary key of `entries`)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct EntryId(pub i64);

/// Strongly-typed topic id (primary key of `topics`)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct TopicId(pub i64);

macro_rules! impl_id_conversions {
    ($($id:ident),*) => {
        $(
            impl $id {
                /// Get the raw id value
                pub fn value(self) -> i64 {
                    self.0
                }
            }

            impl fmt::Display for $id {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<i64> for $id {
                fn from(id: i64) -> Self {
                    Self(id)
                }
            }

            impl From<$id> for i64 {
                fn from(id: $id) -> Self {
                    id.0
                }
            }
        )*
    };
}

impl_id_conversions!(UserId, EntryId, TopicId);

/// Server-assigned timestamp, stored as UTC microseconds so it sorts as an integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct ShoutTime(pub i64);

impl ShoutTime {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_micros())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_micros())
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.0).unwrap_or_default()
    }
}

impl fmt::Display for ShoutTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339_opts(SecondsFormat::Secs, false))
    }
}

// Clients see whole-second RFC 3339 timestamps.
impl Serialize for ShoutTime {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Kind of marker a user can put on an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    Like,
    Flag,
}

impl FlagType {
    pub fn as_str(self) -> &'static str {
        match self {
            FlagType::Like => "like",
            FlagType::Flag => "flag",
        }
    }
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for FlagType {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "like" => Ok(FlagType::Like),
            "flag" => Ok(FlagType::Flag),
            other => Err(format!("unknown flag type '{}'", other)),
        }
    }
}

/// Permission level of a user account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Member,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }

    /// Unknown values degrade to `Member`
    pub fn parse(value: &str) -> Self {
        match value {
            "admin" => Role::Admin,
            _ => Role::Member,
        }
    }
}
