// Flag aggregation - like/flag tallies per entry and the viewer's own markers.
// Counts come only from entry_flags rows; there are no denormalized counters.

use sqlx::Row;
use std::collections::HashMap;

use crate::core::{EntryId, FlagType, UserId};
use crate::database::ShoutDatabase;
use crate::error::AppResult;
use crate::models::{FlagCounts, UserFlags};

/// Like and flag totals for every stored entry, hidden ones included.
/// Entries without markers get zero counts.
/// Flag totals are zeroed unless `include_flags` (admin viewers only).
pub async fn entry_flag_counts(
    db: &ShoutDatabase,
    include_flags: bool,
) -> AppResult<HashMap<EntryId, FlagCounts>> {
    let rows = sqlx::query(
        "SELECT
            e.id AS entry_id,
            COUNT(CASE f.flag_type WHEN 'flag' THEN 1 ELSE NULL END) AS flags,
            COUNT(CASE f.flag_type WHEN 'like' THEN 1 ELSE NULL END) AS likes
         FROM entries e
         LEFT JOIN entry_flags f ON f.entry_id = e.id
         GROUP BY e.id",
    )
    .fetch_all(&db.pool)
    .await?;

    let mut counts = HashMap::with_capacity(rows.len());
    for row in rows {
        let entry_id: EntryId = row.try_get("entry_id")?;
        let flags: i64 = row.try_get("flags")?;
        let likes: i64 = row.try_get("likes")?;
        counts.insert(
            entry_id,
            FlagCounts {
                like: likes,
                flag: if include_flags { flags } else { 0 },
            },
        );
    }
    Ok(counts)
}

/// Which entries the given user has liked or flagged
pub async fn user_entry_flags(
    db: &ShoutDatabase,
    user_id: Option<UserId>,
) -> AppResult<HashMap<EntryId, UserFlags>> {
    let user_id = match user_id {
        Some(id) => id,
        None => return Ok(HashMap::new()),
    };

    let rows = sqlx::query("SELECT entry_id, flag_type FROM entry_flags WHERE user_id = ?")
        .bind(user_id)
        .fetch_all(&db.pool)
        .await?;

    let mut flags: HashMap<EntryId, UserFlags> = HashMap::new();
    for row in rows {
        let entry_id: EntryId = row.try_get("entry_id")?;
        let flag_type: String = row.try_get("flag_type")?;
        let marker = flags.entry(entry_id).or_default();
        match FlagType::try_from(flag_type.as_str()) {
            Ok(FlagType::Like) => marker.like = true,
            Ok(FlagType::Flag) => marker.flag = true,
            Err(e) => tracing::warn!("Skipping entry_flags row for entry {}: {}", entry_id, e),
        }
    }
    Ok(flags)
}
