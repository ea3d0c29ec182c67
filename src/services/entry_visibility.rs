// Entry visibility - which entries a feed shows, scoped by topic and the hidden flag

use sqlx::Row;
use tracing::{debug, info};

use crate::core::TopicId;
use crate::database::ShoutDatabase;
use crate::error::{AppError, AppResult};
use crate::infrastructure::viewer::ViewerContext;
use crate::models::{AuthorView, EntryView, Feed, Topic};
use crate::services::flag_aggregation;

/// Longest accepted topic name
pub const MAX_TOPIC_NAME_LEN: usize = 100;

/// Look up a topic by name, creating it on first reference.
///
/// An empty name means "no topic". The description is only used when the
/// topic is created. Concurrent first references converge on one row through
/// the unique name constraint.
pub async fn resolve_topic(
    db: &ShoutDatabase,
    name: Option<&str>,
    description: Option<&str>,
) -> AppResult<Option<Topic>> {
    let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name,
        None => return Ok(None),
    };
    if name.chars().count() > MAX_TOPIC_NAME_LEN {
        return Err(AppError::Validation(format!(
            "Topic names are limited to {} characters.",
            MAX_TOPIC_NAME_LEN
        )));
    }

    if let Some(topic) = db.find_topic_by_name(name).await? {
        return Ok(Some(topic));
    }

    if db
        .insert_topic_if_absent(name, description.unwrap_or_default())
        .await?
    {
        info!("Created topic '{}'", name);
    } else {
        debug!("Topic '{}' was created concurrently", name);
    }

    db.find_topic_by_name(name)
        .await?
        .map(Some)
        .ok_or_else(|| AppError::Internal(format!("Topic '{}' vanished after insert", name)))
}

/// Non-hidden entries of one topic (or of "no topic"), newest first.
/// Equal timestamps fall back to the higher id first.
pub async fn list_visible_entries(
    db: &ShoutDatabase,
    topic_id: Option<TopicId>,
    include_author_status: bool,
) -> AppResult<Vec<EntryView>> {
    let rows = sqlx::query(
        "SELECT e.id, e.ts, e.text, e.image, e.author_id,
                a.name AS author_name, a.picture AS author_picture,
                u.enabled AS author_enabled
         FROM entries e
         JOIN users u ON u.id = e.author_id
         LEFT JOIN authors a ON a.user_id = e.author_id
         WHERE e.hidden = 0 AND e.topic_id IS ?
         ORDER BY e.ts DESC, e.id DESC",
    )
    .bind(topic_id)
    .fetch_all(&db.pool)
    .await?;

    rows.iter()
        .map(|row| {
            let author_enabled: bool = row.try_get("author_enabled")?;
            let author_name: Option<String> = row.try_get("author_name")?;
            Ok(EntryView {
                id: row.try_get("id")?,
                ts: row.try_get("ts")?,
                text: row.try_get("text")?,
                image: row.try_get("image")?,
                author: AuthorView {
                    user_id: row.try_get("author_id")?,
                    name: author_name.unwrap_or_default(),
                    picture: row.try_get("author_picture")?,
                    enabled: include_author_status.then_some(author_enabled),
                },
            })
        })
        .collect()
}

/// Reload everything a client renders for one feed
pub async fn load_feed(
    db: &ShoutDatabase,
    vc: &ViewerContext,
    topic_name: Option<&str>,
    description: Option<&str>,
) -> AppResult<Feed> {
    let is_admin = vc.is_admin();
    let topic = resolve_topic(db, topic_name, description).await?;
    let entries = list_visible_entries(db, topic.as_ref().map(|t| t.id), is_admin).await?;
    let entry_flag_counts = flag_aggregation::entry_flag_counts(db, is_admin).await?;
    let user_entry_flags = flag_aggregation::user_entry_flags(db, vc.user_id()).await?;

    debug!(
        request_id = %vc.request_id,
        entries = entries.len(),
        "Loaded feed for topic {:?}",
        topic.as_ref().map(|t| t.name.as_str())
    );

    Ok(Feed {
        topic,
        entries,
        entry_flag_counts,
        user_entry_flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Role, ShoutTime, UserId};
    use crate::models::NewEntry;
    use std::sync::Arc;

    async fn author(db: &ShoutDatabase) -> UserId {
        db.create_user_with_author("a", "a@example.com", "A", None, Role::Member)
            .await
            .unwrap()
            .0
            .id
    }

    fn new_entry(author_id: UserId, topic_id: Option<TopicId>, ts: i64, text: &str) -> NewEntry {
        NewEntry {
            ts: ShoutTime(ts),
            author_id,
            topic_id,
            text: text.to_string(),
            image: None,
        }
    }

    #[tokio::test]
    async fn test_topic_created_once_with_first_description() {
        let db = ShoutDatabase::new_in_memory().await.unwrap();
        let first = resolve_topic(&db, Some("rust"), Some("All things Rust"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.description, "All things Rust");

        let second = resolve_topic(&db, Some("rust"), Some("ignored")).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.description, "All things Rust");

        assert!(resolve_topic(&db, Some("  "), None).await.unwrap().is_none());
        assert!(resolve_topic(&db, None, Some("x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_first_access_yields_one_topic() {
        let db = Arc::new(ShoutDatabase::new_in_memory().await.unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                tokio::spawn(async move { resolve_topic(&db, Some("race"), None).await })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM topics WHERE name = 'race'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_listing_is_topic_scoped_and_skips_hidden() {
        let db = ShoutDatabase::new_in_memory().await.unwrap();
        let user = author(&db).await;
        let topic = resolve_topic(&db, Some("news"), None).await.unwrap().unwrap();

        let untopiced = db.insert_entry(&new_entry(user, None, 10, "general")).await.unwrap();
        let visible = db.insert_entry(&new_entry(user, Some(topic.id), 20, "news 1")).await.unwrap();
        let hidden = db.insert_entry(&new_entry(user, Some(topic.id), 30, "news 2")).await.unwrap();
        db.set_entry_hidden(hidden.id, true).await.unwrap();

        let news = list_visible_entries(&db, Some(topic.id), false).await.unwrap();
        assert_eq!(news.iter().map(|e| e.id).collect::<Vec<_>>(), vec![visible.id]);

        let general = list_visible_entries(&db, None, false).await.unwrap();
        assert_eq!(general.iter().map(|e| e.id).collect::<Vec<_>>(), vec![untopiced.id]);

        // Still stored
        assert!(db.get_entry(hidden.id).await.unwrap().unwrap().hidden);
    }

    #[tokio::test]
    async fn test_ordering_newest_first_with_id_tiebreak() {
        let db = ShoutDatabase::new_in_memory().await.unwrap();
        let user = author(&db).await;
        let old = db.insert_entry(&new_entry(user, None, 100, "old")).await.unwrap();
        let tie_a = db.insert_entry(&new_entry(user, None, 200, "tie a")).await.unwrap();
        let tie_b = db.insert_entry(&new_entry(user, None, 200, "tie b")).await.unwrap();

        let listed = list_visible_entries(&db, None, false).await.unwrap();
        assert_eq!(
            listed.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![tie_b.id, tie_a.id, old.id]
        );
    }

    #[tokio::test]
    async fn test_author_status_only_for_admins() {
        let db = ShoutDatabase::new_in_memory().await.unwrap();
        let user = author(&db).await;
        db.insert_entry(&new_entry(user, None, 1, "hi")).await.unwrap();

        let member = list_visible_entries(&db, None, false).await.unwrap();
        assert_eq!(member[0].author.enabled, None);
        assert_eq!(member[0].author.name, "A");

        let admin = list_visible_entries(&db, None, true).await.unwrap();
        assert_eq!(admin[0].author.enabled, Some(true));
    }
}
