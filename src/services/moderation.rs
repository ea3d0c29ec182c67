// Moderation and reactions - guarded single-row mutations.
// Acting on a missing id is a no-op; every function reports whether anything changed.

use tracing::info;

use crate::core::{EntryId, FlagType, UserId};
use crate::database::ShoutDatabase;
use crate::error::AppResult;
use crate::infrastructure::viewer::ViewerContext;

/// Soft-delete an entry (admin only)
pub async fn hide_entry(db: &ShoutDatabase, vc: &ViewerContext, entry_id: EntryId) -> AppResult<bool> {
    let admin = vc.require_admin()?;
    let changed = db.set_entry_hidden(entry_id, true).await?;
    if changed {
        info!(request_id = %vc.request_id, "Admin {} hid entry {}", admin.id, entry_id);
    }
    Ok(changed)
}

/// Bring a hidden entry back (admin only)
pub async fn unhide_entry(db: &ShoutDatabase, vc: &ViewerContext, entry_id: EntryId) -> AppResult<bool> {
    let admin = vc.require_admin()?;
    let changed = db.set_entry_hidden(entry_id, false).await?;
    if changed {
        info!(request_id = %vc.request_id, "Admin {} restored entry {}", admin.id, entry_id);
    }
    Ok(changed)
}

/// Ban or unban a user (admin only). Earlier entries stay visible.
pub async fn set_enabled(
    db: &ShoutDatabase,
    vc: &ViewerContext,
    user_id: UserId,
    enabled: bool,
) -> AppResult<bool> {
    let admin = vc.require_admin()?;
    let changed = db.set_user_enabled(user_id, enabled).await?;
    if changed {
        info!(
            request_id = %vc.request_id,
            "Admin {} {} user {}",
            admin.id,
            if enabled { "unbanned" } else { "banned" },
            user_id
        );
    }
    Ok(changed)
}

/// Replace a topic's description (admin only)
pub async fn edit_topic_description(
    db: &ShoutDatabase,
    vc: &ViewerContext,
    topic_name: &str,
    description: &str,
) -> AppResult<bool> {
    let admin = vc.require_admin()?;
    let changed = db
        .update_topic_description(topic_name.trim(), description.trim())
        .await?;
    if changed {
        info!(request_id = %vc.request_id, "Admin {} edited topic '{}'", admin.id, topic_name);
    }
    Ok(changed)
}

/// Like an entry. Repeating the like is harmless.
pub async fn like_entry(db: &ShoutDatabase, vc: &ViewerContext, entry_id: EntryId) -> AppResult<bool> {
    add_marker(db, vc, entry_id, FlagType::Like).await
}

/// Flag an entry for moderator attention
pub async fn flag_entry(db: &ShoutDatabase, vc: &ViewerContext, entry_id: EntryId) -> AppResult<bool> {
    add_marker(db, vc, entry_id, FlagType::Flag).await
}

pub async fn unlike_entry(db: &ShoutDatabase, vc: &ViewerContext, entry_id: EntryId) -> AppResult<bool> {
    let user = vc.require_poster()?;
    Ok(db.delete_user_flag(user.id, entry_id, FlagType::Like).await? > 0)
}

/// Remove the caller's own flag; admins clear every flag on the entry
pub async fn unflag_entry(db: &ShoutDatabase, vc: &ViewerContext, entry_id: EntryId) -> AppResult<bool> {
    let user = vc.require_poster()?;
    let removed = if user.is_admin() {
        db.delete_all_flags(entry_id, FlagType::Flag).await?
    } else {
        db.delete_user_flag(user.id, entry_id, FlagType::Flag).await?
    };
    if removed > 0 && user.is_admin() {
        info!(request_id = %vc.request_id, "Admin {} cleared {} flag(s) on entry {}", user.id, removed, entry_id);
    }
    Ok(removed > 0)
}

async fn add_marker(
    db: &ShoutDatabase,
    vc: &ViewerContext,
    entry_id: EntryId,
    flag_type: FlagType,
) -> AppResult<bool> {
    let user = vc.require_poster()?;
    let added = db.add_flag_if_visible(user.id, entry_id, flag_type).await?;
    if added && flag_type == FlagType::Flag {
        info!(request_id = %vc.request_id, "User {} flagged entry {}", user.id, entry_id);
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Role, ShoutTime};
    use crate::error::AppError;
    use crate::models::{FlagCounts, NewEntry};
    use crate::services::flag_aggregation::entry_flag_counts;

    struct Fixture {
        db: ShoutDatabase,
        admin: ViewerContext,
        alice: ViewerContext,
        bob: ViewerContext,
        entry: EntryId,
    }

    async fn viewer(db: &ShoutDatabase, sub: &str, role: Role) -> ViewerContext {
        let (user, author) = db
            .create_user_with_author(sub, &format!("{}@example.com", sub), sub, None, role)
            .await
            .unwrap();
        ViewerContext::authenticated(format!("req-{}", sub), user, author)
    }

    async fn fixture() -> Fixture {
        let db = ShoutDatabase::new_in_memory().await.unwrap();
        let admin = viewer(&db, "admin", Role::Admin).await;
        let alice = viewer(&db, "alice", Role::Member).await;
        let bob = viewer(&db, "bob", Role::Member).await;
        let entry = db
            .insert_entry(&NewEntry {
                ts: ShoutTime::now(),
                author_id: alice.user_id().unwrap(),
                topic_id: None,
                text: "hello".to_string(),
                image: None,
            })
            .await
            .unwrap()
            .id;
        Fixture { db, admin, alice, bob, entry }
    }

    async fn likes(db: &ShoutDatabase, entry: EntryId) -> i64 {
        entry_flag_counts(db, false).await.unwrap()[&entry].like
    }

    #[tokio::test]
    async fn test_like_then_unlike_restores_count() {
        let f = fixture().await;
        assert_eq!(likes(&f.db, f.entry).await, 0);
        assert!(like_entry(&f.db, &f.bob, f.entry).await.unwrap());
        assert_eq!(likes(&f.db, f.entry).await, 1);
        assert!(unlike_entry(&f.db, &f.bob, f.entry).await.unwrap());
        assert_eq!(likes(&f.db, f.entry).await, 0);
    }

    #[tokio::test]
    async fn test_double_like_does_not_duplicate() {
        // The unique (user, entry, type) constraint closes the double-submit race.
        let f = fixture().await;
        let (first, second) = tokio::join!(
            like_entry(&f.db, &f.bob, f.entry),
            like_entry(&f.db, &f.bob, f.entry)
        );
        assert!(first.unwrap() ^ second.unwrap());
        assert_eq!(likes(&f.db, f.entry).await, 1);
    }

    #[tokio::test]
    async fn test_only_admin_may_hide() {
        let f = fixture().await;
        let err = hide_entry(&f.db, &f.alice, f.entry).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert!(!f.db.get_entry(f.entry).await.unwrap().unwrap().hidden);

        assert!(hide_entry(&f.db, &f.admin, f.entry).await.unwrap());
        assert!(f.db.get_entry(f.entry).await.unwrap().unwrap().hidden);
        assert!(unhide_entry(&f.db, &f.admin, f.entry).await.unwrap());
        assert!(!hide_entry(&f.db, &f.admin, EntryId(999)).await.unwrap());
    }

    #[tokio::test]
    async fn test_hidden_entries_cannot_be_liked() {
        let f = fixture().await;
        hide_entry(&f.db, &f.admin, f.entry).await.unwrap();
        assert!(!like_entry(&f.db, &f.bob, f.entry).await.unwrap());
        assert!(!like_entry(&f.db, &f.bob, EntryId(999)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unflag_scoping() {
        let f = fixture().await;
        flag_entry(&f.db, &f.alice, f.entry).await.unwrap();
        flag_entry(&f.db, &f.bob, f.entry).await.unwrap();

        // Bob only removes his own flag
        assert!(unflag_entry(&f.db, &f.bob, f.entry).await.unwrap());
        assert!(!unflag_entry(&f.db, &f.bob, f.entry).await.unwrap());
        assert_eq!(entry_flag_counts(&f.db, true).await.unwrap()[&f.entry].flag, 1);

        // Admin clears the rest
        assert!(unflag_entry(&f.db, &f.admin, f.entry).await.unwrap());
        assert_eq!(
            entry_flag_counts(&f.db, true).await.unwrap().get(&f.entry),
            Some(&FlagCounts { like: 0, flag: 0 })
        );
    }

    #[tokio::test]
    async fn test_ban_blocks_reactions_but_keeps_entries() {
        let f = fixture().await;
        let alice_id = f.alice.user_id().unwrap();
        assert!(set_enabled(&f.db, &f.admin, alice_id, false).await.unwrap());
        assert!(!f.db.get_user(alice_id).await.unwrap().unwrap().enabled);
        assert!(!f.db.get_entry(f.entry).await.unwrap().unwrap().hidden);

        assert!(matches!(
            set_enabled(&f.db, &f.bob, alice_id, true).await,
            Err(AppError::Forbidden(_))
        ));
        assert!(!set_enabled(&f.db, &f.admin, UserId(999), true).await.unwrap());
    }

    #[tokio::test]
    async fn test_edit_topic_description() {
        let f = fixture().await;
        f.db.insert_topic_if_absent("rust", "").await.unwrap();
        assert!(matches!(
            edit_topic_description(&f.db, &f.alice, "rust", "nope").await,
            Err(AppError::Forbidden(_))
        ));
        assert!(edit_topic_description(&f.db, &f.admin, "rust", "Systems talk").await.unwrap());
        assert_eq!(
            f.db.find_topic_by_name("rust").await.unwrap().unwrap().description,
            "Systems talk"
        );
        assert!(!edit_topic_description(&f.db, &f.admin, "missing", "x").await.unwrap());
    }
}
