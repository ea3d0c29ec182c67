// Submission - validate and commit a new entry, relocating its image if needed

use std::sync::Arc;
use tracing::{info, warn};

use crate::core::ShoutTime;
use crate::database::ShoutDatabase;
use crate::error::{AppError, AppResult};
use crate::infrastructure::object_store::ObjectStore;
use crate::infrastructure::viewer::ViewerContext;
use crate::models::{Entry, NewEntry};
use crate::services::entry_visibility;
use crate::services::upload_manager::{remove_file_if_exists, UploadManager};

pub const EMPTY_SUBMISSION: &str = "You have to at least write something or upload an image.";

/// Longest accepted entry text, in characters
pub const MAX_TEXT_LEN: usize = 2000;

#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub text: Option<String>,
    pub topic: Option<String>,
    pub description: Option<String>,
}

/// Where a committed entry's image ends up
#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredImage {
    /// Published under the served upload directory
    Local(String),
    /// Copied to object storage; the pending local file is kept until commit
    Remote { key: String, url: String },
}

impl StoredImage {
    fn reference(&self) -> &str {
        match self {
            StoredImage::Local(path) => path,
            StoredImage::Remote { url, .. } => url,
        }
    }
}

pub struct SubmissionHandler<'a> {
    pub db: &'a ShoutDatabase,
    pub uploads: &'a UploadManager,
    pub object_store: Option<&'a Arc<dyn ObjectStore>>,
}

impl SubmissionHandler<'_> {
    /// Create an entry from the viewer's text and pending image.
    ///
    /// Nothing is written unless the viewer may post and the submission has
    /// text or an image. If the entry cannot be committed the pending image
    /// stays where it was, so the user can simply retry.
    pub async fn submit(&self, vc: &ViewerContext, submission: &Submission) -> AppResult<Entry> {
        let user = vc.require_poster()?;

        let text = submission
            .text
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let pending_image = self.uploads.pending_image(user.id);

        if text.is_empty() && pending_image.is_none() {
            return Err(AppError::Validation(EMPTY_SUBMISSION.to_string()));
        }
        if text.chars().count() > MAX_TEXT_LEN {
            return Err(AppError::Validation(format!(
                "Entries are limited to {} characters.",
                MAX_TEXT_LEN
            )));
        }

        let topic = entry_visibility::resolve_topic(
            self.db,
            submission.topic.as_deref(),
            submission.description.as_deref(),
        )
        .await?;

        let stored = match &pending_image {
            Some(relative_path) => Some(self.store_image(relative_path).await?),
            None => None,
        };

        let new_entry = NewEntry {
            ts: ShoutTime::now(),
            author_id: user.id,
            topic_id: topic.as_ref().map(|t| t.id),
            text,
            image: stored.as_ref().map(|s| s.reference().to_string()),
        };

        let entry = match self.db.insert_entry(&new_entry).await {
            Ok(entry) => entry,
            Err(err) => {
                if let Some(stored) = &stored {
                    self.roll_back_image(stored).await;
                }
                return Err(err);
            }
        };

        if let Some(relative_path) = &pending_image {
            self.uploads.complete_submission(user.id, relative_path);
            if let Some(StoredImage::Remote { .. }) = &stored {
                let local_path = self.uploads.pending_path(relative_path);
                if let Err(e) = remove_file_if_exists(&local_path).await {
                    warn!("Failed to remove relocated upload {}: {}", local_path.display(), e);
                }
            }
        }

        info!(
            request_id = %vc.request_id,
            "User {} posted entry {}{}",
            user.id,
            entry.id,
            if entry.image.is_some() { " with image" } else { "" }
        );
        Ok(entry)
    }

    /// Copy a pending upload to object storage when configured, otherwise
    /// publish it locally under its relative path.
    async fn store_image(&self, relative_path: &str) -> AppResult<StoredImage> {
        let store = match self.object_store {
            Some(store) => store,
            None => {
                self.uploads.publish(relative_path).await?;
                return Ok(StoredImage::Local(relative_path.to_string()));
            }
        };

        let local_path = self.uploads.pending_path(relative_path);
        let bytes = tokio::fs::read(&local_path).await.map_err(|e| {
            AppError::Internal(format!("Pending image {} is unreadable: {}", relative_path, e))
        })?;
        let url = store.put(relative_path, bytes).await?;

        Ok(StoredImage::Remote {
            key: relative_path.to_string(),
            url,
        })
    }

    // Best effort: the insert error is what the caller reports
    async fn roll_back_image(&self, stored: &StoredImage) {
        match stored {
            StoredImage::Local(relative_path) => {
                if let Err(e) = self.uploads.unpublish(relative_path).await {
                    warn!("Failed to restore pending upload {}: {}", relative_path, e);
                }
            }
            StoredImage::Remote { key, .. } => {
                if let Some(store) = self.object_store {
                    if let Err(e) = store.delete(key).await {
                        warn!("Failed to remove orphaned object '{}': {}", key, e);
                    }
                }
            }
        }
    }
}
