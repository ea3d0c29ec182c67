// Upload Lifecycle Manager - one image slot per user.
//
// Idle -> Selected -> Uploading -> {Complete | Cancelled | Failed} -> Idle
//
// Layout under the upload directory:
//   staging/  bytes of in-flight transfers
//   pending/  completed uploads not yet attached to an entry
//   public/   images of committed entries, the only directory served over HTTP
//
// Bytes are streamed into a staging file and only renamed into `pending/`
// once the whole payload has passed the size and format checks, so a
// cancelled or failed upload never leaves a file an entry could reference.

use axum::body::Bytes;
use futures::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::UserId;
use crate::error::{AppError, AppResult};

pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];
pub const ALLOWED_CONTENT_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

const STAGING_DIR: &str = "staging";
const PENDING_DIR: &str = "pending";
const PUBLIC_DIR: &str = "public";
const MAX_FILENAME_LEN: usize = 100;
const SNIFF_LEN: usize = 12;

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid filename regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Idle,
    Selected,
    Uploading,
    Complete,
    Cancelled,
    Failed,
}

/// Image formats accepted for upload, recognised by their leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
}

impl ImageFormat {
    pub fn sniff(head: &[u8]) -> Option<Self> {
        if head.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageFormat::Png)
        } else if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if head.len() >= SNIFF_LEN && &head[0..4] == b"RIFF" && &head[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else {
            None
        }
    }
}

/// A file the client has picked, as described by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedFile {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Snapshot of a user's slot for clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadStatus {
    pub state: UploadState,
    pub filename: Option<String>,
    pub progress_percent: u8,
    pub image_relative_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug)]
struct UploadSlot {
    state: UploadState,
    filename: Option<String>,
    received: u64,
    total: Option<u64>,
    image_relative_path: Option<String>,
    error: Option<String>,
    // Identifies the in-flight transfer; stale transfers never touch a newer slot.
    generation: u64,
    cancel: Option<watch::Sender<bool>>,
}

impl Default for UploadSlot {
    fn default() -> Self {
        Self {
            state: UploadState::Idle,
            filename: None,
            received: 0,
            total: None,
            image_relative_path: None,
            error: None,
            generation: 0,
            cancel: None,
        }
    }
}

impl UploadSlot {
    fn status(&self) -> UploadStatus {
        let progress_percent = match self.state {
            UploadState::Complete => 100,
            UploadState::Uploading => progress_percent(self.received, self.total),
            _ => 0,
        };
        UploadStatus {
            state: self.state,
            filename: self.filename.clone(),
            progress_percent,
            image_relative_path: self.image_relative_path.clone(),
            error: self.error.clone(),
        }
    }
}

/// Fraction of `total` received, as an integer percentage in 0..=100
pub fn progress_percent(received: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => {
            let fraction = (received as f64 / total as f64).clamp(0.0, 1.0);
            (fraction * 100.0).floor() as u8
        }
        _ => 0,
    }
}

/// Reduce a client-supplied filename to a safe single path component
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(&['/', '\\'][..]).next().unwrap_or_default();
    let cleaned = UNSAFE_FILENAME_CHARS.replace_all(base, "_");
    let trimmed = cleaned.trim_start_matches('.');
    let mut result: String = trimmed.chars().take(MAX_FILENAME_LEN).collect();
    if result.is_empty() {
        result = "image".to_string();
    }
    result
}

fn has_allowed_extension(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

// Parameters such as `; charset=` are ignored
fn has_allowed_content_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    ALLOWED_CONTENT_TYPES
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(essence))
}

pub struct UploadManager {
    staging_dir: PathBuf,
    pending_dir: PathBuf,
    public_dir: PathBuf,
    max_bytes: u64,
    slots: Mutex<HashMap<UserId, UploadSlot>>,
    next_generation: AtomicU64,
}

impl UploadManager {
    pub async fn new(upload_dir: impl Into<PathBuf>, max_bytes: u64) -> AppResult<Self> {
        let upload_dir = upload_dir.into();
        let staging_dir = upload_dir.join(STAGING_DIR);
        let pending_dir = upload_dir.join(PENDING_DIR);
        let public_dir = upload_dir.join(PUBLIC_DIR);
        for dir in [&staging_dir, &pending_dir, &public_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                AppError::ConfigurationError(format!(
                    "Cannot create upload directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            staging_dir,
            pending_dir,
            public_dir,
            max_bytes,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Directory of committed images, served at `/uploads`
    pub fn public_dir(&self) -> &Path {
        &self.public_dir
    }

    /// Where a completed, not yet posted upload lives
    pub fn pending_path(&self, relative_path: &str) -> PathBuf {
        self.pending_dir.join(relative_path)
    }

    /// Where a committed entry's local image lives
    pub fn public_path(&self, relative_path: &str) -> PathBuf {
        self.public_dir.join(relative_path)
    }

    /// Move a pending upload into the served directory
    pub async fn publish(&self, relative_path: &str) -> AppResult<()> {
        tokio::fs::rename(self.pending_path(relative_path), self.public_path(relative_path))
            .await
            .map_err(|e| AppError::Internal(format!("Failed to publish {}: {}", relative_path, e)))
    }

    /// Undo `publish` when the entry holding the image was not committed
    pub async fn unpublish(&self, relative_path: &str) -> AppResult<()> {
        tokio::fs::rename(self.public_path(relative_path), self.pending_path(relative_path))
            .await
            .map_err(|e| AppError::Internal(format!("Failed to restore {}: {}", relative_path, e)))
    }

    // Idle slots carry no state, so they are dropped instead of kept around
    fn with_slot<R>(&self, user_id: UserId, f: impl FnOnce(&mut UploadSlot) -> R) -> R {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = slots.entry(user_id).or_default();
        let result = f(slot);
        if slot.state == UploadState::Idle {
            slots.remove(&user_id);
        }
        result
    }

    fn peek_slot<R>(&self, user_id: UserId, f: impl FnOnce(&UploadSlot) -> R) -> R {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match slots.get(&user_id) {
            Some(slot) => f(slot),
            None => f(&UploadSlot::default()),
        }
    }

    #[cfg(test)]
    fn tracked_slots(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or_default()
    }

    pub fn status(&self, user_id: UserId) -> UploadStatus {
        self.peek_slot(user_id, UploadSlot::status)
    }

    /// Relative path of a completed upload waiting to be attached to an entry
    pub fn pending_image(&self, user_id: UserId) -> Option<String> {
        self.peek_slot(user_id, |slot| match slot.state {
            UploadState::Complete => slot.image_relative_path.clone(),
            _ => None,
        })
    }

    /// Pick the file to upload. Only the first file is kept.
    pub fn select(&self, user_id: UserId, files: Vec<SelectedFile>) -> AppResult<UploadStatus> {
        let mut files = files.into_iter();
        let file = files
            .next()
            .ok_or_else(|| AppError::Validation("Select an image to upload.".to_string()))?;
        let discarded: Vec<String> = files.map(|f| f.name).collect();
        if !discarded.is_empty() {
            debug!("Only one image per entry; discarding {:?}", discarded);
        }

        let filename = sanitize_filename(&file.name);
        let allowed_type = file
            .content_type
            .as_deref()
            .map(has_allowed_content_type)
            .unwrap_or(true);
        if !has_allowed_extension(&filename) || !allowed_type {
            return Err(not_an_image());
        }
        if let Some(size) = file.size {
            if size > self.max_bytes {
                return Err(AppError::PayloadTooLarge(format!(
                    "Images are limited to {} bytes.",
                    self.max_bytes
                )));
            }
        }

        self.with_slot(user_id, |slot| match slot.state {
            UploadState::Uploading => Err(AppError::Conflict(
                "An upload is already in progress.".to_string(),
            )),
            UploadState::Complete => Err(AppError::Conflict(
                "Remove the uploaded image before selecting another.".to_string(),
            )),
            _ => {
                *slot = UploadSlot {
                    state: UploadState::Selected,
                    filename: Some(filename),
                    total: file.size,
                    ..UploadSlot::default()
                };
                Ok(slot.status())
            }
        })
    }

    /// Stream the selected file's bytes to disk.
    ///
    /// Size and format are enforced here regardless of what the client
    /// checked. Returns the final slot status; a cancelled transfer returns
    /// `Ok` with state `Cancelled`.
    pub async fn upload<S, E>(
        &self,
        user_id: UserId,
        declared_len: Option<u64>,
        stream: S,
    ) -> AppResult<UploadStatus>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let filename = self.with_slot(user_id, |slot| {
            match slot.state {
                UploadState::Selected => {}
                UploadState::Uploading | UploadState::Complete => {
                    return Err(AppError::Conflict(
                        "This image has already been uploaded.".to_string(),
                    ));
                }
                UploadState::Idle | UploadState::Cancelled | UploadState::Failed => {
                    return Err(AppError::NotFound(
                        "Select an image before uploading.".to_string(),
                    ));
                }
            }
            slot.state = UploadState::Uploading;
            slot.generation = generation;
            slot.received = 0;
            slot.total = declared_len.or(slot.total);
            slot.error = None;
            slot.cancel = Some(cancel_tx);
            Ok(slot.filename.clone().unwrap_or_else(|| "image".to_string()))
        })?;

        if let Some(len) = declared_len {
            if len > self.max_bytes {
                return Err(self.fail(user_id, generation, too_large(self.max_bytes)));
            }
        }

        let staging_path = self.staging_dir.join(Uuid::new_v4().simple().to_string());
        let mut guard = StagingGuard {
            manager: self,
            user_id,
            generation,
            path: staging_path.clone(),
            armed: true,
        };

        let mut file = tokio::fs::File::create(&staging_path).await.map_err(|e| {
            self.fail(user_id, generation, AppError::Internal(format!("Cannot create staging file: {}", e)))
        })?;

        let mut stream = std::pin::pin!(stream);
        let mut received: u64 = 0;
        let mut head: Vec<u8> = Vec::with_capacity(SNIFF_LEN);
        let mut sniffed = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    info!("Upload for user {} cancelled after {} bytes", user_id, received);
                    return Ok(self.status(user_id));
                }
                next = stream.next() => next,
            };

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    return Err(self.fail(
                        user_id,
                        generation,
                        AppError::BadRequest(format!("Upload interrupted: {}", e)),
                    ));
                }
            };

            received += chunk.len() as u64;
            if received > self.max_bytes {
                return Err(self.fail(user_id, generation, too_large(self.max_bytes)));
            }

            if !sniffed {
                let wanted = SNIFF_LEN - head.len();
                head.extend_from_slice(&chunk[..chunk.len().min(wanted)]);
                if head.len() >= SNIFF_LEN {
                    if ImageFormat::sniff(&head).is_none() {
                        return Err(self.fail(user_id, generation, not_an_image()));
                    }
                    sniffed = true;
                }
            }

            if let Err(e) = file.write_all(&chunk).await {
                return Err(self.fail(
                    user_id,
                    generation,
                    AppError::Internal(format!("Failed to write upload: {}", e)),
                ));
            }

            self.with_slot(user_id, |slot| {
                if slot.generation == generation {
                    slot.received = received;
                }
            });
        }

        if received == 0 {
            return Err(self.fail(
                user_id,
                generation,
                AppError::Validation("The uploaded file is empty.".to_string()),
            ));
        }
        if !sniffed && ImageFormat::sniff(&head).is_none() {
            return Err(self.fail(user_id, generation, not_an_image()));
        }

        if let Err(e) = file.flush().await {
            return Err(self.fail(
                user_id,
                generation,
                AppError::Internal(format!("Failed to write upload: {}", e)),
            ));
        }
        drop(file);

        let relative_path = format!("{}_{}", Uuid::new_v4().simple(), filename);
        let final_path = self.pending_path(&relative_path);
        if let Err(e) = tokio::fs::rename(&staging_path, &final_path).await {
            return Err(self.fail(
                user_id,
                generation,
                AppError::Internal(format!("Failed to store upload: {}", e)),
            ));
        }
        guard.disarm();

        let committed = self.with_slot(user_id, |slot| {
            if slot.generation == generation && slot.state == UploadState::Uploading {
                slot.state = UploadState::Complete;
                slot.received = received;
                slot.image_relative_path = Some(relative_path.clone());
                slot.cancel = None;
                true
            } else {
                false
            }
        });

        if !committed {
            // Cancelled between the last chunk and the rename
            remove_file_if_exists(&final_path).await?;
            return Ok(self.status(user_id));
        }

        info!("Stored upload for user {} as {} ({} bytes)", user_id, relative_path, received);
        Ok(self.status(user_id))
    }

    /// Abort the in-flight transfer. The streaming side removes its staging file.
    pub fn cancel(&self, user_id: UserId) -> AppResult<UploadStatus> {
        self.with_slot(user_id, |slot| {
            if slot.state != UploadState::Uploading {
                return Err(AppError::NotFound("No upload in progress.".to_string()));
            }
            slot.state = UploadState::Cancelled;
            slot.received = 0;
            if let Some(cancel) = slot.cancel.take() {
                let _ = cancel.send(true);
            }
            Ok(slot.status())
        })
    }

    /// Return the slot to `Idle`, deleting a completed upload's file.
    /// A file that is already gone counts as deleted.
    pub async fn discard(&self, user_id: UserId) -> AppResult<UploadStatus> {
        let to_delete = self.with_slot(user_id, |slot| match slot.state {
            UploadState::Uploading => Err(AppError::Conflict(
                "Cancel the upload in progress first.".to_string(),
            )),
            UploadState::Complete => {
                let path = slot.image_relative_path.take();
                *slot = UploadSlot::default();
                Ok(path)
            }
            _ => {
                *slot = UploadSlot::default();
                Ok(None)
            }
        })?;

        if let Some(relative_path) = to_delete {
            remove_file_if_exists(&self.pending_path(&relative_path)).await?;
            info!("Deleted pending upload {} for user {}", relative_path, user_id);
        }
        Ok(self.status(user_id))
    }

    /// Clear the pending image once an entry holding it has been committed
    pub fn complete_submission(&self, user_id: UserId, relative_path: &str) {
        self.with_slot(user_id, |slot| {
            if slot.state == UploadState::Complete
                && slot.image_relative_path.as_deref() == Some(relative_path)
            {
                *slot = UploadSlot::default();
            }
        });
    }

    fn fail(&self, user_id: UserId, generation: u64, err: AppError) -> AppError {
        let message = err.user_message();
        self.with_slot(user_id, |slot| {
            if slot.generation == generation && slot.state == UploadState::Uploading {
                slot.state = UploadState::Failed;
                slot.error = Some(message);
                slot.cancel = None;
            }
        });
        warn!("Upload for user {} failed: {}", user_id, err);
        err
    }
}

fn too_large(max_bytes: u64) -> AppError {
    AppError::PayloadTooLarge(format!("Images are limited to {} bytes.", max_bytes))
}

fn not_an_image() -> AppError {
    AppError::Validation("Only PNG, JPEG, GIF and WEBP images can be uploaded.".to_string())
}

/// Delete a file, treating "already absent" as success
pub async fn remove_file_if_exists(path: &Path) -> AppResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} was already absent", path.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

// Removes the staging file on every exit path except a successful rename,
// including the request future being dropped mid-transfer.
struct StagingGuard<'a> {
    manager: &'a UploadManager,
    user_id: UserId,
    generation: u64,
    path: PathBuf,
    armed: bool,
}

impl StagingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove staging file {}: {}", self.path.display(), e);
            }
        }
        let generation = self.generation;
        self.manager.with_slot(self.user_id, |slot| {
            if slot.generation == generation && slot.state == UploadState::Uploading {
                slot.state = UploadState::Failed;
                slot.error = Some("Upload interrupted.".to_string());
                slot.cancel = None;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use futures::stream;
    use std::sync::Arc;
    use std::time::Duration;

    const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn png_bytes(len: usize) -> Vec<u8> {
        let mut bytes = PNG_HEADER.to_vec();
        bytes.resize(len.max(PNG_HEADER.len()), 0xAB);
        bytes
    }

    fn chunks(data: Vec<u8>, size: usize) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
        let parts: Vec<Result<Bytes, std::io::Error>> = data
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(parts)
    }

    fn file(name: &str) -> SelectedFile {
        SelectedFile {
            name: name.to_string(),
            size: None,
            content_type: None,
        }
    }

    fn stored_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect()
    }

    async fn manager(dir: &Path) -> UploadManager {
        UploadManager::new(dir, 64 * 1024).await.unwrap()
    }

    #[test]
    fn test_sniff_formats() {
        assert_eq!(ImageFormat::sniff(PNG_HEADER), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::sniff(b"GIF89a......"), Some(ImageFormat::Gif));
        assert_eq!(ImageFormat::sniff(b"RIFF\0\0\0\0WEBPVP8 "), Some(ImageFormat::Webp));
        assert_eq!(ImageFormat::sniff(b"<html><body>"), None);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\photos\\my cat.png"), "my_cat.png");
        assert_eq!(sanitize_filename(".hidden.gif"), "hidden.gif");
        assert_eq!(sanitize_filename(""), "image");
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, Some(200)), 0);
        assert_eq!(progress_percent(99, Some(200)), 49);
        assert_eq!(progress_percent(300, Some(200)), 100);
        assert_eq!(progress_percent(10, None), 0);
    }

    #[tokio::test]
    async fn test_select_keeps_first_file_only() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path()).await;
        let status = uploads
            .select(UserId(1), vec![file("a.png"), file("b.jpg")])
            .unwrap();
        assert_eq!(status.state, UploadState::Selected);
        assert_eq!(status.filename.as_deref(), Some("a.png"));
    }

    #[tokio::test]
    async fn test_select_rejects_bad_type_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path()).await;
        assert!(matches!(
            uploads.select(UserId(1), vec![file("notes.txt")]),
            Err(AppError::Validation(_))
        ));
        let big = SelectedFile {
            size: Some(uploads.max_bytes() + 1),
            ..file("big.png")
        };
        assert!(matches!(
            uploads.select(UserId(1), vec![big]),
            Err(AppError::PayloadTooLarge(_))
        ));
        assert!(uploads.select(UserId(1), vec![]).is_err());
        assert_eq!(uploads.status(UserId(1)).state, UploadState::Idle);
    }

    #[tokio::test]
    async fn test_upload_completes_under_generated_name() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path()).await;
        uploads.select(UserId(1), vec![file("cat.png")]).unwrap();

        let data = png_bytes(10_000);
        let status = uploads
            .upload(UserId(1), Some(data.len() as u64), chunks(data.clone(), 1024))
            .await
            .unwrap();

        assert_eq!(status.state, UploadState::Complete);
        assert_eq!(status.progress_percent, 100);
        let relative = status.image_relative_path.unwrap();
        assert!(relative.ends_with("_cat.png"));
        assert_eq!(std::fs::read(uploads.pending_path(&relative)).unwrap(), data);
        assert_eq!(uploads.pending_image(UserId(1)), Some(relative));
        assert!(stored_files(&dir.path().join(STAGING_DIR)).is_empty());
        // Not served until an entry is committed
        assert!(stored_files(uploads.public_dir()).is_empty());
    }

    #[tokio::test]
    async fn test_server_rejects_oversized_payload() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path()).await;
        uploads.select(UserId(1), vec![file("huge.png")]).unwrap();

        // Client lies about the length
        let data = png_bytes(uploads.max_bytes() as usize + 10);
        let err = uploads
            .upload(UserId(1), Some(100), chunks(data, 4096))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge(_)));

        let status = uploads.status(UserId(1));
        assert_eq!(status.state, UploadState::Failed);
        assert!(status.image_relative_path.is_none());
        assert!(stored_files(&dir.path().join(PENDING_DIR)).is_empty());
        assert!(stored_files(&dir.path().join(STAGING_DIR)).is_empty());
    }

    #[tokio::test]
    async fn test_server_rejects_non_image_payload() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path()).await;
        uploads.select(UserId(1), vec![file("evil.png")]).unwrap();

        let err = uploads
            .upload(UserId(1), None, chunks(b"<script>alert(1)</script>".to_vec(), 5))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(uploads.status(UserId(1)).state, UploadState::Failed);
        assert!(stored_files(&dir.path().join(STAGING_DIR)).is_empty());
    }

    #[tokio::test]
    async fn test_upload_requires_selection() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path()).await;
        let err = uploads
            .upload(UserId(1), None, chunks(png_bytes(64), 64))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        // Nothing to cancel either
        assert!(matches!(uploads.cancel(UserId(1)), Err(AppError::NotFound(_))));
        assert_eq!(uploads.tracked_slots(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = Arc::new(manager(dir.path()).await);
        uploads.select(UserId(1), vec![file("cat.png")]).unwrap();

        let (tx, rx) = mpsc::unbounded::<Result<Bytes, std::io::Error>>();
        let task = {
            let uploads = uploads.clone();
            tokio::spawn(async move { uploads.upload(UserId(1), Some(4096), rx).await })
        };

        tx.unbounded_send(Ok(Bytes::from(png_bytes(1024)))).unwrap();
        for _ in 0..100 {
            if uploads.status(UserId(1)).progress_percent == 25 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(uploads.status(UserId(1)).state, UploadState::Uploading);
        assert_eq!(uploads.status(UserId(1)).progress_percent, 25);

        let cancelled = uploads.cancel(UserId(1)).unwrap();
        assert_eq!(cancelled.state, UploadState::Cancelled);

        let status = task.await.unwrap().unwrap();
        assert_eq!(status.state, UploadState::Cancelled);
        assert!(uploads.pending_image(UserId(1)).is_none());
        assert!(stored_files(&dir.path().join(PENDING_DIR)).is_empty());
        assert!(stored_files(&dir.path().join(STAGING_DIR)).is_empty());
        drop(tx);

        // Cancelled slots can be reused
        assert_eq!(
            uploads.select(UserId(1), vec![file("dog.gif")]).unwrap().state,
            UploadState::Selected
        );
    }

    #[tokio::test]
    async fn test_dropped_transfer_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = Arc::new(manager(dir.path()).await);
        uploads.select(UserId(1), vec![file("cat.png")]).unwrap();

        let (tx, rx) = mpsc::unbounded::<Result<Bytes, std::io::Error>>();
        let task = {
            let uploads = uploads.clone();
            tokio::spawn(async move { uploads.upload(UserId(1), Some(4096), rx).await })
        };
        tx.unbounded_send(Ok(Bytes::from(png_bytes(512)))).unwrap();
        for _ in 0..100 {
            if uploads.status(UserId(1)).progress_percent > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Simulates the client disconnecting: the request future is dropped.
        task.abort();
        let _ = task.await;

        assert_eq!(uploads.status(UserId(1)).state, UploadState::Failed);
        assert!(stored_files(&dir.path().join(STAGING_DIR)).is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn test_discard_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path()).await;
        uploads.select(UserId(1), vec![file("cat.png")]).unwrap();
        let status = uploads
            .upload(UserId(1), None, chunks(png_bytes(256), 64))
            .await
            .unwrap();
        let relative = status.image_relative_path.unwrap();

        // Someone removed the file behind our back
        std::fs::remove_file(uploads.pending_path(&relative)).unwrap();

        let status = uploads.discard(UserId(1)).await.unwrap();
        assert_eq!(status.state, UploadState::Idle);
        assert!(uploads.pending_image(UserId(1)).is_none());
    }

    #[tokio::test]
    async fn test_discard_deletes_completed_upload() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path()).await;
        uploads.select(UserId(1), vec![file("cat.webp")]).unwrap();
        let mut webp = b"RIFF\0\0\0\0WEBPVP8 ".to_vec();
        webp.resize(300, 1);
        let status = uploads.upload(UserId(1), None, chunks(webp, 100)).await.unwrap();
        let path = uploads.pending_path(&status.image_relative_path.unwrap());
        assert!(path.exists());

        // A completed image blocks a new selection until removed
        assert!(matches!(
            uploads.select(UserId(1), vec![file("other.png")]),
            Err(AppError::Conflict(_))
        ));

        uploads.discard(UserId(1)).await.unwrap();
        assert!(!path.exists());
        assert_eq!(uploads.tracked_slots(), 0);
    }

    #[tokio::test]
    async fn test_select_checks_declared_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path()).await;
        let disguised = SelectedFile {
            content_type: Some("text/html".to_string()),
            ..file("page.png")
        };
        assert!(matches!(
            uploads.select(UserId(1), vec![disguised]),
            Err(AppError::Validation(_))
        ));

        let jpeg = SelectedFile {
            content_type: Some("IMAGE/JPEG; charset=binary".to_string()),
            ..file("photo.jpg")
        };
        assert_eq!(uploads.select(UserId(1), vec![jpeg]).unwrap().state, UploadState::Selected);
    }

    #[tokio::test]
    async fn test_status_reads_do_not_register_slots() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path()).await;
        for id in 1..=50 {
            assert_eq!(uploads.status(UserId(id)).state, UploadState::Idle);
            assert!(uploads.pending_image(UserId(id)).is_none());
        }
        assert_eq!(uploads.tracked_slots(), 0);

        uploads.select(UserId(1), vec![file("cat.png")]).unwrap();
        assert_eq!(uploads.tracked_slots(), 1);
        uploads.discard(UserId(1)).await.unwrap();
        assert_eq!(uploads.tracked_slots(), 0);
    }

    #[tokio::test]
    async fn test_publish_moves_image_into_served_directory() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path()).await;
        uploads.select(UserId(1), vec![file("cat.png")]).unwrap();
        let relative = uploads
            .upload(UserId(1), None, chunks(png_bytes(256), 64))
            .await
            .unwrap()
            .image_relative_path
            .unwrap();

        uploads.publish(&relative).await.unwrap();
        assert!(uploads.public_path(&relative).exists());
        assert!(!uploads.pending_path(&relative).exists());

        uploads.unpublish(&relative).await.unwrap();
        assert!(!uploads.public_path(&relative).exists());
        assert!(uploads.pending_path(&relative).exists());
    }
}
