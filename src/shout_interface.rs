// Shoutbox Interface - single access layer the HTTP handlers go through
// Every mutation answers with the reloaded feed so clients never patch state locally

use std::sync::Arc;
use axum::{
    body::Body,
    extract::{FromRef, Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::{
    app_state::AppState,
    core::{EntryId, UserId},
    database::ShoutDatabase,
    error::{AppError, AppResult},
    infrastructure::{
        middleware::{viewer_context_middleware, Vc},
        object_store::ObjectStore,
        viewer::ViewerContext,
    },
    models::{Author, Feed, UserInfo},
    services::{
        entry_visibility, moderation,
        upload_manager::{SelectedFile, UploadStatus},
        Submission, SubmissionHandler, UploadManager,
    },
};

#[derive(Clone)]
pub struct ShoutInterface {
    database: Arc<ShoutDatabase>,
    uploads: Arc<UploadManager>,
    object_store: Option<Arc<dyn ObjectStore>>,
}

impl ShoutInterface {
    pub fn new(
        database: Arc<ShoutDatabase>,
        uploads: Arc<UploadManager>,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        Self {
            database,
            uploads,
            object_store,
        }
    }

    pub fn database(&self) -> &ShoutDatabase {
        &self.database
    }

    pub fn uploads(&self) -> &UploadManager {
        &self.uploads
    }

    pub async fn feed(&self, vc: &ViewerContext, scope: &FeedQuery) -> AppResult<Feed> {
        entry_visibility::load_feed(
            &self.database,
            vc,
            scope.topic.as_deref(),
            scope.description.as_deref(),
        )
        .await
    }

    pub async fn submit_entry(&self, vc: &ViewerContext, submission: Submission) -> AppResult<Feed> {
        let handler = SubmissionHandler {
            db: &self.database,
            uploads: &self.uploads,
            object_store: self.object_store.as_ref(),
        };
        handler.submit(vc, &submission).await?;

        let scope = FeedQuery {
            topic: submission.topic,
            description: submission.description,
        };
        self.feed(vc, &scope).await
    }

    pub async fn apply_entry_action(
        &self,
        vc: &ViewerContext,
        entry_id: EntryId,
        action: EntryAction,
        scope: &FeedQuery,
    ) -> AppResult<Feed> {
        let db = self.database.as_ref();
        match action {
            EntryAction::Like => moderation::like_entry(db, vc, entry_id).await?,
            EntryAction::Unlike => moderation::unlike_entry(db, vc, entry_id).await?,
            EntryAction::Flag => moderation::flag_entry(db, vc, entry_id).await?,
            EntryAction::Unflag => moderation::unflag_entry(db, vc, entry_id).await?,
            EntryAction::Hide => moderation::hide_entry(db, vc, entry_id).await?,
            EntryAction::Unhide => moderation::unhide_entry(db, vc, entry_id).await?,
        };
        self.feed(vc, scope).await
    }

    pub async fn set_user_enabled(
        &self,
        vc: &ViewerContext,
        user_id: UserId,
        enabled: bool,
        scope: &FeedQuery,
    ) -> AppResult<Feed> {
        moderation::set_enabled(&self.database, vc, user_id, enabled).await?;
        self.feed(vc, scope).await
    }

    pub async fn edit_topic_description(
        &self,
        vc: &ViewerContext,
        topic_name: &str,
        description: &str,
    ) -> AppResult<Feed> {
        moderation::edit_topic_description(&self.database, vc, topic_name, description).await?;
        let scope = FeedQuery {
            topic: Some(topic_name.to_string()),
            description: None,
        };
        self.feed(vc, &scope).await
    }

    pub fn me(&self, vc: &ViewerContext) -> MeResponse {
        MeResponse {
            authenticated: vc.is_authenticated(),
            is_admin: vc.is_admin(),
            auth_error: vc.auth_error(),
            user: vc.viewer.as_ref().map(|v| v.user.clone()),
            author: vc.viewer.as_ref().map(|v| v.author.clone()),
            upload: vc.user_id().map(|id| self.uploads.status(id)),
        }
    }

    pub fn upload_status(&self, vc: &ViewerContext) -> AppResult<UploadStatus> {
        let user = vc.require_user()?;
        Ok(self.uploads.status(user.id))
    }

    pub fn select_upload(&self, vc: &ViewerContext, files: Vec<SelectedFile>) -> AppResult<UploadStatus> {
        let user = vc.require_poster()?;
        self.uploads.select(user.id, files)
    }

    pub async fn upload_content(
        &self,
        vc: &ViewerContext,
        declared_len: Option<u64>,
        body: Body,
    ) -> AppResult<UploadStatus> {
        let user = vc.require_poster()?;
        self.uploads
            .upload(user.id, declared_len, body.into_data_stream())
            .await
    }

    pub fn cancel_upload(&self, vc: &ViewerContext) -> AppResult<UploadStatus> {
        let user = vc.require_user()?;
        self.uploads.cancel(user.id)
    }

    pub async fn discard_upload(&self, vc: &ViewerContext) -> AppResult<UploadStatus> {
        let user = vc.require_user()?;
        self.uploads.discard(user.id).await
    }
}

impl FromRef<AppState> for ShoutInterface {
    fn from_ref(state: &AppState) -> Self {
        state.shout_interface.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    Like,
    Unlike,
    Flag,
    Unflag,
    Hide,
    Unhide,
}

/// Which feed to reload: `?topic=&description=`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedQuery {
    pub topic: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitEntryRequest {
    #[serde(default)]
    pub text: Option<String>,
    pub topic: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct TopicDescriptionRequest {
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct SelectFilesRequest {
    pub files: Vec<SelectedFile>,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub authenticated: bool,
    pub is_admin: bool,
    pub auth_error: Option<&'static str>,
    pub user: Option<UserInfo>,
    pub author: Option<Author>,
    pub upload: Option<UploadStatus>,
}

// HTTP Handlers

pub async fn list_entries_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
    Query(scope): Query<FeedQuery>,
) -> Result<Json<Feed>, AppError> {
    Ok(Json(shout.feed(&vc, &scope).await?))
}

pub async fn submit_entry_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
    Query(scope): Query<FeedQuery>,
    Json(req): Json<SubmitEntryRequest>,
) -> Result<(StatusCode, Json<Feed>), AppError> {
    let submission = Submission {
        text: req.text,
        topic: req.topic.or(scope.topic),
        description: req.description.or(scope.description),
    };
    let feed = shout.submit_entry(&vc, submission).await?;
    Ok((StatusCode::CREATED, Json(feed)))
}

async fn entry_action(
    shout: ShoutInterface,
    vc: Vc,
    entry_id: EntryId,
    action: EntryAction,
    scope: FeedQuery,
) -> Result<Json<Feed>, AppError> {
    Ok(Json(shout.apply_entry_action(&vc, entry_id, action, &scope).await?))
}

pub async fn like_entry_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
    AxumPath(id): AxumPath<EntryId>,
    Query(scope): Query<FeedQuery>,
) -> Result<Json<Feed>, AppError> {
    entry_action(shout, vc, id, EntryAction::Like, scope).await
}

pub async fn unlike_entry_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
    AxumPath(id): AxumPath<EntryId>,
    Query(scope): Query<FeedQuery>,
) -> Result<Json<Feed>, AppError> {
    entry_action(shout, vc, id, EntryAction::Unlike, scope).await
}

pub async fn flag_entry_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
    AxumPath(id): AxumPath<EntryId>,
    Query(scope): Query<FeedQuery>,
) -> Result<Json<Feed>, AppError> {
    entry_action(shout, vc, id, EntryAction::Flag, scope).await
}

pub async fn unflag_entry_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
    AxumPath(id): AxumPath<EntryId>,
    Query(scope): Query<FeedQuery>,
) -> Result<Json<Feed>, AppError> {
    entry_action(shout, vc, id, EntryAction::Unflag, scope).await
}

pub async fn hide_entry_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
    AxumPath(id): AxumPath<EntryId>,
    Query(scope): Query<FeedQuery>,
) -> Result<Json<Feed>, AppError> {
    entry_action(shout, vc, id, EntryAction::Hide, scope).await
}

pub async fn unhide_entry_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
    AxumPath(id): AxumPath<EntryId>,
    Query(scope): Query<FeedQuery>,
) -> Result<Json<Feed>, AppError> {
    entry_action(shout, vc, id, EntryAction::Unhide, scope).await
}

pub async fn set_user_enabled_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
    AxumPath(id): AxumPath<UserId>,
    Query(scope): Query<FeedQuery>,
    Json(req): Json<SetEnabledRequest>,
) -> Result<Json<Feed>, AppError> {
    Ok(Json(shout.set_user_enabled(&vc, id, req.enabled, &scope).await?))
}

pub async fn edit_topic_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
    AxumPath(name): AxumPath<String>,
    Json(req): Json<TopicDescriptionRequest>,
) -> Result<Json<Feed>, AppError> {
    Ok(Json(shout.edit_topic_description(&vc, &name, &req.description).await?))
}

pub async fn me_handler(State(shout): State<ShoutInterface>, vc: Vc) -> Json<MeResponse> {
    Json(shout.me(&vc))
}

pub async fn upload_status_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
) -> Result<Json<UploadStatus>, AppError> {
    Ok(Json(shout.upload_status(&vc)?))
}

pub async fn select_upload_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
    Json(req): Json<SelectFilesRequest>,
) -> Result<Json<UploadStatus>, AppError> {
    Ok(Json(shout.select_upload(&vc, req.files)?))
}

pub async fn upload_content_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadStatus>, AppError> {
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    Ok(Json(shout.upload_content(&vc, declared_len, body).await?))
}

pub async fn cancel_upload_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
) -> Result<Json<UploadStatus>, AppError> {
    Ok(Json(shout.cancel_upload(&vc)?))
}

pub async fn discard_upload_handler(
    State(shout): State<ShoutInterface>,
    vc: Vc,
) -> Result<Json<UploadStatus>, AppError> {
    Ok(Json(shout.discard_upload(&vc).await?))
}

pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// API routes, mounted under `/api/v1`
pub fn create_shout_router(state: AppState) -> Router {
    Router::new()
        // Feed and submission
        .route("/entries", get(list_entries_handler).post(submit_entry_handler))

        // Reactions
        .route("/entries/{id}/like", post(like_entry_handler).delete(unlike_entry_handler))
        .route("/entries/{id}/flag", post(flag_entry_handler).delete(unflag_entry_handler))

        // Moderation
        .route("/entries/{id}/hide", post(hide_entry_handler))
        .route("/entries/{id}/unhide", post(unhide_entry_handler))
        .route("/users/{id}/enabled", put(set_user_enabled_handler))
        .route("/topics/{name}/description", put(edit_topic_handler))

        // Viewer and upload slot
        .route("/me", get(me_handler))
        .route("/uploads", get(upload_status_handler).delete(discard_upload_handler))
        .route("/uploads/select", post(select_upload_handler))
        .route("/uploads/content", put(upload_content_handler))
        .route("/uploads/cancel", post(cancel_upload_handler))

        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            viewer_context_middleware::<AppState>,
        ))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Full application: API, posted images and request tracing.
/// Only committed images are served; staging and pending uploads are not.
pub fn create_app(state: AppState) -> Router {
    let public_dir = state.shout_interface.uploads().public_dir().to_path_buf();

    Router::new()
        .nest("/api/v1", create_shout_router(state))
        .nest_service("/uploads", ServeDir::new(public_dir))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
