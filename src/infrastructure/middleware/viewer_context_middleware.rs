// ViewerContext Middleware - resolves the caller once and injects the context into request extensions
// Handlers only ever see ViewerContext, never raw headers or tokens

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::config::AdminConfig;
use crate::database::ShoutDatabase;
use crate::error::{AppError, AppResult};
use crate::infrastructure::identity::IdentityVerifier;
use crate::infrastructure::viewer::ViewerContext;
use crate::services::accounts;

/// Application state that can turn a bearer token into an account
pub trait HasViewerResolution {
    fn database(&self) -> &ShoutDatabase;
    fn identity(&self) -> &Arc<dyn IdentityVerifier>;
    fn admin_config(&self) -> &AdminConfig;
}

/// Creates the request-scoped viewer context.
/// A missing, malformed or expired assertion yields an anonymous viewer.
pub async fn viewer_context_middleware<T>(
    State(app_state): State<T>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError>
where
    T: HasViewerResolution + Clone + Send + Sync + 'static,
{
    let token = extract_bearer_token(request.headers())?;
    let viewer_context = create_viewer_context(&app_state, token.as_deref()).await?;

    request.extensions_mut().insert(viewer_context);

    Ok(next.run(request).await)
}

/// Pull the bearer token out of the Authorization header, if any
fn extract_bearer_token(headers: &HeaderMap) -> AppResult<Option<String>> {
    let auth_header = match headers.get(header::AUTHORIZATION) {
        Some(value) => value,
        None => return Ok(None),
    };

    let auth_str = auth_header
        .to_str()
        .map_err(|_| AppError::BadRequest("Authorization header is not valid text".to_string()))?;

    match auth_str.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
            let token = token.trim();
            Ok((!token.is_empty()).then(|| token.to_string()))
        }
        _ => Ok(None),
    }
}

async fn create_viewer_context<T: HasViewerResolution>(
    app_state: &T,
    token: Option<&str>,
) -> AppResult<Arc<ViewerContext>> {
    let request_id = ViewerContext::new_request_id();

    let token = match token {
        Some(token) => token,
        None => return Ok(Arc::new(ViewerContext::anonymous(request_id))),
    };

    let assertion = match app_state.identity().verify(token).await {
        Ok(Some(assertion)) if !assertion.is_expired() => assertion,
        Ok(Some(assertion)) => {
            warn!(%request_id, "Expired identity assertion for {}", assertion.sub);
            return Ok(Arc::new(ViewerContext::anonymous(request_id)));
        }
        Ok(None) => return Ok(Arc::new(ViewerContext::anonymous(request_id))),
        Err(e) => {
            warn!(%request_id, "Rejected identity assertion: {}", e);
            return Ok(Arc::new(ViewerContext::anonymous(request_id)));
        }
    };

    let (user, author) =
        accounts::resolve_user(app_state.database(), &assertion, app_state.admin_config()).await?;

    Ok(Arc::new(ViewerContext::authenticated(request_id, user, author)))
}
