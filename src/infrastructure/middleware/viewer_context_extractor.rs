// ViewerContext Extractor - handlers take `vc: Vc` instead of digging through extensions

use std::sync::Arc;
use crate::error::AppError;
use crate::infrastructure::viewer::ViewerContext;
use axum::{extract::FromRequestParts, http::request::Parts};

/// Cheap-to-clone handle on the request's ViewerContext.
///
/// Derefs to `ViewerContext`, so handlers can write `vc.require_admin()?`
/// and pass `&vc` wherever a `&ViewerContext` is expected.
#[derive(Debug, Clone)]
pub struct Vc(Arc<ViewerContext>);

impl Vc {
    pub fn new(vc: Arc<ViewerContext>) -> Self {
        Self(vc)
    }

    pub fn arc(self) -> Arc<ViewerContext> {
        self.0
    }
}

impl std::ops::Deref for Vc {
    type Target = ViewerContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vc> for Arc<ViewerContext> {
    fn from(vc: Vc) -> Self {
        vc.0
    }
}

impl AsRef<ViewerContext> for Vc {
    fn as_ref(&self) -> &ViewerContext {
        &self.0
    }
}

// The middleware must run first; a missing context is a wiring bug, not a client error
impl<S> FromRequestParts<S> for Vc
where
    S: Send + Sync,
{
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let vc = parts
            .extensions
            .get::<Arc<ViewerContext>>()
            .map(|vc| Vc(vc.clone()))
            .ok_or_else(|| AppError::Internal("ViewerContext middleware is not installed".to_string()));

        async move { vc }
    }
}
