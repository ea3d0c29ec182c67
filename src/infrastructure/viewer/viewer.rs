// Viewer Context - who is making this request, resolved once at the request boundary

use serde::Serialize;
use uuid::Uuid;

use crate::core::UserId;
use crate::error::{AppError, AppResult};
use crate::models::{Author, UserInfo};

pub const SIGN_IN_TO_POST: &str = "Sign in to post.";
pub const ACCOUNT_DISABLED: &str = "Your account has been disabled.";
pub const ADMIN_ONLY: &str = "Only an admin can do that.";

#[derive(Debug, Clone)]
pub struct ViewerContext {
    pub request_id: String,
    pub viewer: Option<ViewerUser>,
}

/// Resolved account and display profile of a signed-in viewer
#[derive(Debug, Clone, Serialize)]
pub struct ViewerUser {
    pub user: UserInfo,
    pub author: Author,
}

impl ViewerContext {
    pub fn anonymous(request_id: String) -> Self {
        Self {
            request_id,
            viewer: None,
        }
    }

    pub fn authenticated(request_id: String, user: UserInfo, author: Author) -> Self {
        Self {
            request_id,
            viewer: Some(ViewerUser { user, author }),
        }
    }

    pub fn new_request_id() -> String {
        format!("req-{}", Uuid::new_v4())
    }

    pub fn user(&self) -> Option<&UserInfo> {
        self.viewer.as_ref().map(|v| &v.user)
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user().map(|u| u.id)
    }

    pub fn is_authenticated(&self) -> bool {
        self.viewer.is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.user().map(UserInfo::is_admin).unwrap_or(false)
    }

    /// Any signed-in user, enabled or not
    pub fn require_user(&self) -> AppResult<&UserInfo> {
        self.user()
            .ok_or_else(|| AppError::Unauthorized(SIGN_IN_TO_POST.to_string()))
    }

    /// A signed-in, enabled user: the bar for posting, liking and flagging
    pub fn require_poster(&self) -> AppResult<&UserInfo> {
        let user = self.require_user()?;
        if !user.enabled {
            return Err(AppError::Forbidden(ACCOUNT_DISABLED.to_string()));
        }
        Ok(user)
    }

    pub fn require_admin(&self) -> AppResult<&UserInfo> {
        let user = self.require_poster()?;
        if !user.is_admin() {
            return Err(AppError::Forbidden(ADMIN_ONLY.to_string()));
        }
        Ok(user)
    }

    /// The message a client shows instead of the post form, if any
    pub fn auth_error(&self) -> Option<&'static str> {
        match self.user() {
            None => Some(SIGN_IN_TO_POST),
            Some(user) if !user.enabled => Some(ACCOUNT_DISABLED),
            Some(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;

    fn viewer(enabled: bool, role: Role) -> ViewerContext {
        let user = UserInfo {
            id: UserId(7),
            ext_id: "sub-7".to_string(),
            email: "g@example.com".to_string(),
            enabled,
            role,
        };
        let author = Author {
            id: 1,
            user_id: UserId(7),
            name: "Grace".to_string(),
            picture: None,
        };
        ViewerContext::authenticated("req-test".to_string(), user, author)
    }

    #[test]
    fn test_anonymous_cannot_post() {
        let vc = ViewerContext::anonymous("req-test".to_string());
        assert!(!vc.is_authenticated());
        assert!(matches!(vc.require_poster(), Err(AppError::Unauthorized(msg)) if msg == SIGN_IN_TO_POST));
        assert_eq!(vc.auth_error(), Some(SIGN_IN_TO_POST));
    }

    #[test]
    fn test_disabled_user_gets_distinct_message() {
        let vc = viewer(false, Role::Member);
        assert!(vc.require_user().is_ok());
        assert!(matches!(vc.require_poster(), Err(AppError::Forbidden(msg)) if msg == ACCOUNT_DISABLED));
        assert_eq!(vc.auth_error(), Some(ACCOUNT_DISABLED));
    }

    #[test]
    fn test_disabled_admin_is_not_admin() {
        assert!(viewer(true, Role::Admin).is_admin());
        assert!(viewer(true, Role::Admin).require_admin().is_ok());
        assert!(!viewer(false, Role::Admin).is_admin());
        assert!(viewer(true, Role::Member).require_admin().is_err());
    }
}
