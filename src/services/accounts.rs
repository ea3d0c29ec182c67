// Account resolution - maps a verified identity onto the users/authors tables

use tracing::info;

use crate::config::AdminConfig;
use crate::core::Role;
use crate::database::ShoutDatabase;
use crate::error::AppResult;
use crate::infrastructure::identity::IdentityAssertion;
use crate::models::{Author, UserInfo};

/// Find or lazily create the account for an identity.
///
/// Identities listed in the admin policy are promoted on sign-in, and the
/// author's display name and picture follow the identity provider.
pub async fn resolve_user(
    db: &ShoutDatabase,
    assertion: &IdentityAssertion,
    admin: &AdminConfig,
) -> AppResult<(UserInfo, Author)> {
    let bootstrap_admin = admin.is_bootstrap_admin(&assertion.sub);
    let name = display_name(assertion);

    let (mut user, mut author) = match db.find_user_by_ext_id(&assertion.sub).await? {
        Some(user) => match db.get_author_for_user(user.id).await? {
            Some(author) => (user, author),
            // Author row went missing; recreate it through the same idempotent path.
            None => {
                db.create_user_with_author(
                    &assertion.sub,
                    &assertion.email,
                    &name,
                    assertion.picture.as_deref(),
                    user.role,
                )
                .await?
            }
        },
        None => {
            let role = if bootstrap_admin { Role::Admin } else { Role::Member };
            let (user, author) = db
                .create_user_with_author(
                    &assertion.sub,
                    &assertion.email,
                    &name,
                    assertion.picture.as_deref(),
                    role,
                )
                .await?;
            info!("Created user {} for identity {}", user.id, assertion.sub);
            (user, author)
        }
    };

    if bootstrap_admin && user.role != Role::Admin {
        db.set_user_role(user.id, Role::Admin).await?;
        user.role = Role::Admin;
        info!("Promoted user {} to admin", user.id);
    }

    if author.name != name || author.picture != assertion.picture {
        db.update_author_profile(user.id, &name, assertion.picture.as_deref())
            .await?;
        author.name = name;
        author.picture = assertion.picture.clone();
    }

    Ok((user, author))
}

fn display_name(assertion: &IdentityAssertion) -> String {
    if assertion.name.trim().is_empty() {
        // Fall back to the local part of the email
        assertion
            .email
            .split('@')
            .next()
            .unwrap_or_default()
            .to_string()
    } else {
        assertion.name.trim().to_string()
    }
}
