/**
 * REQUIREMENT: Bearer credentials are verified at handshake time and the user
 * is resolved through the REST user-lookup interface
 * PURPOSE: Token verification and identity resolution for the session gate
 */
use jsonwebtoken::{decode, DecodingKey, Validation};
use std::sync::Arc;

use crate::auth::models::{AuthenticatedUser, Claims, UserRole};
use crate::error::{CollabError, CollabResult};
use crate::services::rest_api::RestApiClient;

/// Authentication service
#[derive(Clone)]
pub struct AuthService {
    jwt_secret: String,
    rest_api: Arc<RestApiClient>,
}

impl AuthService {
    /// Create new authentication service
    pub fn new(jwt_secret: &str, rest_api: Arc<RestApiClient>) -> Self {
        Self {
            jwt_secret: jwt_secret.to_string(),
            rest_api,
        }
    }

    /// Verify a bearer token and extract claims
    pub fn verify_token(&self, token: &str) -> CollabResult<Claims> {
        if token.is_empty() {
            return Err(CollabError::MissingToken);
        }
        let validation = Validation::default();
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_ref()),
            &validation,
        )?;
        Ok(token_data.claims)
    }

    /// Full handshake: verify the credential, then resolve the user record.
    /// Unknown users are rejected even when the token itself verifies.
    pub async fn authenticate(&self, token: Option<&str>) -> CollabResult<AuthenticatedUser> {
        let token = token.ok_or(CollabError::MissingToken)?;
        let claims = self.verify_token(token)?;
        let rest_user = self.rest_api.lookup_user(&claims.sub).await?;

        let role = rest_user.role.parse::<UserRole>().unwrap_or_default();
        Ok(AuthenticatedUser::new(
            &rest_user.id,
            &rest_user.username,
            role,
            rest_user.permissions.into_iter().collect(),
        ))
    }

    /// Project access check consulted on join
    pub async fn check_project_access(&self, project_id: &str, user_id: &str) -> CollabResult<()> {
        if self.rest_api.check_project_access(project_id, user_id).await? {
            Ok(())
        } else {
            Err(CollabError::Authorization(format!(
                "user {} has no access to project {}",
                user_id, project_id
            )))
        }
    }
}
