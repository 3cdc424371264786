/**
 * REQUIREMENT: Bearer-token authentication models for multi-user collaboration
 * PURPOSE: JWT claims, the ordered role ladder, and the resolved user identity
 */
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::cursor::color_for_user;

/// JWT claims carried in the bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Stable user id issued by the external auth service
    pub sub: String,
    #[serde(default)]
    pub username: Option<String>,
    pub exp: usize,
    pub iat: usize,
}

/// Ordered role ladder: guest < user < annotator < moderator < admin
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Guest,
    User,
    Annotator,
    Moderator,
    Admin,
}

impl Default for UserRole {
    fn default() -> Self {
        UserRole::Guest
    }
}

impl std::str::FromStr for UserRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "guest" => Ok(UserRole::Guest),
            "user" => Ok(UserRole::User),
            "annotator" => Ok(UserRole::Annotator),
            "moderator" => Ok(UserRole::Moderator),
            "admin" => Ok(UserRole::Admin),
            _ => Err(()),
        }
    }
}

/// The identity attached to a session after the gate admits it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    pub id: String,
    pub username: String,
    pub role: UserRole,
    pub permissions: HashSet<String>,
    /// Deterministically assigned cursor color
    pub color: String,
}

impl AuthenticatedUser {
    pub fn new(id: &str, username: &str, role: UserRole, permissions: HashSet<String>) -> Self {
        Self {
            id: id.to_string(),
            username: username.to_string(),
            role,
            permissions,
            color: color_for_user(id).to_string(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role >= UserRole::Admin
            || self.permissions.contains("admin")
            || self.permissions.contains("super_admin")
    }

    pub fn can_moderate(&self) -> bool {
        self.role >= UserRole::Moderator || self.is_admin()
    }
}
