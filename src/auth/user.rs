use serde::Serialize;

use super::{Permission, Role};
use crate::error::AppError;

/// The signed-in account, with its profile role and admin flag resolved.
#[derive(Debug, Serialize, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: Role,
    pub provider_avatar_url: Option<String>,
    pub is_admin: bool,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbUser {
    pub id: Option<i64>,
    pub email: Option<String>,
    pub provider_avatar_url: Option<String>,
    pub role: Option<String>,
}

impl From<DbUser> for User {
    fn from(user: DbUser) -> Self {
        Self {
            id: user.id.unwrap_or_default(),
            email: user.email.unwrap_or_default(),
            role: user
                .role
                .as_deref()
                .and_then(|r| r.parse().ok())
                .unwrap_or_default(),
            provider_avatar_url: user.provider_avatar_url.filter(|url| !url.is_empty()),
            is_admin: false,
        }
    }
}

impl User {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.role.has_permission(permission)
    }

    pub fn require_permission(&self, permission: Permission) -> Result<(), AppError> {
        if self.role.has_permission(permission) {
            Ok(())
        } else {
            tracing::warn!(
                email = %self.email,
                role = %self.role.as_str(),
                permission = ?permission,
                "Permission denied"
            );
            Err(AppError::Authorization(format!(
                "Role {} may not perform this action",
                self.role
            )))
        }
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin {
            Ok(())
        } else {
            tracing::warn!(email = %self.email, "Admin access denied");
            Err(AppError::Authorization("Admin access required".to_string()))
        }
    }
}
