use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ViewOwnProfile,
    EditOwnProfile,
    LogTrainings,
    JoinAcademy,
    RequestSuggestions,

    CreateAcademy,
    ManageMembers,
    PromoteMembers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Student,
    Professor,
    Owner,
}

static STUDENT_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.insert(Permission::ViewOwnProfile);
    permissions.insert(Permission::EditOwnProfile);
    permissions.insert(Permission::LogTrainings);
    permissions.insert(Permission::JoinAcademy);
    permissions.insert(Permission::RequestSuggestions);

    permissions
});

static PROFESSOR_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.extend(STUDENT_PERMISSIONS.iter().copied());
    permissions.remove(&Permission::JoinAcademy);

    permissions.insert(Permission::CreateAcademy);
    permissions.insert(Permission::ManageMembers);
    permissions.insert(Permission::PromoteMembers);

    permissions
});

// Owners and professors run an academy the same way.
static OWNER_PERMISSIONS: Lazy<HashSet<Permission>> =
    Lazy::new(|| PROFESSOR_PERMISSIONS.iter().copied().collect());

impl Role {
    pub fn permissions(&self) -> &'static HashSet<Permission> {
        match self {
            Role::Student => &STUDENT_PERMISSIONS,
            Role::Professor => &PROFESSOR_PERMISSIONS,
            Role::Owner => &OWNER_PERMISSIONS,
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    pub fn runs_academy(&self) -> bool {
        matches!(self, Role::Professor | Role::Owner)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Professor => "professor",
            Role::Owner => "owner",
        }
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "professor" => Ok(Role::Professor),
            "owner" => Ok(Role::Owner),
            _ => Err(AppError::Validation(format!("Unknown role: {}", s))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
