//! The local side of the journal: a JSON key-value store on disk, an HTTP
//! client for the backend, the reconciler that keeps the two in step, and the
//! helpers the command line front end is built from.

pub mod backup;
pub mod journal;
pub mod remote;
pub mod store;
pub mod sync;
pub mod timer;

use thiserror::Error;

pub use remote::{HttpBackend, RemoteBackend};
pub use store::{LocalStore, StoreChange};
pub use sync::{OutboxOp, RetryPolicy, SyncReconciler, SyncStatus};

pub mod keys {
    pub const TRAININGS: &str = "bjj-trainings";
    pub const CHECK_INS: &str = "bjj-checkins";
    pub const TEMPLATES: &str = "bjj-templates";
    pub const NAME: &str = "bjj-name";
    pub const BELT: &str = "bjj-belt";
    pub const DEGREES: &str = "bjj-degrees";
    pub const ACADEMIES: &str = "bjj-academies";
    pub const MAIN_ACADEMY: &str = "bjj-main-academy";
    pub const AVATAR_URL: &str = "bjj-avatar-url";
    pub const LANGUAGE: &str = "bjj-language";
    pub const ROLE: &str = "bjj-role";
    pub const OUTBOX: &str = "bjj-outbox";
    /// Operations the server refused for good, kept for inspection.
    pub const OUTBOX_PARKED: &str = "bjj-outbox-parked";

    /// Keys whose changes are pushed to the remote profile.
    pub const PROFILE: [&str; 7] = [
        NAME,
        BELT,
        DEGREES,
        ACADEMIES,
        MAIN_ACADEMY,
        AVATAR_URL,
        LANGUAGE,
    ];

    pub fn is_profile_key(key: &str) -> bool {
        PROFILE.contains(&key)
    }
}

pub const DEFAULT_LANGUAGE: &str = "pt";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Not signed in: {0}")]
    Unauthorized(String),

    #[error("Server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Import failed: {0}")]
    Import(String),
}

impl ClientError {
    /// Whether sending the same request again cannot succeed. Client errors
    /// other than timeouts and rate limits are permanent; transport and
    /// server failures are not.
    pub fn is_permanent(&self) -> bool {
        match self {
            ClientError::Api { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            ClientError::NotFound(_) | ClientError::Validation(_) => true,
            _ => false,
        }
    }
}
