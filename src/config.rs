use std::path::PathBuf;

use crate::error::AppError;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://bjj-journal.db?mode=rwc";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash-latest";
pub const DEFAULT_AVATAR_MAX_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_SESSION_HOURS: i64 = 168;

/// Server settings resolved from the process environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub admin_emails: Vec<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: Option<String>,
    pub avatar_dir: PathBuf,
    pub public_base_url: String,
    pub avatar_max_bytes: usize,
    pub session_hours: i64,
    pub allow_destructive_migrations: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            admin_emails: Vec::new(),
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            gemini_base_url: None,
            avatar_dir: PathBuf::from("avatars"),
            public_base_url: String::new(),
            avatar_max_bytes: DEFAULT_AVATAR_MAX_BYTES,
            session_hours: DEFAULT_SESSION_HOURS,
            allow_destructive_migrations: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        Ok(Self {
            database_url: var("DATABASE_URL").unwrap_or(defaults.database_url),
            admin_emails: var("ADMIN_EMAILS")
                .map(|list| parse_email_list(&list))
                .unwrap_or_default(),
            gemini_api_key: var("GEMINI_API_KEY").filter(|key| !key.contains("placeholder")),
            gemini_model: var("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            gemini_base_url: var("GEMINI_BASE_URL"),
            avatar_dir: var("AVATAR_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.avatar_dir),
            public_base_url: var("PUBLIC_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_default(),
            avatar_max_bytes: parse_var("AVATAR_MAX_BYTES")?.unwrap_or(defaults.avatar_max_bytes),
            session_hours: parse_var("SESSION_HOURS")?.unwrap_or(defaults.session_hours),
            allow_destructive_migrations: parse_var("ALLOW_DESTRUCTIVE_MIGRATIONS")?
                .unwrap_or(false),
        })
    }

    pub fn is_admin(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        self.admin_emails.iter().any(|admin| *admin == email)
    }

    pub fn avatar_public_url(&self, file_name: &str) -> String {
        format!("{}/avatars/{}", self.public_base_url, file_name)
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, AppError> {
    match var(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| AppError::Validation(format!("{} has an invalid value: {}", name, raw))),
        None => Ok(None),
    }
}

fn parse_email_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|email| email.trim().to_lowercase())
        .filter(|email| !email.is_empty())
        .collect()
}
