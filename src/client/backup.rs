use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ClientError, LocalStore, keys};
use crate::auth::Role;
use crate::models::{Belt, CheckIn, Training};

/// Portable copy of the journal. Every field is optional on import so
/// older or partial files only overwrite what they carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trainings: Option<Vec<Training>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_ins: Option<Vec<CheckIn>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub belt: Option<Belt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degrees: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub academies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_academy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

pub fn export(store: &LocalStore) -> Backup {
    Backup {
        trainings: Some(store.trainings()),
        check_ins: Some(store.check_ins()),
        belt: Some(store.belt()),
        degrees: Some(store.degrees()),
        name: Some(store.name()),
        academies: Some(store.academies()),
        main_academy: Some(store.main_academy().unwrap_or_default()),
        avatar_url: Some(store.avatar_url().unwrap_or_default()),
        language: Some(store.language()),
        role: Some(store.role()),
    }
}

pub fn file_name(date: NaiveDate) -> String {
    format!("my-bjj-backup-{}.json", date.format("%Y-%m-%d"))
}

/// Parses `raw` and writes the keys it carries. Returns how many were written.
pub fn import(store: &LocalStore, raw: &str) -> Result<usize, ClientError> {
    let backup: Backup =
        serde_json::from_str(raw).map_err(|e| ClientError::Import(e.to_string()))?;
    if let Some(bad) = backup
        .trainings
        .iter()
        .flatten()
        .find(|t| t.day().is_none())
    {
        return Err(ClientError::Import(format!(
            "Training {} has an invalid date: {}",
            bad.id, bad.date
        )));
    }
    let mut written = 0;

    if let Some(trainings) = &backup.trainings {
        store.set(keys::TRAININGS, trainings)?;
        written += 1;
    }
    if let Some(check_ins) = &backup.check_ins {
        store.set(keys::CHECK_INS, check_ins)?;
        written += 1;
    }
    if let Some(belt) = &backup.belt {
        store.set(keys::BELT, belt)?;
        written += 1;
    }
    if let Some(degrees) = backup.degrees {
        store.set_degrees(degrees)?;
        written += 1;
    }
    if let Some(name) = &backup.name {
        store.set(keys::NAME, name)?;
        written += 1;
    }
    if let Some(academies) = &backup.academies {
        store.set(keys::ACADEMIES, academies)?;
        written += 1;
    }
    if let Some(main) = &backup.main_academy {
        store.set(keys::MAIN_ACADEMY, main)?;
        written += 1;
    }
    if let Some(avatar) = &backup.avatar_url {
        store.set(keys::AVATAR_URL, avatar)?;
        written += 1;
    }
    if let Some(language) = &backup.language {
        store.set(keys::LANGUAGE, language)?;
        written += 1;
    }
    if let Some(role) = &backup.role {
        store.set(keys::ROLE, role)?;
        written += 1;
    }

    info!(written, "Backup imported");
    Ok(written)
}
