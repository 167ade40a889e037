use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;
use std::str::FromStr;

use crate::error::AppError;

pub const MAX_DEGREES: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Belt {
    #[default]
    White,
    Blue,
    Purple,
    Brown,
    Black,
}

impl Belt {
    pub const ALL: [Belt; 5] = [
        Belt::White,
        Belt::Blue,
        Belt::Purple,
        Belt::Brown,
        Belt::Black,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Belt::White => "white",
            Belt::Blue => "blue",
            Belt::Purple => "purple",
            Belt::Brown => "brown",
            Belt::Black => "black",
        }
    }

    /// Portuguese display name, the app's default language.
    pub fn portuguese(&self) -> &'static str {
        match self {
            Belt::White => "Branca",
            Belt::Blue => "Azul",
            Belt::Purple => "Roxa",
            Belt::Brown => "Marrom",
            Belt::Black => "Preta",
        }
    }
}

impl FromStr for Belt {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "white" => Ok(Belt::White),
            "blue" => Ok(Belt::Blue),
            "purple" => Ok(Belt::Purple),
            "brown" => Ok(Belt::Brown),
            "black" => Ok(Belt::Black),
            other => Err(AppError::Validation(format!("Unknown belt: {}", other))),
        }
    }
}

impl fmt::Display for Belt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    #[default]
    Pending,
    Active,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Pending => "pending",
            MemberStatus::Active => "active",
        }
    }
}

impl FromStr for MemberStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MemberStatus::Pending),
            "active" => Ok(MemberStatus::Active),
            other => Err(AppError::Validation(format!(
                "Unknown membership status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Training {
    pub id: i64,
    pub date: String,
    pub duration: String,
    pub technique: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub academy: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Training {
    pub fn duration_minutes(&self) -> i64 {
        self.duration.trim().parse::<i64>().unwrap_or(0)
    }

    /// Calendar day of the session. Full timestamps are accepted, only the
    /// leading `YYYY-MM-DD` is read.
    pub fn day(&self) -> Option<NaiveDate> {
        let day = self.date.get(..10).unwrap_or(&self.date);
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }
}

/// A training entry without identity, as typed into the log form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrainingDraft {
    pub date: String,
    pub duration: String,
    pub technique: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub academy: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl TrainingDraft {
    pub fn into_training(self, id: i64) -> Training {
        Training {
            id,
            date: self.date,
            duration: self.duration,
            technique: self.technique,
            notes: self.notes,
            academy: self.academy,
            kind: self.kind,
        }
    }
}

#[derive(sqlx::FromRow, Clone, Default)]
pub struct DbTraining {
    pub id: Option<i64>,
    pub user_id: Option<i64>,
    pub client_id: Option<i64>,
    pub date: Option<String>,
    pub duration: Option<String>,
    pub technique: Option<String>,
    pub notes: Option<String>,
    pub academy: Option<String>,
    pub kind: Option<String>,
}

impl From<DbTraining> for Training {
    fn from(db: DbTraining) -> Self {
        Self {
            id: db.client_id.or(db.id).unwrap_or_default(),
            date: db.date.unwrap_or_default(),
            duration: db.duration.unwrap_or_default(),
            technique: db.technique.unwrap_or_default(),
            notes: db.notes.unwrap_or_default(),
            academy: db.academy.filter(|a| !a.is_empty()),
            kind: db.kind.filter(|k| !k.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckIn {
    pub date: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub data: TemplateData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TemplateData {
    pub duration: String,
    pub technique: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub academy: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl TemplateData {
    pub fn to_draft(&self, date: &str) -> TrainingDraft {
        TrainingDraft {
            date: date.to_string(),
            duration: self.duration.clone(),
            technique: self.technique.clone(),
            notes: self.notes.clone(),
            academy: self.academy.clone(),
            kind: self.kind.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub belt: Belt,
    pub degrees: u8,
    pub academies: Vec<String>,
    pub main_academy: Option<String>,
    pub avatar_url: Option<String>,
    pub language: String,
    pub role: crate::auth::Role,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow, Clone, Default)]
pub struct DbProfile {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub belt: Option<String>,
    pub degrees: Option<i64>,
    pub academies: Option<String>,
    pub main_academy: Option<String>,
    pub avatar_url: Option<String>,
    pub language: Option<String>,
    pub role: Option<String>,
    pub updated_at: Option<NaiveDateTime>,
}

impl From<DbProfile> for Profile {
    fn from(db: DbProfile) -> Self {
        Self {
            id: db.id.unwrap_or_default(),
            name: db.name.unwrap_or_default(),
            belt: db
                .belt
                .as_deref()
                .and_then(|b| b.parse().ok())
                .unwrap_or_default(),
            degrees: db
                .degrees
                .map(|d| d.clamp(0, MAX_DEGREES as i64) as u8)
                .unwrap_or_default(),
            academies: db
                .academies
                .as_deref()
                .and_then(|a| serde_json::from_str(a).ok())
                .unwrap_or_default(),
            main_academy: db.main_academy.filter(|a| !a.is_empty()),
            avatar_url: db.avatar_url.filter(|a| !a.is_empty()),
            language: db.language.unwrap_or_else(|| "pt".to_string()),
            role: db
                .role
                .as_deref()
                .and_then(|r| r.parse().ok())
                .unwrap_or_default(),
            updated_at: db.updated_at.map(|dt| dt.and_utc()),
        }
    }
}

/// Profile fields owned by the user and pushed as a whole. Role travels separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProfilePayload {
    #[validate(length(max = 100, message = "Name is too long"))]
    pub name: String,
    pub belt: Belt,
    #[validate(range(max = 4, message = "Degrees must be between 0 and 4"))]
    pub degrees: u8,
    #[serde(default)]
    pub academies: Vec<String>,
    #[serde(default)]
    pub main_academy: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[validate(length(min = 2, max = 8, message = "Unsupported language"))]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<crate::auth::Role>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Academy {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub join_code: String,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Clone, Default)]
pub struct DbAcademy {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub owner_id: Option<i64>,
    pub join_code: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}

impl From<DbAcademy> for Academy {
    fn from(db: DbAcademy) -> Self {
        Self {
            id: db.id.unwrap_or_default(),
            name: db.name.unwrap_or_default(),
            owner_id: db.owner_id.unwrap_or_default(),
            join_code: db.join_code.unwrap_or_default(),
            created_at: db
                .created_at
                .map(|dt| dt.and_utc())
                .unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcademyMember {
    pub id: i64,
    pub academy_id: i64,
    pub user_id: i64,
    pub status: MemberStatus,
    pub joined_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Clone, Default)]
pub struct DbAcademyMember {
    pub id: Option<i64>,
    pub academy_id: Option<i64>,
    pub user_id: Option<i64>,
    pub status: Option<String>,
    pub joined_at: Option<NaiveDateTime>,
}

impl From<DbAcademyMember> for AcademyMember {
    fn from(db: DbAcademyMember) -> Self {
        Self {
            id: db.id.unwrap_or_default(),
            academy_id: db.academy_id.unwrap_or_default(),
            user_id: db.user_id.unwrap_or_default(),
            status: db
                .status
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            joined_at: db
                .joined_at
                .map(|dt| dt.and_utc())
                .unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberWithProfile {
    #[serde(flatten)]
    pub member: AcademyMember,
    pub profile: Option<Profile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipWithAcademy {
    #[serde(flatten)]
    pub member: AcademyMember,
    pub academy: Academy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn belt_parses_case_insensitively() {
        assert_eq!("Purple".parse::<Belt>().unwrap(), Belt::Purple);
        assert!("green".parse::<Belt>().is_err());
    }

    #[test]
    fn training_serializes_kind_as_type() {
        let training = Training {
            id: 1,
            date: "2024-05-01".into(),
            duration: "60".into(),
            technique: "Armbar".into(),
            notes: String::new(),
            academy: None,
            kind: Some("gi".into()),
        };

        let value = serde_json::to_value(&training).unwrap();
        assert_eq!(value["type"], "gi");
        assert!(value.get("academy").is_none());
    }

    #[test]
    fn invalid_duration_counts_as_zero() {
        let mut training = TrainingDraft {
            date: "2024-05-01".into(),
            duration: "abc".into(),
            ..Default::default()
        }
        .into_training(7);
        assert_eq!(training.duration_minutes(), 0);

        training.duration = " 90 ".into();
        assert_eq!(training.duration_minutes(), 90);
    }

    #[test]
    fn db_profile_falls_back_on_bad_columns() {
        let profile = Profile::from(DbProfile {
            id: Some(3),
            belt: Some("plaid".into()),
            degrees: Some(9),
            academies: Some("not json".into()),
            ..Default::default()
        });

        assert_eq!(profile.belt, Belt::White);
        assert_eq!(profile.degrees, MAX_DEGREES);
        assert!(profile.academies.is_empty());
        assert_eq!(profile.language, "pt");
    }
}
