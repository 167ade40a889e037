use chrono::{NaiveDate, Utc};

use super::keys;
use super::{ClientError, DEFAULT_LANGUAGE, LocalStore};
use crate::auth::Role;
use crate::models::{
    Belt, CheckIn, MAX_DEGREES, ProfilePayload, Template, TemplateData, Training, TrainingDraft,
};

/// Epoch-millis id, bumped past any id already taken.
fn next_id(now_ms: i64, trainings: &[Training]) -> i64 {
    let max = trainings.iter().map(|t| t.id).max().unwrap_or(0);
    now_ms.max(max + 1)
}

impl LocalStore {
    pub fn trainings(&self) -> Vec<Training> {
        self.get(keys::TRAININGS, Vec::new())
    }

    /// Adds a training at the front of the list, newest first.
    pub fn log_training(&self, draft: TrainingDraft) -> Result<Training, ClientError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut created = None;
        self.update(keys::TRAININGS, Vec::<Training>::new(), |mut trainings| {
            let training = draft.into_training(next_id(now_ms, &trainings));
            trainings.insert(0, training.clone());
            created = Some(training);
            trainings
        })?;
        created.ok_or_else(|| ClientError::Validation("Training was not stored".to_string()))
    }

    pub fn edit_training(&self, id: i64, draft: TrainingDraft) -> Result<Training, ClientError> {
        let mut edited = None;
        self.update(keys::TRAININGS, Vec::<Training>::new(), |mut trainings| {
            if let Some(slot) = trainings.iter_mut().find(|t| t.id == id) {
                *slot = draft.into_training(id);
                edited = Some(slot.clone());
            }
            trainings
        })?;
        edited.ok_or_else(|| ClientError::NotFound(format!("Training {}", id)))
    }

    pub fn delete_training(&self, id: i64) -> Result<bool, ClientError> {
        let mut removed = false;
        self.update(keys::TRAININGS, Vec::<Training>::new(), |mut trainings| {
            let before = trainings.len();
            trainings.retain(|t| t.id != id);
            removed = trainings.len() != before;
            trainings
        })?;
        Ok(removed)
    }

    pub fn check_ins(&self) -> Vec<CheckIn> {
        self.get(keys::CHECK_INS, Vec::new())
    }

    /// Records today's check-in. Returns `None` when today is already checked in.
    pub fn check_in(&self, today: NaiveDate) -> Result<Option<CheckIn>, ClientError> {
        let date = today.format("%Y-%m-%d").to_string();
        let mut created = None;
        self.update(keys::CHECK_INS, Vec::<CheckIn>::new(), |mut check_ins| {
            if !check_ins.iter().any(|c| c.date == date) {
                let check_in = CheckIn {
                    date: date.clone(),
                    timestamp: Utc::now().timestamp_millis(),
                };
                check_ins.insert(0, check_in.clone());
                created = Some(check_in);
            }
            check_ins
        })?;
        Ok(created)
    }

    pub fn templates(&self) -> Vec<Template> {
        self.get(keys::TEMPLATES, Vec::new())
    }

    pub fn save_template(&self, name: &str, data: TemplateData) -> Result<Template, ClientError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ClientError::Validation("Template name is required".to_string()));
        }

        let template = Template {
            id: Utc::now().timestamp_millis().to_string(),
            name: name.to_string(),
            data,
        };
        let stored = template.clone();
        self.update(keys::TEMPLATES, Vec::<Template>::new(), move |mut templates| {
            templates.push(stored);
            templates
        })?;
        Ok(template)
    }

    pub fn delete_template(&self, id: &str) -> Result<bool, ClientError> {
        let mut removed = false;
        self.update(keys::TEMPLATES, Vec::<Template>::new(), |mut templates| {
            let before = templates.len();
            templates.retain(|t| t.id != id && t.name != id);
            removed = templates.len() != before;
            templates
        })?;
        Ok(removed)
    }

    /// Logs a new training prefilled from a template, matched by id or name.
    pub fn apply_template(&self, id_or_name: &str, date: &str) -> Result<Training, ClientError> {
        let template = self
            .templates()
            .into_iter()
            .find(|t| t.id == id_or_name || t.name == id_or_name)
            .ok_or_else(|| ClientError::NotFound(format!("Template {}", id_or_name)))?;
        self.log_training(template.data.to_draft(date))
    }

    pub fn name(&self) -> String {
        self.get(keys::NAME, String::new())
    }

    pub fn set_name(&self, name: &str) -> Result<(), ClientError> {
        self.set(keys::NAME, name.trim())
    }

    pub fn belt(&self) -> Belt {
        self.get(keys::BELT, Belt::White)
    }

    /// Changing to a different belt resets degrees.
    pub fn set_belt(&self, belt: Belt) -> Result<(), ClientError> {
        if self.belt() != belt {
            self.set(keys::DEGREES, &0u8)?;
        }
        self.set(keys::BELT, &belt)
    }

    pub fn degrees(&self) -> u8 {
        self.get(keys::DEGREES, 0u8).min(MAX_DEGREES)
    }

    pub fn set_degrees(&self, degrees: u8) -> Result<(), ClientError> {
        self.set(keys::DEGREES, &degrees.min(MAX_DEGREES))
    }

    pub fn academies(&self) -> Vec<String> {
        self.get(keys::ACADEMIES, Vec::new())
    }

    pub fn main_academy(&self) -> Option<String> {
        self.get_opt::<String>(keys::MAIN_ACADEMY)
            .filter(|a| !a.is_empty())
    }

    /// The first academy added becomes the main one.
    pub fn add_academy(&self, name: &str) -> Result<bool, ClientError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ClientError::Validation("Academy name is required".to_string()));
        }

        let mut first = false;
        let mut added = false;
        self.update(keys::ACADEMIES, Vec::<String>::new(), |mut academies| {
            if !academies.contains(&name) {
                first = academies.is_empty();
                academies.push(name.clone());
                added = true;
            }
            academies
        })?;

        if first {
            self.set(keys::MAIN_ACADEMY, &name)?;
        }
        Ok(added)
    }

    /// Removing the main academy promotes the next one in the list.
    pub fn remove_academy(&self, name: &str) -> Result<bool, ClientError> {
        let mut removed = false;
        let remaining = self.update(keys::ACADEMIES, Vec::<String>::new(), |mut academies| {
            let before = academies.len();
            academies.retain(|a| a != name);
            removed = academies.len() != before;
            academies
        })?;

        if removed && self.main_academy().as_deref() == Some(name) {
            match remaining.first() {
                Some(next) => self.set(keys::MAIN_ACADEMY, next)?,
                None => self.set(keys::MAIN_ACADEMY, "")?,
            }
        }
        Ok(removed)
    }

    pub fn set_main_academy(&self, name: &str) -> Result<(), ClientError> {
        if !self.academies().iter().any(|a| a == name) {
            return Err(ClientError::NotFound(format!("Academy {}", name)));
        }
        self.set(keys::MAIN_ACADEMY, name)
    }

    pub fn avatar_url(&self) -> Option<String> {
        self.get_opt::<String>(keys::AVATAR_URL)
            .filter(|a| !a.is_empty())
    }

    pub fn set_avatar_url(&self, url: &str) -> Result<(), ClientError> {
        self.set(keys::AVATAR_URL, url)
    }

    pub fn language(&self) -> String {
        self.get(keys::LANGUAGE, DEFAULT_LANGUAGE.to_string())
    }

    pub fn set_language(&self, language: &str) -> Result<(), ClientError> {
        self.set(keys::LANGUAGE, language)
    }

    pub fn role(&self) -> Role {
        self.get(keys::ROLE, Role::Student)
    }

    pub fn set_role(&self, role: Role) -> Result<(), ClientError> {
        self.set(keys::ROLE, &role)
    }

    /// Local profile fields shaped for a remote upsert. Role is left to the server.
    pub fn profile_payload(&self) -> ProfilePayload {
        ProfilePayload {
            name: self.name(),
            belt: self.belt(),
            degrees: self.degrees(),
            academies: self.academies(),
            main_academy: self.main_academy(),
            avatar_url: self.avatar_url(),
            language: self.language(),
            role: None,
        }
    }
}
