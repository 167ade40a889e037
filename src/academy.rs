use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{Belt, MAX_DEGREES};

pub const JOIN_CODE_LENGTH: usize = 6;
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Six uppercase alphanumerics. Collisions with existing codes are not checked.
pub fn generate_join_code() -> String {
    let mut rng = rand::rng();
    (0..JOIN_CODE_LENGTH)
        .map(|_| JOIN_CODE_ALPHABET[rng.random_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}

pub fn normalize_join_code(code: &str) -> String {
    code.trim().to_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rank {
    pub belt: Belt,
    pub degrees: u8,
}

impl Rank {
    pub fn new(belt: Belt, degrees: u8) -> Result<Self, AppError> {
        if degrees > MAX_DEGREES {
            return Err(AppError::Validation(format!(
                "Degrees must be between 0 and {}",
                MAX_DEGREES
            )));
        }
        Ok(Self { belt, degrees })
    }

    /// A belt change always restarts degrees at zero, whatever was requested.
    pub fn promote(self, belt: Belt, degrees: Option<u8>) -> Result<Self, AppError> {
        if belt != self.belt {
            return Ok(Self { belt, degrees: 0 });
        }
        Self::new(belt, degrees.unwrap_or(self.degrees))
    }
}
