use chrono::{FixedOffset, Local, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{CheckIn, Training};

fn parse_day(date: &str) -> Option<NaiveDate> {
    let date = date.trim();
    NaiveDate::parse_from_str(date.get(..10).unwrap_or(date), "%Y-%m-%d").ok()
}

/// Consecutive days with a check-in, counted back from `today`.
///
/// Check-ins are walked newest first; the walk stops at the first entry that is
/// not exactly `streak` days before `today`.
pub fn calculate_streak(check_ins: &[CheckIn], today: NaiveDate) -> u32 {
    let mut days: Vec<NaiveDate> = check_ins.iter().filter_map(|c| parse_day(&c.date)).collect();
    days.sort_unstable_by(|a, b| b.cmp(a));

    let mut streak = 0u32;
    for day in days {
        if (today - day).num_days() == i64::from(streak) {
            streak += 1;
        } else {
            break;
        }
    }
    streak
}

pub fn has_checked_in(check_ins: &[CheckIn], today: NaiveDate) -> bool {
    check_ins
        .iter()
        .any(|c| parse_day(&c.date) == Some(today))
}

pub fn total_minutes(trainings: &[Training]) -> i64 {
    trainings.iter().map(Training::duration_minutes).sum()
}

/// Whole hours, as shown on the profile card.
pub fn total_hours(trainings: &[Training]) -> i64 {
    total_minutes(trainings) / 60
}

/// Session count per `YYYY-MM`, oldest month first.
pub fn monthly_sessions(trainings: &[Training]) -> Vec<(String, usize)> {
    let mut months: BTreeMap<String, usize> = BTreeMap::new();
    for training in trainings {
        if let Some(day) = parse_day(&training.date) {
            *months.entry(day.format("%Y-%m").to_string()).or_default() += 1;
        }
    }
    months.into_iter().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub total_trainings: usize,
    pub total_minutes: i64,
    pub total_hours: f64,
    pub average_hours: f64,
}

pub fn user_stats(trainings: &[Training]) -> UserStats {
    let total_trainings = trainings.len();
    let total_minutes = total_minutes(trainings);
    let total_hours = total_minutes as f64 / 60.0;
    let average_hours = if total_trainings > 0 {
        total_hours / total_trainings as f64
    } else {
        0.0
    };

    UserStats {
        total_trainings,
        total_minutes,
        total_hours,
        average_hours,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Achievement {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
}

type Check = fn(&[Training], &[CheckIn], FixedOffset) -> bool;

const ACHIEVEMENTS: [(Achievement, Check); 6] = [
    (
        Achievement {
            id: "first_step",
            title: "First Step",
            description: "Log your first training",
        },
        |t, _, _| !t.is_empty(),
    ),
    (
        Achievement {
            id: "consistent",
            title: "Consistent",
            description: "Log 10 trainings",
        },
        |t, _, _| t.len() >= 10,
    ),
    (
        Achievement {
            id: "dedicated",
            title: "Dedicated",
            description: "Log 50 trainings",
        },
        |t, _, _| t.len() >= 50,
    ),
    (
        Achievement {
            id: "master",
            title: "Master",
            description: "Log 100 trainings",
        },
        |t, _, _| t.len() >= 100,
    ),
    (
        Achievement {
            id: "early_bird",
            title: "Early Bird",
            description: "Train before 8 AM",
        },
        |t, _, offset| t.iter().any(|tr| local_hour(&tr.date, offset).is_some_and(|h| h < 8)),
    ),
    (
        Achievement {
            id: "night_owl",
            title: "Night Owl",
            description: "Train after 8 PM",
        },
        |t, _, offset| t.iter().any(|tr| local_hour(&tr.date, offset).is_some_and(|h| h >= 20)),
    ),
];

pub fn all_achievements() -> impl Iterator<Item = Achievement> {
    ACHIEVEMENTS.iter().map(|(achievement, _)| *achievement)
}

/// Hour of day for a training date. A bare date is midnight UTC seen from `offset`.
fn local_hour(date: &str, offset: FixedOffset) -> Option<u32> {
    let date = date.trim();
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(date, format) {
            return Some(dt.hour());
        }
    }
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    let midnight = Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0)?);
    Some(midnight.with_timezone(&offset).hour())
}

pub fn unlocked_with_offset(
    trainings: &[Training],
    check_ins: &[CheckIn],
    offset: FixedOffset,
) -> Vec<Achievement> {
    ACHIEVEMENTS
        .iter()
        .filter(|(_, check)| check(trainings, check_ins, offset))
        .map(|(achievement, _)| *achievement)
        .collect()
}

pub fn unlocked(trainings: &[Training], check_ins: &[CheckIn]) -> Vec<Achievement> {
    let offset = Local::now().offset().fix();
    unlocked_with_offset(trainings, check_ins, offset)
}
