use crate::{
    auth::{DbUser, DbUserSession, Role, User, UserSession},
    error::AppError,
};
use chrono::{NaiveDateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use tracing::{info, instrument, warn};

use crate::models::{
    Academy, AcademyMember, Belt, DbAcademy, DbAcademyMember, DbProfile, DbTraining, MAX_DEGREES,
    MemberStatus, MemberWithProfile, MembershipWithAcademy, Profile, ProfilePayload, Training,
};

const USER_COLUMNS: &str = "SELECT u.id, u.email, u.provider_avatar_url, p.role
     FROM users u LEFT JOIN profiles p ON p.id = u.id";

const PROFILE_COLUMNS: &str = "SELECT id, name, belt, degrees, academies, main_academy, avatar_url, language, role, updated_at FROM profiles";

const TRAINING_COLUMNS: &str = "SELECT id, user_id, client_id, date, duration, technique, notes, academy, type AS kind FROM trainings";

const ACADEMY_COLUMNS: &str = "SELECT id, name, owner_id, join_code, created_at FROM academies";

const MEMBER_COLUMNS: &str = "SELECT id, academy_id, user_id, status, joined_at FROM academy_members";

#[instrument(skip(pool, password), fields(email = %email))]
pub async fn create_user(
    pool: &Pool<Sqlite>,
    email: &str,
    password: &str,
    provider_avatar_url: Option<&str>,
) -> Result<User, AppError> {
    info!("Creating user");
    let email = email.trim().to_lowercase();

    let existing = sqlx::query("SELECT id FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(pool)
        .await?;

    if existing.is_some() {
        return Err(AppError::Conflict("Email already registered".to_string()));
    }

    let hashed_password = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;

    let result =
        sqlx::query("INSERT INTO users (email, password, provider_avatar_url) VALUES (?, ?, ?)")
            .bind(&email)
            .bind(&hashed_password)
            .bind(provider_avatar_url.filter(|url| !url.trim().is_empty()))
            .execute(pool)
            .await?;

    get_user(pool, result.last_insert_rowid()).await
}

/// Returns `None` when the email is unknown or the password does not match.
#[instrument(skip(pool, password), fields(email = %email))]
pub async fn authenticate_user(
    pool: &Pool<Sqlite>,
    email: &str,
    password: &str,
) -> Result<Option<User>, AppError> {
    info!("Authenticating user");
    let email = email.trim().to_lowercase();

    let row = sqlx::query("SELECT id, password FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        warn!("Sign-in for unknown email");
        return Ok(None);
    };

    let id: i64 = row.try_get("id")?;
    let hash: String = row.try_get("password")?;

    if hash.is_empty() || !bcrypt::verify(password, &hash)? {
        warn!("Sign-in with wrong password");
        return Ok(None);
    }

    get_user(pool, id).await.map(Some)
}

#[instrument(skip(pool))]
pub async fn get_user(pool: &Pool<Sqlite>, id: i64) -> Result<User, AppError> {
    info!("Fetching user by ID");
    let row = sqlx::query_as::<_, DbUser>(&format!("{} WHERE u.id = ?", USER_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(user) => Ok(User::from(user)),
        _ => Err(AppError::NotFound(format!(
            "User with id {} not found in database",
            id
        ))),
    }
}

#[instrument(skip(pool, token))]
pub async fn create_user_session(
    pool: &Pool<Sqlite>,
    user_id: i64,
    token: &str,
    expires_at: NaiveDateTime,
) -> Result<i64, AppError> {
    info!("Creating user session");

    let res = sqlx::query("INSERT INTO user_sessions (user_id, token, expires_at) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(token)
        .bind(expires_at)
        .execute(pool)
        .await?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip(pool, token))]
pub async fn get_session_by_token(
    pool: &Pool<Sqlite>,
    token: &str,
) -> Result<UserSession, AppError> {
    info!("Getting session by token");

    let session = sqlx::query_as::<_, DbUserSession>(
        "SELECT id, user_id, token, created_at, expires_at FROM user_sessions WHERE token = ?",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    match session {
        Some(session) => Ok(UserSession::from(session)),
        _ => Err(AppError::Authentication(
            "Invalid session token".to_string(),
        )),
    }
}

#[instrument(skip(pool, token))]
pub async fn invalidate_session(pool: &Pool<Sqlite>, token: &str) -> Result<(), AppError> {
    info!("Invalidating session");

    sqlx::query("DELETE FROM user_sessions WHERE token = ?")
        .bind(token)
        .execute(pool)
        .await?;

    Ok(())
}

#[instrument(skip(pool))]
pub async fn clean_expired_sessions(pool: &Pool<Sqlite>) -> Result<u64, AppError> {
    info!("Cleaning expired sessions");

    let now = Utc::now().naive_utc();

    let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at < ?")
        .bind(now)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

#[instrument(skip(pool))]
pub async fn get_profile(pool: &Pool<Sqlite>, user_id: i64) -> Result<Option<Profile>, AppError> {
    info!("Fetching profile");
    let row = sqlx::query_as::<_, DbProfile>(&format!("{} WHERE id = ?", PROFILE_COLUMNS))
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(Profile::from))
}

/// Full overwrite of the user-owned profile fields. A missing role keeps the stored one.
#[instrument(skip(pool, payload))]
pub async fn upsert_profile(
    pool: &Pool<Sqlite>,
    user_id: i64,
    payload: &ProfilePayload,
) -> Result<Profile, AppError> {
    info!("Upserting profile");

    let academies = serde_json::to_string(&payload.academies)?;
    let role = payload.role.map(|r| r.as_str());
    let now = Utc::now().naive_utc();

    sqlx::query(
        "INSERT INTO profiles (id, name, belt, degrees, academies, main_academy, avatar_url, language, role, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, COALESCE(?9, 'student'), ?10)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            belt = excluded.belt,
            degrees = excluded.degrees,
            academies = excluded.academies,
            main_academy = excluded.main_academy,
            avatar_url = excluded.avatar_url,
            language = excluded.language,
            role = COALESCE(?9, profiles.role),
            updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(&payload.name)
    .bind(payload.belt.as_str())
    .bind(payload.degrees.min(MAX_DEGREES) as i64)
    .bind(&academies)
    .bind(payload.main_academy.as_deref())
    .bind(payload.avatar_url.as_deref())
    .bind(&payload.language)
    .bind(role)
    .bind(now)
    .execute(pool)
    .await?;

    require_profile(pool, user_id).await
}

#[instrument(skip(pool))]
pub async fn set_profile_avatar(
    pool: &Pool<Sqlite>,
    user_id: i64,
    avatar_url: &str,
) -> Result<Profile, AppError> {
    info!("Setting profile avatar");

    sqlx::query(
        "INSERT INTO profiles (id, avatar_url, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET avatar_url = excluded.avatar_url, updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(avatar_url)
    .bind(Utc::now().naive_utc())
    .execute(pool)
    .await?;

    require_profile(pool, user_id).await
}

#[instrument(skip(pool))]
pub async fn set_profile_role(
    pool: &Pool<Sqlite>,
    user_id: i64,
    role: Role,
) -> Result<Profile, AppError> {
    info!(role = %role, "Setting profile role");

    sqlx::query(
        "INSERT INTO profiles (id, role, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET role = excluded.role, updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(role.as_str())
    .bind(Utc::now().naive_utc())
    .execute(pool)
    .await?;

    require_profile(pool, user_id).await
}

#[instrument(skip(pool))]
pub async fn set_profile_rank(
    pool: &Pool<Sqlite>,
    user_id: i64,
    belt: Belt,
    degrees: u8,
) -> Result<Profile, AppError> {
    info!(belt = %belt, degrees, "Setting profile rank");

    let result =
        sqlx::query("UPDATE profiles SET belt = ?, degrees = ?, updated_at = ? WHERE id = ?")
            .bind(belt.as_str())
            .bind(degrees.min(MAX_DEGREES) as i64)
            .bind(Utc::now().naive_utc())
            .bind(user_id)
            .execute(pool)
            .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "Profile for user {} not found",
            user_id
        )));
    }

    require_profile(pool, user_id).await
}

async fn require_profile(pool: &Pool<Sqlite>, user_id: i64) -> Result<Profile, AppError> {
    get_profile(pool, user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Profile for user {} not found", user_id)))
}

#[instrument(skip(pool))]
pub async fn get_all_profiles(pool: &Pool<Sqlite>) -> Result<Vec<Profile>, AppError> {
    info!("Getting all profiles");
    let rows = sqlx::query_as::<_, DbProfile>(&format!("{} ORDER BY name", PROFILE_COLUMNS))
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(Profile::from).collect())
}

#[instrument(skip(pool))]
pub async fn get_trainings(pool: &Pool<Sqlite>, user_id: i64) -> Result<Vec<Training>, AppError> {
    info!("Getting trainings");
    let rows = sqlx::query_as::<_, DbTraining>(&format!(
        "{} WHERE user_id = ? ORDER BY date DESC, client_id DESC",
        TRAINING_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Training::from).collect())
}

/// Inserts or replaces each training keyed on its client-side id.
#[instrument(skip(pool, trainings), fields(count = trainings.len()))]
pub async fn upsert_trainings(
    pool: &Pool<Sqlite>,
    user_id: i64,
    trainings: &[Training],
) -> Result<usize, AppError> {
    info!("Upserting trainings");

    let mut tx = pool.begin().await?;
    for training in trainings {
        sqlx::query(
            "INSERT INTO trainings (user_id, client_id, date, duration, technique, notes, academy, type)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, client_id) DO UPDATE SET
                date = excluded.date,
                duration = excluded.duration,
                technique = excluded.technique,
                notes = excluded.notes,
                academy = excluded.academy,
                type = excluded.type",
        )
        .bind(user_id)
        .bind(training.id)
        .bind(&training.date)
        .bind(&training.duration)
        .bind(&training.technique)
        .bind(&training.notes)
        .bind(training.academy.as_deref())
        .bind(training.kind.as_deref())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    Ok(trainings.len())
}

#[instrument(skip(pool))]
pub async fn delete_training(
    pool: &Pool<Sqlite>,
    user_id: i64,
    client_id: i64,
) -> Result<bool, AppError> {
    info!("Deleting training");
    let result = sqlx::query("DELETE FROM trainings WHERE user_id = ? AND client_id = ?")
        .bind(user_id)
        .bind(client_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

#[instrument(skip(pool))]
pub async fn create_academy(
    pool: &Pool<Sqlite>,
    owner_id: i64,
    name: &str,
    join_code: &str,
) -> Result<Academy, AppError> {
    info!("Creating academy");

    if get_academy_by_owner(pool, owner_id).await?.is_some() {
        return Err(AppError::Conflict(
            "You already own an academy".to_string(),
        ));
    }

    let result = sqlx::query("INSERT INTO academies (name, owner_id, join_code) VALUES (?, ?, ?)")
        .bind(name.trim())
        .bind(owner_id)
        .bind(join_code)
        .execute(pool)
        .await?;

    get_academy(pool, result.last_insert_rowid()).await
}

#[instrument(skip(pool))]
pub async fn get_academy(pool: &Pool<Sqlite>, id: i64) -> Result<Academy, AppError> {
    info!("Fetching academy");
    let row = sqlx::query_as::<_, DbAcademy>(&format!("{} WHERE id = ?", ACADEMY_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(academy) => Ok(Academy::from(academy)),
        _ => Err(AppError::NotFound("Academy not found".to_string())),
    }
}

#[instrument(skip(pool))]
pub async fn get_academy_by_owner(
    pool: &Pool<Sqlite>,
    owner_id: i64,
) -> Result<Option<Academy>, AppError> {
    info!("Fetching owned academy");
    let row = sqlx::query_as::<_, DbAcademy>(&format!(
        "{} WHERE owner_id = ? ORDER BY id LIMIT 1",
        ACADEMY_COLUMNS
    ))
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Academy::from))
}

/// Case-insensitive lookup. Codes are not guaranteed unique, so the oldest match wins.
#[instrument(skip(pool))]
pub async fn find_academy_by_code(
    pool: &Pool<Sqlite>,
    code: &str,
) -> Result<Option<Academy>, AppError> {
    info!("Looking up academy by join code");
    let row = sqlx::query_as::<_, DbAcademy>(&format!(
        "{} WHERE UPPER(join_code) = ? ORDER BY id LIMIT 1",
        ACADEMY_COLUMNS
    ))
    .bind(code.trim().to_uppercase())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Academy::from))
}

#[instrument(skip(pool))]
pub async fn get_all_academies(pool: &Pool<Sqlite>) -> Result<Vec<Academy>, AppError> {
    info!("Getting all academies");
    let rows = sqlx::query_as::<_, DbAcademy>(&format!("{} ORDER BY name", ACADEMY_COLUMNS))
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(Academy::from).collect())
}

#[instrument(skip(pool))]
pub async fn join_academy(
    pool: &Pool<Sqlite>,
    academy_id: i64,
    user_id: i64,
) -> Result<AcademyMember, AppError> {
    info!("Requesting academy membership");

    let existing = sqlx::query("SELECT id FROM academy_members WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

    if existing.is_some() {
        return Err(AppError::Conflict(
            "You already belong to an academy".to_string(),
        ));
    }

    let result =
        sqlx::query("INSERT INTO academy_members (academy_id, user_id, status) VALUES (?, ?, ?)")
            .bind(academy_id)
            .bind(user_id)
            .bind(MemberStatus::Pending.as_str())
            .execute(pool)
            .await?;

    get_member(pool, result.last_insert_rowid()).await
}

#[instrument(skip(pool))]
pub async fn get_member(pool: &Pool<Sqlite>, member_id: i64) -> Result<AcademyMember, AppError> {
    let row = sqlx::query_as::<_, DbAcademyMember>(&format!("{} WHERE id = ?", MEMBER_COLUMNS))
        .bind(member_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(member) => Ok(AcademyMember::from(member)),
        _ => Err(AppError::NotFound(format!(
            "Membership {} not found",
            member_id
        ))),
    }
}

#[instrument(skip(pool))]
pub async fn get_memberships_for_user(
    pool: &Pool<Sqlite>,
    user_id: i64,
) -> Result<Vec<MembershipWithAcademy>, AppError> {
    info!("Fetching memberships for user");
    let rows = sqlx::query_as::<_, DbAcademyMember>(&format!(
        "{} WHERE user_id = ? ORDER BY joined_at DESC, id DESC",
        MEMBER_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let mut memberships = Vec::with_capacity(rows.len());
    for row in rows {
        let member = AcademyMember::from(row);
        match get_academy(pool, member.academy_id).await {
            Ok(academy) => memberships.push(MembershipWithAcademy { member, academy }),
            Err(AppError::NotFound(_)) => {
                warn!(member_id = member.id, "Membership points at a missing academy");
            }
            Err(err) => return Err(err),
        }
    }

    Ok(memberships)
}

#[instrument(skip(pool))]
pub async fn get_membership_for_user(
    pool: &Pool<Sqlite>,
    user_id: i64,
) -> Result<Option<MembershipWithAcademy>, AppError> {
    Ok(get_memberships_for_user(pool, user_id)
        .await?
        .into_iter()
        .next())
}

#[instrument(skip(pool))]
pub async fn list_members(
    pool: &Pool<Sqlite>,
    academy_id: i64,
    status: Option<MemberStatus>,
) -> Result<Vec<MemberWithProfile>, AppError> {
    info!("Listing academy members");

    let rows = match status {
        Some(status) => {
            sqlx::query_as::<_, DbAcademyMember>(&format!(
                "{} WHERE academy_id = ? AND status = ? ORDER BY joined_at, id",
                MEMBER_COLUMNS
            ))
            .bind(academy_id)
            .bind(status.as_str())
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, DbAcademyMember>(&format!(
                "{} WHERE academy_id = ? ORDER BY joined_at, id",
                MEMBER_COLUMNS
            ))
            .bind(academy_id)
            .fetch_all(pool)
            .await?
        }
    };

    let profiles = sqlx::query_as::<_, DbProfile>(&format!(
        "{} WHERE id IN (SELECT user_id FROM academy_members WHERE academy_id = ?)",
        PROFILE_COLUMNS
    ))
    .bind(academy_id)
    .fetch_all(pool)
    .await?;

    let mut profiles: HashMap<i64, Profile> = profiles
        .into_iter()
        .map(Profile::from)
        .map(|profile| (profile.id, profile))
        .collect();

    Ok(rows
        .into_iter()
        .map(AcademyMember::from)
        .map(|member| MemberWithProfile {
            profile: profiles.remove(&member.user_id),
            member,
        })
        .collect())
}

#[instrument(skip(pool))]
pub async fn get_all_members(pool: &Pool<Sqlite>) -> Result<Vec<AcademyMember>, AppError> {
    info!("Getting all memberships");
    let rows = sqlx::query_as::<_, DbAcademyMember>(&format!(
        "{} ORDER BY joined_at DESC, id DESC",
        MEMBER_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(AcademyMember::from).collect())
}

#[instrument(skip(pool))]
pub async fn approve_member(
    pool: &Pool<Sqlite>,
    member_id: i64,
) -> Result<AcademyMember, AppError> {
    info!("Approving academy member");
    let result = sqlx::query("UPDATE academy_members SET status = ? WHERE id = ?")
        .bind(MemberStatus::Active.as_str())
        .bind(member_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "Membership {} not found",
            member_id
        )));
    }

    get_member(pool, member_id).await
}

#[instrument(skip(pool))]
pub async fn remove_member(pool: &Pool<Sqlite>, member_id: i64) -> Result<bool, AppError> {
    info!("Removing academy member");
    let result = sqlx::query("DELETE FROM academy_members WHERE id = ?")
        .bind(member_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}
