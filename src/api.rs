use chrono::Utc;
use rocket::data::{ByteUnit, Data};
use rocket::fs::{FileServer, Options};
use rocket::http::{ContentType, Cookie, CookieJar, Status};
use rocket::response::status::Custom;
use rocket::serde::{Deserialize, Serialize, json::Json};
use rocket::{Build, Rocket, State, catchers, delete, get, patch, post, put, routes};
use serde_json::{Value, json};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

use crate::academy::{Rank, generate_join_code, normalize_join_code};
use crate::auth::{
    Permission, Role, SESSION_COOKIE, User, UserSession, forbidden_api, session_token,
    set_session_cookie, unauthorized_api,
};
use crate::coach::{AiSuggestion, GeminiClient, SuggestionProvider, get_training_suggestion};
use crate::config::AppConfig;
use crate::db;
use crate::error::AppError;
use crate::models::{
    Academy, AcademyMember, Belt, MemberStatus, MemberWithProfile, MembershipWithAcademy,
    Profile, ProfilePayload, Training,
};
use crate::stats::{UserStats, user_stats};
use crate::telemetry::TelemetryFairing;
use crate::validation::{
    AppErrorExt, JsonValidateExt, PermissionCheckExt, ValidationResponse, ValidationResult,
};

pub type SharedCoach = Arc<dyn SuggestionProvider>;

#[derive(Deserialize, Validate)]
pub struct SignupRequest {
    #[validate(email(message = "Enter a valid email"))]
    pub email: String,
    #[validate(length(min = 6, message = "Password must be at least 6 characters"))]
    pub password: String,
    #[serde(default)]
    pub provider_avatar_url: Option<String>,
}

#[derive(Deserialize, Validate)]
pub struct SigninRequest {
    #[validate(length(min = 1, message = "Email is required"))]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub user_id: i64,
    pub email: String,
    pub role: Role,
    pub is_admin: bool,
    pub provider_avatar_url: Option<String>,
}

impl From<User> for SessionInfo {
    fn from(user: User) -> Self {
        Self {
            user_id: user.id,
            email: user.email,
            role: user.role,
            is_admin: user.is_admin,
            provider_avatar_url: user.provider_avatar_url,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct CallbackResponse {
    pub redirect: String,
}

#[derive(Serialize, Deserialize, Validate)]
pub struct AvatarUrlRequest {
    #[validate(length(min = 1, max = 2048, message = "Avatar URL is required"))]
    pub avatar_url: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AvatarUploadResponse {
    pub avatar_url: String,
}

#[derive(Serialize, Deserialize)]
pub struct RoleRequest {
    pub role: Role,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TrainingsSaved {
    pub saved: usize,
}

#[derive(Deserialize, Validate)]
pub struct CreateAcademyRequest {
    #[validate(length(min = 1, max = 100, message = "Academy name is required"))]
    pub name: String,
}

#[derive(Deserialize, Validate)]
pub struct JoinAcademyRequest {
    #[validate(length(min = 1, max = 16, message = "Join code is required"))]
    pub code: String,
}

#[derive(Deserialize, Validate)]
pub struct RankRequest {
    pub belt: Belt,
    #[validate(range(max = 4, message = "Degrees must be between 0 and 4"))]
    pub degrees: Option<u8>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum MyAcademyResponse {
    Owner {
        academy: Option<Academy>,
        members: Vec<MemberWithProfile>,
    },
    Student {
        membership: Option<MembershipWithAcademy>,
    },
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AcademyPageResponse {
    pub academy: Academy,
    pub owner: Option<Profile>,
    pub members: Vec<MemberWithProfile>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AdminMembership {
    #[serde(flatten)]
    pub member: AcademyMember,
    pub profile: Option<Profile>,
    pub academy: Option<Academy>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct AdminTotals {
    pub profiles: usize,
    pub academies: usize,
    pub memberships: usize,
    pub pending_memberships: usize,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AdminOverview {
    pub profiles: Vec<Profile>,
    pub academies: Vec<Academy>,
    pub memberships: Vec<AdminMembership>,
    pub totals: AdminTotals,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AdminUserDetails {
    pub profile: Option<Profile>,
    pub trainings: Vec<Training>,
    pub memberships: Vec<MembershipWithAcademy>,
    pub stats: UserStats,
}

async fn open_session(
    db: &Pool<Sqlite>,
    config: &AppConfig,
    cookies: &CookieJar<'_>,
    mut user: User,
) -> Result<SessionInfo, AppError> {
    let token = UserSession::generate_token();
    let expires_at = Utc::now() + chrono::Duration::hours(config.session_hours);

    db::create_user_session(db, user.id, &token, expires_at.naive_utc()).await?;
    set_session_cookie(cookies, token, config.session_hours);

    user.is_admin = config.is_admin(&user.email);
    Ok(SessionInfo::from(user))
}

#[post("/auth/signup", data = "<signup>")]
pub async fn api_signup(
    signup: Json<SignupRequest>,
    cookies: &CookieJar<'_>,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> ValidationResult<Json<SessionInfo>> {
    let validated = signup.validate_custom()?;

    let user = db::create_user(
        db,
        &validated.email,
        &validated.password,
        validated.provider_avatar_url.as_deref(),
    )
    .await
    .validate_custom()?;

    info!(user_id = user.id, "User signed up");
    let session = open_session(db, config, cookies, user).await.validate_custom()?;
    Ok(Json(session))
}

#[post("/auth/signin", data = "<signin>")]
pub async fn api_signin(
    signin: Json<SigninRequest>,
    cookies: &CookieJar<'_>,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> ValidationResult<Json<SessionInfo>> {
    let validated = signin.validate_custom()?;

    match db::authenticate_user(db, &validated.email, &validated.password)
        .await
        .validate_custom()?
    {
        Some(user) => {
            let session = open_session(db, config, cookies, user).await.validate_custom()?;
            Ok(Json(session))
        }
        None => Err(Custom(
            Status::Unauthorized,
            Json(ValidationResponse::with_error(
                "authentication",
                "Invalid email or password",
            )),
        )),
    }
}

#[post("/auth/signout")]
pub async fn api_signout(cookies: &CookieJar<'_>, db: &State<Pool<Sqlite>>) -> Status {
    if let Some(token) = session_token(cookies) {
        if let Err(err) = db::invalidate_session(db, &token).await {
            warn!(error = %err, "Failed to invalidate session on sign-out");
        }
    }

    cookies.remove_private(Cookie::build(SESSION_COOKIE));
    Status::NoContent
}

#[get("/auth/callback")]
pub async fn api_auth_callback(user: Option<User>) -> Json<CallbackResponse> {
    let redirect = if user.is_some() { "/" } else { "/auth" };
    Json(CallbackResponse {
        redirect: redirect.to_string(),
    })
}

#[get("/me")]
pub async fn api_me(user: User) -> Json<SessionInfo> {
    Json(SessionInfo::from(user))
}

#[get("/profile")]
pub async fn api_get_profile(user: User, db: &State<Pool<Sqlite>>) -> Result<Json<Profile>, AppError> {
    user.require_permission(Permission::ViewOwnProfile)?;

    db::get_profile(db, user.id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Profile not found".to_string()))
}

#[put("/profile", data = "<profile>")]
pub async fn api_put_profile(
    profile: Json<ProfilePayload>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ValidationResult<Json<Profile>> {
    user.check_permission(Permission::EditOwnProfile)?;
    let validated = profile.validate_custom()?;

    let saved = db::upsert_profile(db, user.id, &validated)
        .await
        .validate_custom()?;
    Ok(Json(saved))
}

#[patch("/profile/avatar", data = "<avatar>")]
pub async fn api_set_avatar_url(
    avatar: Json<AvatarUrlRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ValidationResult<Json<Profile>> {
    user.check_permission(Permission::EditOwnProfile)?;
    let validated = avatar.validate_custom()?;

    let saved = db::set_profile_avatar(db, user.id, validated.avatar_url.trim())
        .await
        .validate_custom()?;
    Ok(Json(saved))
}

#[put("/profile/role", data = "<role>")]
pub async fn api_set_role(
    role: Json<RoleRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ValidationResult<Json<Profile>> {
    user.check_permission(Permission::EditOwnProfile)?;

    let saved = db::set_profile_role(db, user.id, role.role)
        .await
        .validate_custom()?;
    Ok(Json(saved))
}

fn avatar_extension(content_type: &ContentType) -> Option<&'static str> {
    if content_type.top() != "image" {
        return None;
    }
    let sub = content_type.sub().as_str().to_lowercase();
    Some(match sub.as_str() {
        "png" => "png",
        "jpeg" | "jpg" => "jpg",
        "gif" => "gif",
        "webp" => "webp",
        _ => "img",
    })
}

#[post("/profile/avatar", data = "<data>")]
pub async fn api_upload_avatar(
    data: Data<'_>,
    content_type: &ContentType,
    user: User,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> ValidationResult<Json<AvatarUploadResponse>> {
    user.check_permission(Permission::EditOwnProfile)?;

    let Some(extension) = avatar_extension(content_type) else {
        return Err(Custom(
            Status::UnsupportedMediaType,
            Json(ValidationResponse::with_error(
                "avatar",
                "Avatar must be an image",
            )),
        ));
    };

    let bytes = data
        .open(ByteUnit::from(config.avatar_max_bytes))
        .into_bytes()
        .await
        .map_err(AppError::from)
        .validate_custom()?;

    if !bytes.is_complete() {
        return Err(Custom(
            Status::PayloadTooLarge,
            Json(ValidationResponse::with_error(
                "avatar",
                &format!(
                    "Avatar must be at most {} MB",
                    config.avatar_max_bytes / (1024 * 1024)
                ),
            )),
        ));
    }

    let file_name = format!("{}-{}.{}", user.id, uuid::Uuid::new_v4(), extension);
    tokio::fs::create_dir_all(&config.avatar_dir)
        .await
        .map_err(AppError::from)
        .validate_custom()?;
    tokio::fs::write(config.avatar_dir.join(&file_name), bytes.into_inner())
        .await
        .map_err(AppError::from)
        .validate_custom()?;

    let avatar_url = config.avatar_public_url(&file_name);
    db::set_profile_avatar(db, user.id, &avatar_url)
        .await
        .validate_custom()?;

    info!(user_id = user.id, file = %file_name, "Avatar uploaded");
    Ok(Json(AvatarUploadResponse { avatar_url }))
}

#[get("/trainings")]
pub async fn api_get_trainings(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<Training>>, AppError> {
    user.require_permission(Permission::LogTrainings)?;
    Ok(Json(db::get_trainings(db, user.id).await?))
}

fn check_trainings(trainings: &[Training]) -> ValidationResult<()> {
    for training in trainings {
        if training.day().is_none() {
            return Err(Custom(
                Status::UnprocessableEntity,
                Json(ValidationResponse::with_error(
                    "date",
                    &format!("Training {} has an invalid date", training.id),
                )),
            ));
        }
    }
    Ok(())
}

#[put("/trainings", data = "<trainings>")]
pub async fn api_put_trainings(
    trainings: Json<Vec<Training>>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ValidationResult<Json<TrainingsSaved>> {
    user.check_permission(Permission::LogTrainings)?;
    let trainings = trainings.into_inner();
    check_trainings(&trainings)?;

    let saved = db::upsert_trainings(db, user.id, &trainings)
        .await
        .validate_custom()?;
    Ok(Json(TrainingsSaved { saved }))
}

#[delete("/trainings/<client_id>")]
pub async fn api_delete_training(
    client_id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, AppError> {
    user.require_permission(Permission::LogTrainings)?;

    if db::delete_training(db, user.id, client_id).await? {
        Ok(Status::NoContent)
    } else {
        Err(AppError::NotFound("Training not found".to_string()))
    }
}

#[post("/academies", data = "<academy>")]
pub async fn api_create_academy(
    academy: Json<CreateAcademyRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ValidationResult<Custom<Json<Academy>>> {
    user.check_permission(Permission::CreateAcademy)?;
    let validated = academy.validate_custom()?;

    let created = db::create_academy(db, user.id, &validated.name, &generate_join_code())
        .await
        .validate_custom()?;

    info!(academy_id = created.id, code = %created.join_code, "Academy created");
    Ok(Custom(Status::Created, Json(created)))
}

#[get("/academies/mine")]
pub async fn api_my_academy(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<MyAcademyResponse>, AppError> {
    if user.role.runs_academy() {
        let academy = db::get_academy_by_owner(db, user.id).await?;
        let members = match &academy {
            Some(academy) => db::list_members(db, academy.id, None).await?,
            None => Vec::new(),
        };
        Ok(Json(MyAcademyResponse::Owner { academy, members }))
    } else {
        let membership = db::get_membership_for_user(db, user.id).await?;
        Ok(Json(MyAcademyResponse::Student { membership }))
    }
}

#[get("/academies/<id>", rank = 2)]
pub async fn api_get_academy(
    id: i64,
    _user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<AcademyPageResponse>, AppError> {
    let academy = db::get_academy(db, id).await?;
    let owner = db::get_profile(db, academy.owner_id).await?;
    let members = db::list_members(db, academy.id, Some(MemberStatus::Active)).await?;

    Ok(Json(AcademyPageResponse {
        academy,
        owner,
        members,
    }))
}

#[post("/academies/join", data = "<join>")]
pub async fn api_join_academy(
    join: Json<JoinAcademyRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ValidationResult<Custom<Json<AcademyMember>>> {
    user.check_permission(Permission::JoinAcademy)?;
    let validated = join.validate_custom()?;

    let code = normalize_join_code(&validated.code);
    let Some(academy) = db::find_academy_by_code(db, &code).await.validate_custom()? else {
        return Err(Custom(
            Status::NotFound,
            Json(ValidationResponse::with_error("code", "Academy not found")),
        ));
    };

    let member = db::join_academy(db, academy.id, user.id)
        .await
        .validate_custom()?;

    info!(academy_id = academy.id, "Membership requested");
    Ok(Custom(Status::Created, Json(member)))
}

/// The academy that `member_id` belongs to, provided `user` owns it.
async fn owned_membership(
    db: &Pool<Sqlite>,
    user: &User,
    member_id: i64,
    permission: Permission,
) -> Result<AcademyMember, AppError> {
    user.require_permission(permission)?;
    let member = db::get_member(db, member_id).await?;
    require_owner(db, user, member.academy_id).await?;
    Ok(member)
}

async fn require_owner(db: &Pool<Sqlite>, user: &User, academy_id: i64) -> Result<Academy, AppError> {
    let academy = db::get_academy(db, academy_id).await?;
    if academy.owner_id != user.id {
        warn!(academy_id, user_id = user.id, "Non-owner tried to manage academy");
        return Err(AppError::Authorization(
            "Only the academy owner can manage members".to_string(),
        ));
    }
    Ok(academy)
}

#[get("/academies/<id>/members?<status>")]
pub async fn api_list_members(
    id: i64,
    status: Option<&str>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<MemberWithProfile>>, AppError> {
    user.require_permission(Permission::ManageMembers)?;
    require_owner(db, &user, id).await?;

    let status = status.map(str::parse::<MemberStatus>).transpose()?;
    Ok(Json(db::list_members(db, id, status).await?))
}

#[post("/academies/members/<id>/approve")]
pub async fn api_approve_member(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<AcademyMember>, AppError> {
    owned_membership(db, &user, id, Permission::ManageMembers).await?;
    let member = db::approve_member(db, id).await?;
    info!(member_id = id, "Membership approved");
    Ok(Json(member))
}

#[delete("/academies/members/<id>")]
pub async fn api_reject_member(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, AppError> {
    owned_membership(db, &user, id, Permission::ManageMembers).await?;
    db::remove_member(db, id).await?;
    info!(member_id = id, "Membership removed");
    Ok(Status::NoContent)
}

#[put("/academies/members/<id>/rank", data = "<rank>")]
pub async fn api_update_rank(
    id: i64,
    rank: Json<RankRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ValidationResult<Json<Profile>> {
    let validated = rank.validate_custom()?;
    let member = owned_membership(db, &user, id, Permission::PromoteMembers)
        .await
        .validate_custom()?;

    if member.status != MemberStatus::Active {
        return Err(Custom(
            Status::Conflict,
            Json(ValidationResponse::with_error(
                "member",
                "Only active members can be promoted",
            )),
        ));
    }

    let profile = db::get_profile(db, member.user_id)
        .await
        .validate_custom()?
        .ok_or_else(|| AppError::NotFound("Member profile not found".to_string()))
        .validate_custom()?;

    let next = Rank {
        belt: profile.belt,
        degrees: profile.degrees,
    }
    .promote(validated.belt, validated.degrees)
    .validate_custom()?;

    let updated = db::set_profile_rank(db, member.user_id, next.belt, next.degrees)
        .await
        .validate_custom()?;

    info!(member_id = id, belt = %next.belt, degrees = next.degrees, "Member promoted");
    Ok(Json(updated))
}

#[post("/coach/suggestion")]
pub async fn api_coach_suggestion(
    user: User,
    db: &State<Pool<Sqlite>>,
    coach: &State<SharedCoach>,
) -> Result<Json<AiSuggestion>, Custom<Json<Value>>> {
    let app_error = |err: AppError| {
        let status = err.to_status_with_log("coach suggestion");
        Custom(
            status,
            Json(json!({ "error": err.kind(), "message": err.public_message() })),
        )
    };

    user.require_permission(Permission::RequestSuggestions)
        .map_err(app_error)?;

    let trainings = db::get_trainings(db, user.id).await.map_err(app_error)?;
    let profile = db::get_profile(db, user.id).await.map_err(app_error)?;

    let (belt, academy, language) = match &profile {
        Some(p) => (
            p.belt.as_str().to_string(),
            p.main_academy.clone().unwrap_or_default(),
            p.language.clone(),
        ),
        None => (Belt::default().as_str().to_string(), String::new(), "pt".to_string()),
    };

    match get_training_suggestion(coach.inner().as_ref(), &trainings, &belt, &academy).await {
        Ok(suggestion) => Ok(Json(suggestion)),
        Err(err) => {
            let status = AppError::from(err.clone()).to_status_with_log("coach suggestion");
            Err(Custom(
                status,
                Json(json!({
                    "error": err.kind(),
                    "message": err.user_message(&language),
                })),
            ))
        }
    }
}

fn matches_query(query: &str, fields: &[&str]) -> bool {
    query.is_empty() || fields.iter().any(|f| f.to_lowercase().contains(query))
}

#[get("/admin/overview?<q>")]
pub async fn api_admin_overview(
    q: Option<&str>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<AdminOverview>, AppError> {
    user.require_admin()?;
    let query = q.unwrap_or_default().trim().to_lowercase();

    let profiles = db::get_all_profiles(db).await?;
    let academies = db::get_all_academies(db).await?;
    let members = db::get_all_members(db).await?;

    let totals = AdminTotals {
        profiles: profiles.len(),
        academies: academies.len(),
        memberships: members.len(),
        pending_memberships: members
            .iter()
            .filter(|m| m.status == MemberStatus::Pending)
            .count(),
    };

    let memberships = members
        .into_iter()
        .map(|member| AdminMembership {
            profile: profiles.iter().find(|p| p.id == member.user_id).cloned(),
            academy: academies.iter().find(|a| a.id == member.academy_id).cloned(),
            member,
        })
        .filter(|m| {
            matches_query(
                &query,
                &[
                    m.profile.as_ref().map(|p| p.name.as_str()).unwrap_or_default(),
                    m.academy.as_ref().map(|a| a.name.as_str()).unwrap_or_default(),
                ],
            )
        })
        .collect();

    let profiles = profiles
        .into_iter()
        .filter(|p| matches_query(&query, &[p.name.as_str(), p.id.to_string().as_str()]))
        .collect();

    let academies = academies
        .into_iter()
        .filter(|a| matches_query(&query, &[a.name.as_str(), a.join_code.as_str()]))
        .collect();

    Ok(Json(AdminOverview {
        profiles,
        academies,
        memberships,
        totals,
    }))
}

#[get("/admin/users/<id>")]
pub async fn api_admin_user(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<AdminUserDetails>, AppError> {
    user.require_admin()?;

    let profile = db::get_profile(db, id).await?;
    let trainings = db::get_trainings(db, id).await?;
    let memberships = db::get_memberships_for_user(db, id).await?;
    let stats = user_stats(&trainings);

    Ok(Json(AdminUserDetails {
        profile,
        trainings,
        memberships,
        stats,
    }))
}

#[get("/health")]
pub fn health() -> &'static str {
    "OK"
}

pub fn init_rocket(pool: Pool<Sqlite>, config: AppConfig) -> Rocket<Build> {
    let coach: SharedCoach = Arc::new(GeminiClient::from_config(&config));
    init_rocket_with_coach(pool, config, coach)
}

pub fn init_rocket_with_coach(
    pool: Pool<Sqlite>,
    config: AppConfig,
    coach: SharedCoach,
) -> Rocket<Build> {
    info!("Starting bjj journal backend");

    if let Err(err) = std::fs::create_dir_all(&config.avatar_dir) {
        warn!(dir = ?config.avatar_dir, error = %err, "Could not create avatar directory");
    }
    let avatars = FileServer::new(&config.avatar_dir, Options::Missing);

    rocket::build()
        .manage(pool)
        .manage(config)
        .manage(coach)
        .mount(
            "/api",
            routes![
                api_signup,
                api_signin,
                api_signout,
                api_auth_callback,
                api_me,
                api_get_profile,
                api_put_profile,
                api_set_avatar_url,
                api_set_role,
                api_upload_avatar,
                api_get_trainings,
                api_put_trainings,
                api_delete_training,
                api_create_academy,
                api_my_academy,
                api_get_academy,
                api_join_academy,
                api_list_members,
                api_approve_member,
                api_reject_member,
                api_update_rank,
                api_coach_suggestion,
                api_admin_overview,
                api_admin_user,
                health,
            ],
        )
        .mount("/avatars", avatars)
        .register("/api", catchers![unauthorized_api, forbidden_api])
        .attach(TelemetryFairing)
}
