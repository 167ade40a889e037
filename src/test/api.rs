#[cfg(test)]
mod tests {
    use crate::api::{
        AcademyPageResponse, AdminOverview, AdminUserDetails, AvatarUploadResponse,
        MyAcademyResponse, SessionInfo, TrainingsSaved,
    };
    use crate::auth::Role;
    use crate::coach::{AiSuggestion, SuggestionError};
    use crate::models::{
        Academy, AcademyMember, Belt, MemberStatus, MemberWithProfile, Profile, Training,
    };
    use crate::test::test_db::TestDbBuilder;
    use crate::test::test_utils::{
        ADMIN_EMAIL, FakeCoach, create_standard_test_db, setup_test_client,
        setup_test_client_with_coach, sign_in,
    };
    use crate::validation::ValidationResponse;
    use rocket::http::{ContentType, Cookie, Status};
    use rocket::local::asynchronous::LocalResponse;
    use serde::de::DeserializeOwned;
    use serde_json::{Value, json};
    use std::sync::Arc;

    async fn body<T: DeserializeOwned>(response: LocalResponse<'_>) -> T {
        let body = response.into_string().await.unwrap();
        serde_json::from_str(&body).unwrap_or_else(|e| panic!("Bad body {}: {}", body, e))
    }

    fn training(id: i64, date: &str, technique: &str) -> Value {
        json!({
            "id": id,
            "date": date,
            "duration": "60",
            "technique": technique,
            "notes": "",
            "type": "nogi"
        })
    }

    #[rocket::async_test]
    async fn test_signup_opens_a_session() {
        let app = setup_test_client(TestDbBuilder::new().build().await.unwrap()).await;

        let response = app
            .client
            .post("/api/auth/signup")
            .header(ContentType::JSON)
            .body(json!({ "email": "New@Example.com", "password": "secret1" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let session: SessionInfo = body(response).await;
        assert_eq!(session.email, "new@example.com");
        assert_eq!(session.role, Role::Student);
        assert!(!session.is_admin);

        let response = app.client.get("/api/me").dispatch().await;
        assert_eq!(response.status(), Status::Ok);

        let response = app
            .client
            .post("/api/auth/signup")
            .header(ContentType::JSON)
            .body(json!({ "email": "new@example.com", "password": "secret1" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Conflict);
    }

    #[rocket::async_test]
    async fn test_signup_validates_input() {
        let app = setup_test_client(TestDbBuilder::new().build().await.unwrap()).await;

        let response = app
            .client
            .post("/api/auth/signup")
            .header(ContentType::JSON)
            .body(json!({ "email": "not-an-email", "password": "123" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);

        let errors: ValidationResponse = body(response).await;
        assert!(errors.errors.contains_key("email"));
        assert!(errors.errors.contains_key("password"));
    }

    #[rocket::async_test]
    async fn test_signin_rejects_bad_credentials() {
        let app = setup_test_client(create_standard_test_db().await).await;

        let response = app
            .client
            .post("/api/auth/signin")
            .header(ContentType::JSON)
            .body(json!({ "email": "free@example.com", "password": "wrong" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);

        let errors: ValidationResponse = body(response).await;
        assert_eq!(errors.first_message(), Some("Invalid email or password"));
    }

    #[rocket::async_test]
    async fn test_auth_required_apis() {
        let app = setup_test_client(create_standard_test_db().await).await;

        for endpoint in [
            "/api/me",
            "/api/profile",
            "/api/trainings",
            "/api/academies/mine",
            "/api/admin/overview",
        ] {
            let response = app.client.get(endpoint).dispatch().await;
            assert_eq!(
                response.status(),
                Status::Unauthorized,
                "Endpoint {} did not require authentication",
                endpoint
            );
        }
    }

    #[rocket::async_test]
    async fn test_forged_session_is_rejected() {
        let app = setup_test_client(create_standard_test_db().await).await;

        let response = app
            .client
            .get("/api/me")
            .private_cookie(Cookie::build(("session_token", "fake_token")).build())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);
    }

    #[rocket::async_test]
    async fn test_callback_redirects_by_session() {
        let app = setup_test_client(create_standard_test_db().await).await;

        let response = app.client.get("/api/auth/callback").dispatch().await;
        let redirect: Value = body(response).await;
        assert_eq!(redirect["redirect"], "/auth");

        sign_in(&app.client, "free@example.com").await;
        let response = app.client.get("/api/auth/callback").dispatch().await;
        let redirect: Value = body(response).await;
        assert_eq!(redirect["redirect"], "/");
    }

    #[rocket::async_test]
    async fn test_profile_round_trip() {
        let test_db = TestDbBuilder::new()
            .account_only("fresh@example.com")
            .build()
            .await
            .unwrap();
        let app = setup_test_client(test_db).await;
        sign_in(&app.client, "fresh@example.com").await;

        let response = app.client.get("/api/profile").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);

        let response = app
            .client
            .put("/api/profile")
            .header(ContentType::JSON)
            .body(
                json!({
                    "name": "Fresh",
                    "belt": "blue",
                    "degrees": 2,
                    "academies": ["Alliance", "Checkmat"],
                    "main_academy": "Alliance",
                    "language": "en"
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let response = app.client.get("/api/profile").dispatch().await;
        let profile: Profile = body(response).await;
        assert_eq!(profile.name, "Fresh");
        assert_eq!(profile.belt, Belt::Blue);
        assert_eq!(profile.degrees, 2);
        assert_eq!(profile.academies, vec!["Alliance", "Checkmat"]);
        assert_eq!(profile.role, Role::Student);
    }

    #[rocket::async_test]
    async fn test_profile_rejects_too_many_degrees() {
        let app = setup_test_client(create_standard_test_db().await).await;
        sign_in(&app.client, "free@example.com").await;

        let response = app
            .client
            .put("/api/profile")
            .header(ContentType::JSON)
            .body(
                json!({ "name": "Free", "belt": "white", "degrees": 5, "language": "pt" })
                    .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);
    }

    #[rocket::async_test]
    async fn test_role_and_avatar_url_updates() {
        let app = setup_test_client(create_standard_test_db().await).await;
        sign_in(&app.client, "free@example.com").await;

        let response = app
            .client
            .put("/api/profile/role")
            .header(ContentType::JSON)
            .body(json!({ "role": "professor" }).to_string())
            .dispatch()
            .await;
        let profile: Profile = body(response).await;
        assert_eq!(profile.role, Role::Professor);

        let response = app
            .client
            .patch("/api/profile/avatar")
            .header(ContentType::JSON)
            .body(json!({ "avatar_url": "https://cdn.example.com/me.png" }).to_string())
            .dispatch()
            .await;
        let profile: Profile = body(response).await;
        assert_eq!(
            profile.avatar_url.as_deref(),
            Some("https://cdn.example.com/me.png")
        );

        let session: SessionInfo = body(app.client.get("/api/me").dispatch().await).await;
        assert_eq!(session.role, Role::Professor);
    }

    #[rocket::async_test]
    async fn test_avatar_upload() {
        let app = setup_test_client(create_standard_test_db().await).await;
        sign_in(&app.client, "free@example.com").await;

        let response = app
            .client
            .post("/api/profile/avatar")
            .header(ContentType::PNG)
            .body(vec![0x89, b'P', b'N', b'G', 0, 1, 2, 3])
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let uploaded: AvatarUploadResponse = body(response).await;
        assert!(uploaded.avatar_url.starts_with("http://localhost:8000/avatars/"));
        assert!(uploaded.avatar_url.ends_with(".png"));

        let file_name = uploaded.avatar_url.rsplit('/').next().unwrap();
        assert!(app.avatars.path().join(file_name).exists());

        let profile: Profile = body(app.client.get("/api/profile").dispatch().await).await;
        assert_eq!(profile.avatar_url, Some(uploaded.avatar_url));

        let response = app
            .client
            .post("/api/profile/avatar")
            .header(ContentType::Plain)
            .body("not an image")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnsupportedMediaType);

        let response = app
            .client
            .post("/api/profile/avatar")
            .header(ContentType::JPEG)
            .body(vec![0u8; 4096])
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::PayloadTooLarge);
    }

    #[rocket::async_test]
    async fn test_trainings_newest_first() {
        let app = setup_test_client(create_standard_test_db().await).await;
        sign_in(&app.client, "free@example.com").await;

        let trainings: Vec<Training> =
            body(app.client.get("/api/trainings").dispatch().await).await;
        assert_eq!(trainings.len(), 2);
        assert_eq!(trainings[0].technique, "Kimura");
        assert_eq!(trainings[1].technique, "Armbar");
    }

    #[rocket::async_test]
    async fn test_training_push_is_idempotent() {
        let app = setup_test_client(create_standard_test_db().await).await;
        sign_in(&app.client, "active@example.com").await;

        let batch = json!([
            training(100, "2024-06-01", "Triangle"),
            training(101, "2024-06-02", "Omoplata")
        ])
        .to_string();

        for _ in 0..2 {
            let response = app
                .client
                .put("/api/trainings")
                .header(ContentType::JSON)
                .body(batch.clone())
                .dispatch()
                .await;
            let saved: TrainingsSaved = body(response).await;
            assert_eq!(saved.saved, 2);
        }

        let trainings: Vec<Training> =
            body(app.client.get("/api/trainings").dispatch().await).await;
        assert_eq!(trainings.len(), 2);
        assert_eq!(trainings[0].id, 101);
        assert_eq!(trainings[0].kind.as_deref(), Some("nogi"));
    }

    #[rocket::async_test]
    async fn test_training_push_rejects_bad_dates() {
        let app = setup_test_client(create_standard_test_db().await).await;
        sign_in(&app.client, "active@example.com").await;

        let response = app
            .client
            .put("/api/trainings")
            .header(ContentType::JSON)
            .body(json!([training(7, "yesterday", "Armbar")]).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);
    }

    #[rocket::async_test]
    async fn test_delete_training() {
        let app = setup_test_client(create_standard_test_db().await).await;
        sign_in(&app.client, "free@example.com").await;

        let response = app.client.delete("/api/trainings/1714550400000").dispatch().await;
        assert_eq!(response.status(), Status::NoContent);

        let response = app.client.delete("/api/trainings/1714550400000").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);

        sign_in(&app.client, "active@example.com").await;
        let response = app.client.delete("/api/trainings/1714636800000").dispatch().await;
        assert_eq!(
            response.status(),
            Status::NotFound,
            "Trainings of other users must not be deletable"
        );
    }

    #[rocket::async_test]
    async fn test_create_academy() {
        let test_db = TestDbBuilder::new()
            .professor("prof@example.com")
            .student("student@example.com")
            .build()
            .await
            .unwrap();
        let app = setup_test_client(test_db).await;

        sign_in(&app.client, "student@example.com").await;
        let response = app
            .client
            .post("/api/academies")
            .header(ContentType::JSON)
            .body(json!({ "name": "Nope" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        sign_in(&app.client, "prof@example.com").await;
        let response = app
            .client
            .post("/api/academies")
            .header(ContentType::JSON)
            .body(json!({ "name": "Atos" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        let academy: Academy = body(response).await;
        assert_eq!(academy.name, "Atos");
        assert_eq!(academy.join_code.len(), 6);
        assert!(
            academy
                .join_code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        );

        let response = app
            .client
            .post("/api/academies")
            .header(ContentType::JSON)
            .body(json!({ "name": "Atos 2" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Conflict);
    }

    #[rocket::async_test]
    async fn test_join_academy_by_code() {
        let app = setup_test_client(create_standard_test_db().await).await;
        sign_in(&app.client, "free@example.com").await;

        let response = app
            .client
            .post("/api/academies/join")
            .header(ContentType::JSON)
            .body(json!({ "code": "ZZZZZZ" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::NotFound);
        let errors: ValidationResponse = body(response).await;
        assert_eq!(errors.first_message(), Some("Academy not found"));

        let response = app
            .client
            .post("/api/academies/join")
            .header(ContentType::JSON)
            .body(json!({ "code": " gb1234 " }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        let member: AcademyMember = body(response).await;
        assert_eq!(member.status, MemberStatus::Pending);
        assert_eq!(member.academy_id, app.db.academy_id("Gracie Barra").unwrap());

        let response = app
            .client
            .post("/api/academies/join")
            .header(ContentType::JSON)
            .body(json!({ "code": "GB1234" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Conflict);

        let mine: MyAcademyResponse =
            body(app.client.get("/api/academies/mine").dispatch().await).await;
        match mine {
            MyAcademyResponse::Student { membership } => {
                let membership = membership.expect("Membership missing");
                assert_eq!(membership.academy.name, "Gracie Barra");
                assert_eq!(membership.member.status, MemberStatus::Pending);
            }
            other => panic!("Expected student view, got {:?}", other),
        }
    }

    #[rocket::async_test]
    async fn test_owner_manages_members() {
        let app = setup_test_client(create_standard_test_db().await).await;
        let academy_id = app.db.academy_id("Gracie Barra").unwrap();
        let pending_id = app.db.member_id("pending@example.com").unwrap();
        sign_in(&app.client, "owner@example.com").await;

        let pending: Vec<MemberWithProfile> = body(
            app.client
                .get(format!("/api/academies/{}/members?status=pending", academy_id))
                .dispatch()
                .await,
        )
        .await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].profile.as_ref().unwrap().name, "pending");

        let response = app
            .client
            .post(format!("/api/academies/members/{}/approve", pending_id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let approved: AcademyMember = body(response).await;
        assert_eq!(approved.status, MemberStatus::Active);

        let mine: MyAcademyResponse =
            body(app.client.get("/api/academies/mine").dispatch().await).await;
        match mine {
            MyAcademyResponse::Owner { academy, members } => {
                assert_eq!(academy.unwrap().join_code, "GB1234");
                assert_eq!(members.len(), 2);
                assert!(members.iter().all(|m| m.member.status == MemberStatus::Active));
            }
            other => panic!("Expected owner view, got {:?}", other),
        }

        let response = app
            .client
            .delete(format!("/api/academies/members/{}", pending_id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::NoContent);

        let all: Vec<MemberWithProfile> = body(
            app.client
                .get(format!("/api/academies/{}/members", academy_id))
                .dispatch()
                .await,
        )
        .await;
        assert_eq!(all.len(), 1);
    }

    #[rocket::async_test]
    async fn test_only_owner_manages_members() {
        let test_db = TestDbBuilder::new()
            .owner("owner@example.com")
            .owner("rival@example.com")
            .student("pending@example.com")
            .academy("owner@example.com", "Gracie Barra", "GB1234")
            .academy("rival@example.com", "Rival", "RV0001")
            .member("Gracie Barra", "pending@example.com", MemberStatus::Pending)
            .build()
            .await
            .unwrap();
        let app = setup_test_client(test_db).await;
        let member_id = app.db.member_id("pending@example.com").unwrap();

        sign_in(&app.client, "rival@example.com").await;
        let response = app
            .client
            .post(format!("/api/academies/members/{}/approve", member_id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        sign_in(&app.client, "pending@example.com").await;
        let response = app
            .client
            .delete(format!("/api/academies/members/{}", member_id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);
    }

    #[rocket::async_test]
    async fn test_rank_updates() {
        let app = setup_test_client(create_standard_test_db().await).await;
        let active_id = app.db.member_id("active@example.com").unwrap();
        let pending_id = app.db.member_id("pending@example.com").unwrap();
        sign_in(&app.client, "owner@example.com").await;

        let rank = |belt: &str, degrees: Option<u8>| {
            json!({ "belt": belt, "degrees": degrees }).to_string()
        };

        let response = app
            .client
            .put(format!("/api/academies/members/{}/rank", active_id))
            .header(ContentType::JSON)
            .body(rank("white", Some(3)))
            .dispatch()
            .await;
        let profile: Profile = body(response).await;
        assert_eq!((profile.belt, profile.degrees), (Belt::White, 3));

        let response = app
            .client
            .put(format!("/api/academies/members/{}/rank", active_id))
            .header(ContentType::JSON)
            .body(rank("blue", Some(2)))
            .dispatch()
            .await;
        let profile: Profile = body(response).await;
        assert_eq!(
            (profile.belt, profile.degrees),
            (Belt::Blue, 0),
            "A new belt starts without degrees"
        );

        let response = app
            .client
            .put(format!("/api/academies/members/{}/rank", active_id))
            .header(ContentType::JSON)
            .body(rank("blue", Some(5)))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);

        let response = app
            .client
            .put(format!("/api/academies/members/{}/rank", pending_id))
            .header(ContentType::JSON)
            .body(rank("blue", None))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Conflict);
    }

    #[rocket::async_test]
    async fn test_academy_page_lists_active_members() {
        let app = setup_test_client(create_standard_test_db().await).await;
        let academy_id = app.db.academy_id("Gracie Barra").unwrap();
        sign_in(&app.client, "active@example.com").await;

        let page: AcademyPageResponse = body(
            app.client
                .get(format!("/api/academies/{}", academy_id))
                .dispatch()
                .await,
        )
        .await;
        assert_eq!(page.academy.name, "Gracie Barra");
        assert_eq!(page.owner.unwrap().name, "owner");
        assert_eq!(page.members.len(), 1);

        let response = app.client.get("/api/academies/9999").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
    }

    #[rocket::async_test]
    async fn test_admin_requires_admin_email() {
        let app = setup_test_client(create_standard_test_db().await).await;
        sign_in(&app.client, "owner@example.com").await;

        let response = app.client.get("/api/admin/overview").dispatch().await;
        assert_eq!(response.status(), Status::Forbidden);

        let session: SessionInfo = body(app.client.get("/api/me").dispatch().await).await;
        assert!(!session.is_admin);
    }

    #[rocket::async_test]
    async fn test_admin_overview_and_search() {
        let app = setup_test_client(create_standard_test_db().await).await;
        sign_in(&app.client, ADMIN_EMAIL).await;

        let overview: AdminOverview =
            body(app.client.get("/api/admin/overview").dispatch().await).await;
        assert_eq!(overview.totals.profiles, 5);
        assert_eq!(overview.totals.academies, 1);
        assert_eq!(overview.totals.memberships, 2);
        assert_eq!(overview.totals.pending_memberships, 1);

        let filtered: AdminOverview =
            body(app.client.get("/api/admin/overview?q=GRACIE").dispatch().await).await;
        assert_eq!(filtered.academies.len(), 1);
        assert_eq!(filtered.memberships.len(), 2);
        assert!(filtered.profiles.is_empty());
        assert_eq!(filtered.totals, overview.totals);
    }

    #[rocket::async_test]
    async fn test_admin_user_details() {
        let app = setup_test_client(create_standard_test_db().await).await;
        let user_id = app.db.user_id("free@example.com").unwrap();
        sign_in(&app.client, ADMIN_EMAIL).await;

        let details: AdminUserDetails = body(
            app.client
                .get(format!("/api/admin/users/{}", user_id))
                .dispatch()
                .await,
        )
        .await;
        assert_eq!(details.profile.unwrap().name, "free");
        assert_eq!(details.trainings.len(), 2);
        assert!(details.memberships.is_empty());
        assert_eq!(details.stats.total_trainings, 2);
        assert!((details.stats.total_hours - 2.5).abs() < f64::EPSILON);
        assert!((details.stats.average_hours - 1.25).abs() < f64::EPSILON);
    }

    #[rocket::async_test]
    async fn test_coach_suggestion() {
        let app = setup_test_client(create_standard_test_db().await).await;
        sign_in(&app.client, "free@example.com").await;

        let response = app.client.post("/api/coach/suggestion").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let suggestion: AiSuggestion = body(response).await;
        assert_eq!(suggestion.focus, "Guard retention");
        assert_eq!(suggestion.suggested_techniques, vec!["Hip escape", "Frames"]);
    }

    #[rocket::async_test]
    async fn test_coach_failure_is_localized() {
        let coach = Arc::new(FakeCoach(Err(SuggestionError::RateLimited(
            "quota exceeded".to_string(),
        ))));
        let app = setup_test_client_with_coach(create_standard_test_db().await, coach).await;
        sign_in(&app.client, "free@example.com").await;

        let response = app.client.post("/api/coach/suggestion").dispatch().await;
        assert_eq!(response.status(), Status::TooManyRequests);
        let error: Value = body(response).await;
        assert_eq!(error["error"], "rate_limited");
        assert_eq!(
            error["message"],
            "Cota da API Gemini excedida. Tente novamente mais tarde."
        );
    }

    #[rocket::async_test]
    async fn test_health() {
        let app = setup_test_client(TestDbBuilder::new().build().await.unwrap()).await;
        let response = app.client.get("/api/health").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.into_string().await.unwrap(), "OK");
    }
}
