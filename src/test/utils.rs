#[cfg(test)]
pub mod test_db {
    use crate::auth::Role;
    use crate::database::{CURRENT_SCHEMA, migrate_database_declaratively};
    use crate::db::{
        approve_member, create_academy, create_user, join_academy, upsert_profile,
        upsert_trainings,
    };
    use crate::error::AppError;
    use crate::models::{Belt, MemberStatus, ProfilePayload, Training};
    use sqlx::{Pool, Sqlite, SqlitePool};
    use std::collections::HashMap;
    use std::sync::Once;

    static INIT: Once = Once::new();
    pub static STANDARD_PASSWORD: &str = "password123";

    #[derive(Default)]
    pub struct TestDbBuilder {
        users: Vec<TestUser>,
        academies: Vec<TestAcademy>,
        members: Vec<TestMember>,
        trainings: Vec<TestTraining>,
    }

    pub struct TestUser {
        pub email: String,
        pub role: Option<Role>,
        pub belt: Belt,
        pub password: String,
    }

    pub struct TestAcademy {
        pub owner_email: String,
        pub name: String,
        pub join_code: String,
    }

    pub struct TestMember {
        pub academy_name: String,
        pub email: String,
        pub status: MemberStatus,
    }

    pub struct TestTraining {
        pub email: String,
        pub training: Training,
    }

    impl TestDbBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        fn user(mut self, email: &str, role: Option<Role>) -> Self {
            self.users.push(TestUser {
                email: email.to_string(),
                role,
                belt: Belt::White,
                password: STANDARD_PASSWORD.to_string(),
            });
            self
        }

        pub fn student(self, email: &str) -> Self {
            self.user(email, Some(Role::Student))
        }

        pub fn professor(self, email: &str) -> Self {
            self.user(email, Some(Role::Professor))
        }

        pub fn owner(self, email: &str) -> Self {
            self.user(email, Some(Role::Owner))
        }

        /// An account that has never synced a profile.
        pub fn account_only(self, email: &str) -> Self {
            self.user(email, None)
        }

        pub fn student_with_belt(mut self, email: &str, belt: Belt) -> Self {
            self = self.student(email);
            if let Some(user) = self.users.last_mut() {
                user.belt = belt;
            }
            self
        }

        pub fn academy(mut self, owner_email: &str, name: &str, join_code: &str) -> Self {
            self.academies.push(TestAcademy {
                owner_email: owner_email.to_string(),
                name: name.to_string(),
                join_code: join_code.to_string(),
            });
            self
        }

        pub fn member(mut self, academy_name: &str, email: &str, status: MemberStatus) -> Self {
            self.members.push(TestMember {
                academy_name: academy_name.to_string(),
                email: email.to_string(),
                status,
            });
            self
        }

        pub fn training(
            mut self,
            email: &str,
            client_id: i64,
            date: &str,
            duration: &str,
            technique: &str,
        ) -> Self {
            self.trainings.push(TestTraining {
                email: email.to_string(),
                training: Training {
                    id: client_id,
                    date: date.to_string(),
                    duration: duration.to_string(),
                    technique: technique.to_string(),
                    notes: String::new(),
                    academy: None,
                    kind: Some("gi".to_string()),
                },
            });
            self
        }

        pub async fn build(self) -> Result<TestDb, AppError> {
            INIT.call_once(|| {
                let _ = env_logger::builder()
                    .parse_filters("debug")
                    .is_test(true)
                    .try_init();
            });

            let pool = SqlitePool::connect("sqlite::memory:").await?;
            migrate_database_declaratively(pool.clone(), CURRENT_SCHEMA, false).await?;

            let mut user_id_map: HashMap<String, i64> = HashMap::new();
            let mut academy_id_map: HashMap<String, i64> = HashMap::new();
            let mut member_id_map: HashMap<String, i64> = HashMap::new();

            for user in &self.users {
                let created = create_user(&pool, &user.email, &user.password, None).await?;

                if let Some(role) = user.role {
                    let name = user.email.split('@').next().unwrap_or_default().to_string();
                    upsert_profile(
                        &pool,
                        created.id,
                        &ProfilePayload {
                            name,
                            belt: user.belt,
                            degrees: 0,
                            academies: Vec::new(),
                            main_academy: None,
                            avatar_url: None,
                            language: "pt".to_string(),
                            role: Some(role),
                        },
                    )
                    .await?;
                }

                user_id_map.insert(user.email.clone(), created.id);
            }

            for academy in &self.academies {
                let owner_id = user_id_map[&academy.owner_email];
                let created =
                    create_academy(&pool, owner_id, &academy.name, &academy.join_code).await?;
                academy_id_map.insert(academy.name.clone(), created.id);
            }

            for member in &self.members {
                let academy_id = academy_id_map[&member.academy_name];
                let user_id = user_id_map[&member.email];
                let created = join_academy(&pool, academy_id, user_id).await?;
                if member.status == MemberStatus::Active {
                    approve_member(&pool, created.id).await?;
                }
                member_id_map.insert(member.email.clone(), created.id);
            }

            let mut by_user: HashMap<i64, Vec<Training>> = HashMap::new();
            for t in self.trainings {
                by_user
                    .entry(user_id_map[&t.email])
                    .or_default()
                    .push(t.training);
            }
            for (user_id, trainings) in by_user {
                upsert_trainings(&pool, user_id, &trainings).await?;
            }

            Ok(TestDb {
                pool,
                user_id_map,
                academy_id_map,
                member_id_map,
            })
        }
    }

    pub struct TestDb {
        pub pool: Pool<Sqlite>,
        pub user_id_map: HashMap<String, i64>,
        pub academy_id_map: HashMap<String, i64>,
        pub member_id_map: HashMap<String, i64>,
    }

    impl TestDb {
        pub fn user_id(&self, email: &str) -> Option<i64> {
            self.user_id_map.get(email).copied()
        }

        pub fn academy_id(&self, name: &str) -> Option<i64> {
            self.academy_id_map.get(name).copied()
        }

        /// Membership row id for the member's email.
        pub fn member_id(&self, email: &str) -> Option<i64> {
            self.member_id_map.get(email).copied()
        }
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::test_db::{STANDARD_PASSWORD, TestDb, TestDbBuilder};
    use crate::api::{SharedCoach, init_rocket_with_coach};
    use crate::coach::{SuggestionError, SuggestionProvider};
    use crate::config::AppConfig;
    use crate::models::MemberStatus;
    use async_trait::async_trait;
    use rocket::http::{ContentType, Status};
    use rocket::local::asynchronous::Client;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    pub const ADMIN_EMAIL: &str = "admin@example.com";

    /// Coach that answers with a fixed result.
    pub struct FakeCoach(pub Result<String, SuggestionError>);

    #[async_trait]
    impl SuggestionProvider for FakeCoach {
        async fn generate(&self, _prompt: &str) -> Result<String, SuggestionError> {
            self.0.clone()
        }
    }

    pub fn good_coach() -> SharedCoach {
        Arc::new(FakeCoach(Ok(r#"```json
{"focus":"Guard retention","reasoning":"Recent rolls were all passing.","suggestedTechniques":["Hip escape","Frames"]}
```"#
            .to_string())))
    }

    pub struct TestApp {
        pub client: Client,
        pub db: TestDb,
        pub avatars: TempDir,
    }

    pub async fn setup_test_client_with_coach(test_db: TestDb, coach: SharedCoach) -> TestApp {
        let avatars = TempDir::new().expect("Failed to create avatar dir");
        let config = AppConfig {
            admin_emails: vec![ADMIN_EMAIL.to_string()],
            avatar_dir: avatars.path().to_path_buf(),
            public_base_url: "http://localhost:8000".to_string(),
            avatar_max_bytes: 1024,
            ..Default::default()
        };

        let rocket = init_rocket_with_coach(test_db.pool.clone(), config, coach);
        let client = Client::tracked(rocket)
            .await
            .expect("Failed to create test client");

        TestApp {
            client,
            db: test_db,
            avatars,
        }
    }

    pub async fn setup_test_client(test_db: TestDb) -> TestApp {
        setup_test_client_with_coach(test_db, good_coach()).await
    }

    pub async fn sign_in(client: &Client, email: &str) {
        let response = client
            .post("/api/auth/signin")
            .header(ContentType::JSON)
            .body(json!({ "email": email, "password": STANDARD_PASSWORD }).to_string())
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::Ok, "Sign-in failed for {}", email);
    }

    /// An owner with one academy, an active and a pending student, and a
    /// student with trainings who belongs nowhere.
    pub async fn create_standard_test_db() -> TestDb {
        TestDbBuilder::new()
            .owner("owner@example.com")
            .student("active@example.com")
            .student("pending@example.com")
            .student("free@example.com")
            .student(ADMIN_EMAIL)
            .academy("owner@example.com", "Gracie Barra", "GB1234")
            .member("Gracie Barra", "active@example.com", MemberStatus::Active)
            .member("Gracie Barra", "pending@example.com", MemberStatus::Pending)
            .training("free@example.com", 1714550400000, "2024-05-01", "60", "Armbar")
            .training("free@example.com", 1714636800000, "2024-05-02", "90", "Kimura")
            .build()
            .await
            .expect("Failed to build test database")
    }
}
