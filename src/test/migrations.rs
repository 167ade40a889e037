#[cfg(test)]
mod tests {
    use crate::database::{
        CURRENT_SCHEMA, get_schema_changes, migrate_database_declaratively, normalize_sql,
    };
    use sqlx::{Row, SqlitePool};

    const PROFILES_SCHEMA: &str = r#"
        CREATE TABLE profiles (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );
    "#;

    const PROFILES_AND_TRAININGS_SCHEMA: &str = r#"
        CREATE TABLE profiles (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE TABLE trainings (
            id INTEGER PRIMARY KEY,
            technique TEXT NOT NULL,
            profile_id INTEGER,
            FOREIGN KEY (profile_id) REFERENCES profiles (id)
        );
    "#;

    const PROFILES_WITH_BELT_SCHEMA: &str = r#"
        CREATE TABLE profiles (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            belt TEXT
        );

        CREATE TABLE trainings (
            id INTEGER PRIMARY KEY,
            technique TEXT NOT NULL,
            profile_id INTEGER,
            FOREIGN KEY (profile_id) REFERENCES profiles (id)
        );
    "#;

    const PROFILES_WITHOUT_NAME_SCHEMA: &str = r#"
        CREATE TABLE profiles (
            id INTEGER PRIMARY KEY
            -- name dropped
        );
    "#;

    const WITH_INDEX_SCHEMA: &str = r#"
        CREATE TABLE profiles (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE INDEX idx_profiles_name ON profiles(name);
    "#;

    async fn create_test_db() -> SqlitePool {
        SqlitePool::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database")
    }

    async fn get_table_names(pool: &SqlitePool) -> Vec<String> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name != 'sqlite_sequence' ORDER BY name",
        )
        .fetch_all(pool)
        .await
        .expect("Failed to fetch table names");

        rows.into_iter().map(|row| row.get::<String, _>(0)).collect()
    }

    async fn get_column_names(pool: &SqlitePool, table: &str) -> Vec<String> {
        sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(pool)
            .await
            .expect("Failed to fetch columns")
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect()
    }

    async fn index_exists(pool: &SqlitePool, name: &str) -> bool {
        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?")
            .bind(name)
            .fetch_all(pool)
            .await
            .expect("Failed to query indices");
        !rows.is_empty()
    }

    #[tokio::test]
    async fn test_current_schema_is_idempotent() {
        let pool = create_test_db().await;

        let statements = migrate_database_declaratively(pool.clone(), CURRENT_SCHEMA, false)
            .await
            .expect("Initial migration failed");
        assert!(statements > 0, "A fresh database needs every table");

        let tables = get_table_names(&pool).await;
        for table in [
            "academies",
            "academy_members",
            "profiles",
            "trainings",
            "user_sessions",
            "users",
        ] {
            assert!(tables.contains(&table.to_string()), "Missing table {}", table);
        }

        let statements = migrate_database_declaratively(pool.clone(), CURRENT_SCHEMA, false)
            .await
            .expect("Second migration failed");
        assert_eq!(statements, 0, "Re-running the same schema should be a no-op");

        let changes = get_schema_changes(pool.clone(), CURRENT_SCHEMA)
            .await
            .expect("Planning failed");
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_empty_schema_on_empty_db() {
        let pool = create_test_db().await;

        let statements = migrate_database_declaratively(pool.clone(), "", false)
            .await
            .expect("Migration failed");
        assert_eq!(statements, 0);
        assert!(get_table_names(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn test_add_table() {
        let pool = create_test_db().await;
        sqlx::raw_sql(PROFILES_SCHEMA).execute(&pool).await.unwrap();

        let changes = get_schema_changes(pool.clone(), PROFILES_AND_TRAININGS_SCHEMA)
            .await
            .unwrap();
        assert_eq!(changes.new_tables, vec!["trainings"]);
        assert!(!changes.is_destructive());

        let statements =
            migrate_database_declaratively(pool.clone(), PROFILES_AND_TRAININGS_SCHEMA, false)
                .await
                .unwrap();
        assert_eq!(statements, 1);
        assert_eq!(get_table_names(&pool).await, vec!["profiles", "trainings"]);
    }

    #[tokio::test]
    async fn test_added_column_keeps_rows() {
        let pool = create_test_db().await;
        sqlx::raw_sql(PROFILES_AND_TRAININGS_SCHEMA)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO profiles (name) VALUES (?)")
            .bind("Helio")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO trainings (technique, profile_id) VALUES (?, 1)")
            .bind("Armbar")
            .execute(&pool)
            .await
            .unwrap();

        let statements =
            migrate_database_declaratively(pool.clone(), PROFILES_WITH_BELT_SCHEMA, false)
                .await
                .unwrap();
        assert!(statements > 0);
        assert!(get_column_names(&pool, "profiles").await.contains(&"belt".to_string()));

        let profile = sqlx::query("SELECT name, belt FROM profiles")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(profile.get::<String, _>("name"), "Helio");
        assert!(profile.get::<Option<String>, _>("belt").is_none());

        let trainings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trainings")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(trainings, 1, "Rebuilding the parent must not cascade into children");
    }

    #[tokio::test]
    async fn test_table_removal_requires_permission() {
        let pool = create_test_db().await;
        sqlx::raw_sql(PROFILES_AND_TRAININGS_SCHEMA)
            .execute(&pool)
            .await
            .unwrap();

        let error = migrate_database_declaratively(pool.clone(), PROFILES_SCHEMA, false)
            .await
            .expect_err("Dropping a table without permission should fail");
        let message = error.to_string();
        assert!(message.contains("trainings"));
        assert!(message.contains("ALLOW_DESTRUCTIVE_MIGRATIONS"));
        assert_eq!(get_table_names(&pool).await, vec!["profiles", "trainings"]);

        let statements = migrate_database_declaratively(pool.clone(), PROFILES_SCHEMA, true)
            .await
            .unwrap();
        assert!(statements > 0);
        assert_eq!(get_table_names(&pool).await, vec!["profiles"]);
    }

    #[tokio::test]
    async fn test_column_removal_requires_permission() {
        let pool = create_test_db().await;
        sqlx::raw_sql(PROFILES_SCHEMA).execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO profiles (name) VALUES ('Rickson')")
            .execute(&pool)
            .await
            .unwrap();

        let changes = get_schema_changes(pool.clone(), PROFILES_WITHOUT_NAME_SCHEMA)
            .await
            .unwrap();
        assert_eq!(changes.modified_tables.len(), 1);
        assert_eq!(changes.modified_tables[0].removed_columns, vec!["name"]);
        assert!(changes.is_destructive());

        let error = migrate_database_declaratively(pool.clone(), PROFILES_WITHOUT_NAME_SCHEMA, false)
            .await
            .expect_err("Dropping a column without permission should fail");
        assert!(error.to_string().contains("name"));
        assert!(get_column_names(&pool, "profiles").await.contains(&"name".to_string()));

        migrate_database_declaratively(pool.clone(), PROFILES_WITHOUT_NAME_SCHEMA, true)
            .await
            .unwrap();
        assert_eq!(get_column_names(&pool, "profiles").await, vec!["id"]);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM profiles")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_index_removal_requires_permission() {
        let pool = create_test_db().await;
        sqlx::raw_sql(WITH_INDEX_SCHEMA).execute(&pool).await.unwrap();

        let result = migrate_database_declaratively(pool.clone(), PROFILES_SCHEMA, false).await;
        assert!(result.is_err());
        assert!(index_exists(&pool, "idx_profiles_name").await);

        migrate_database_declaratively(pool.clone(), PROFILES_SCHEMA, true)
            .await
            .unwrap();
        assert!(!index_exists(&pool, "idx_profiles_name").await);
    }

    #[tokio::test]
    async fn test_rebuilt_table_gets_its_index_back() {
        let pool = create_test_db().await;
        sqlx::raw_sql(WITH_INDEX_SCHEMA).execute(&pool).await.unwrap();

        let target = r#"
            CREATE TABLE profiles (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                language TEXT NOT NULL DEFAULT 'pt'
            );

            CREATE INDEX idx_profiles_name ON profiles(name);
        "#;

        migrate_database_declaratively(pool.clone(), target, false)
            .await
            .unwrap();
        assert!(index_exists(&pool, "idx_profiles_name").await);
        assert_eq!(
            migrate_database_declaratively(pool.clone(), target, false)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_foreign_keys_stay_enabled() {
        let pool = create_test_db().await;
        migrate_database_declaratively(pool.clone(), PROFILES_WITH_BELT_SCHEMA, false)
            .await
            .unwrap();

        let pragma: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(pragma, 1);
    }

    #[test]
    fn test_normalize_sql() {
        assert_eq!(
            normalize_sql("CREATE TABLE trainings( -- comment\n  id INTEGER )"),
            "CREATE TABLE trainings(id INTEGER)"
        );
        assert_eq!(
            normalize_sql("CREATE TABLE \"profiles\"(id INTEGER)"),
            "CREATE TABLE profiles(id INTEGER)"
        );
    }
}
