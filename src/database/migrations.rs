use regex::Regex;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Executor, Pool, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, instrument, warn};

use crate::error::AppError;

/// Differences between the live database and the declared schema.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchemaChanges {
    pub new_tables: Vec<String>,
    pub removed_tables: Vec<String>,
    pub modified_tables: Vec<TableChange>,
    pub new_indices: Vec<String>,
    pub removed_indices: Vec<String>,
    pub modified_indices: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TableChange {
    pub name: String,
    pub removed_columns: Vec<String>,
}

impl SchemaChanges {
    pub fn is_empty(&self) -> bool {
        self.new_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.modified_tables.is_empty()
            && self.new_indices.is_empty()
            && self.removed_indices.is_empty()
            && self.modified_indices.is_empty()
    }

    pub fn is_destructive(&self) -> bool {
        !self.removed_tables.is_empty()
            || !self.removed_indices.is_empty()
            || self
                .modified_tables
                .iter()
                .any(|table| !table.removed_columns.is_empty())
    }
}

type SchemaObjects = BTreeMap<String, String>;

/// Brings a SQLite database in line with a declared schema by diffing
/// `sqlite_master` against a pristine in-memory copy.
pub struct DeclarativeMigrator {
    pool: Pool<Sqlite>,
    target_schema: String,
    allow_deletions: bool,
}

impl DeclarativeMigrator {
    pub fn new(pool: Pool<Sqlite>, target_schema: &str, allow_deletions: bool) -> Self {
        Self {
            pool,
            target_schema: target_schema.to_string(),
            allow_deletions,
        }
    }

    async fn pristine(&self) -> Result<SqlitePool, AppError> {
        let pristine = SqlitePool::connect("sqlite::memory:").await?;
        if !self.target_schema.trim().is_empty() {
            sqlx::raw_sql(&self.target_schema)
                .execute(&pristine)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to create pristine schema: {}", e)))?;
        }
        Ok(pristine)
    }

    #[instrument(skip(self))]
    pub async fn plan(&self) -> Result<SchemaChanges, AppError> {
        let pristine = self.pristine().await?;
        let mut conn = self.pool.acquire().await?;
        diff(&mut conn, &pristine).await
    }

    /// Applies the declared schema. Returns the number of statements executed.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<u32, AppError> {
        info!("Starting declarative database migration");

        let pristine = self.pristine().await?;
        let mut conn = self.pool.acquire().await?;
        let changes = diff(&mut conn, &pristine).await?;

        if changes.is_empty() {
            info!("No schema changes needed");
            return Ok(0);
        }

        if changes.is_destructive() && !self.allow_deletions {
            return Err(AppError::Internal(format!(
                "Refusing destructive migration (tables {:?}, indices {:?}, columns {:?}). Set ALLOW_DESTRUCTIVE_MIGRATIONS=true to permit this.",
                changes.removed_tables,
                changes.removed_indices,
                changes
                    .modified_tables
                    .iter()
                    .filter(|t| !t.removed_columns.is_empty())
                    .collect::<Vec<_>>(),
            )));
        }

        // Table rebuilds drop the old table; with enforcement on that would cascade into children.
        conn.execute("PRAGMA foreign_keys = OFF").await?;
        let result = apply(&mut conn, &pristine, &changes).await;
        conn.execute("PRAGMA foreign_keys = ON").await?;
        let statements = result?;

        info!("Running VACUUM after migration");
        conn.execute("VACUUM").await?;

        info!(statements, "Migration completed");
        Ok(statements)
    }
}

async fn apply(
    conn: &mut PoolConnection<Sqlite>,
    pristine: &SqlitePool,
    changes: &SchemaChanges,
) -> Result<u32, AppError> {
    let target_tables = tables(pristine).await?;
    let target_indices = indices(pristine).await?;
    let mut statements = 0;

    let mut tx = conn.begin().await?;

    for name in &changes.new_tables {
        if let Some(sql) = target_tables.get(name) {
            execute(&mut tx, &format!("Create new table {}", name), sql).await?;
            statements += 1;
        }
    }

    for table in &changes.modified_tables {
        if let Some(sql) = target_tables.get(&table.name) {
            statements += rebuild_table(&mut tx, pristine, &table.name, sql).await?;
        }
    }

    for name in &changes.removed_tables {
        execute(&mut tx, &format!("Drop table {}", name), &format!("DROP TABLE {}", name)).await?;
        statements += 1;
    }

    for name in changes.removed_indices.iter().chain(&changes.modified_indices) {
        execute(
            &mut tx,
            &format!("Drop index {}", name),
            &format!("DROP INDEX IF EXISTS {}", name),
        )
        .await?;
        statements += 1;
    }

    // Rebuilt tables lose their indices, so recreate every declared index that is now missing.
    let live_indices = indices(&mut *tx).await?;
    for (name, sql) in &target_indices {
        if !live_indices.contains_key(name) {
            execute(&mut tx, &format!("Create index {}", name), sql).await?;
            statements += 1;
        }
    }

    let violations = sqlx::query("PRAGMA foreign_key_check")
        .fetch_all(&mut *tx)
        .await?;
    if !violations.is_empty() {
        warn!(count = violations.len(), "Foreign key violations after migration");
    }

    tx.commit().await?;
    Ok(statements)
}

async fn rebuild_table(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    pristine: &SqlitePool,
    table_name: &str,
    target_sql: &str,
) -> Result<u32, AppError> {
    info!("Rebuilding table: {}", table_name);

    let temp_name = format!("{}_migration_new", table_name);
    let create_temp = rename_create_table(target_sql, table_name, &temp_name);

    let current: BTreeSet<String> = columns(&mut **tx, table_name).await?.into_iter().collect();
    let target: BTreeSet<String> = columns(pristine, table_name).await?.into_iter().collect();
    let common = current
        .intersection(&target)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");

    execute(tx, &format!("Create replacement for {}", table_name), &create_temp).await?;
    let mut statements = 1;

    if !common.is_empty() {
        let copy_sql = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            temp_name, common, common, table_name
        );
        execute(tx, &format!("Copy rows into {}", temp_name), &copy_sql).await?;
        statements += 1;
    }

    execute(
        tx,
        &format!("Drop old {}", table_name),
        &format!("DROP TABLE {}", table_name),
    )
    .await?;
    execute(
        tx,
        &format!("Rename {} to {}", temp_name, table_name),
        &format!("ALTER TABLE {} RENAME TO {}", temp_name, table_name),
    )
    .await?;

    Ok(statements + 2)
}

async fn execute(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    description: &str,
    sql: &str,
) -> Result<(), AppError> {
    info!("Database migration: {} with SQL:\n{}", description, sql);
    sqlx::query(sql).execute(&mut **tx).await?;
    Ok(())
}

async fn diff(
    conn: &mut SqliteConnection,
    pristine: &SqlitePool,
) -> Result<SchemaChanges, AppError> {
    let current_tables = tables(&mut *conn).await?;
    let target_tables = tables(pristine).await?;
    let current_indices = indices(&mut *conn).await?;
    let target_indices = indices(pristine).await?;

    let mut changes = SchemaChanges {
        new_tables: missing_from(&target_tables, &current_tables),
        removed_tables: missing_from(&current_tables, &target_tables),
        new_indices: missing_from(&target_indices, &current_indices),
        removed_indices: missing_from(&current_indices, &target_indices),
        ..Default::default()
    };

    for (name, current_sql) in &current_tables {
        let Some(target_sql) = target_tables.get(name) else {
            continue;
        };
        if normalize_sql(current_sql) == normalize_sql(target_sql) {
            continue;
        }

        let current_columns = columns(&mut *conn, name).await?;
        let target_columns = columns(pristine, name).await?;
        changes.modified_tables.push(TableChange {
            name: name.clone(),
            removed_columns: current_columns
                .into_iter()
                .filter(|column| !target_columns.contains(column))
                .collect(),
        });
    }

    for (name, current_sql) in &current_indices {
        if let Some(target_sql) = target_indices.get(name) {
            if normalize_sql(current_sql) != normalize_sql(target_sql) {
                changes.modified_indices.push(name.clone());
            }
        }
    }

    Ok(changes)
}

fn missing_from(source: &SchemaObjects, other: &SchemaObjects) -> Vec<String> {
    source
        .keys()
        .filter(|name| !other.contains_key(*name))
        .cloned()
        .collect()
}

async fn tables<'e, E>(executor: E) -> Result<SchemaObjects, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    schema_objects(
        executor,
        "SELECT name, sql FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )
    .await
}

async fn indices<'e, E>(executor: E) -> Result<SchemaObjects, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    schema_objects(
        executor,
        "SELECT name, sql FROM sqlite_master WHERE type = 'index' AND sql IS NOT NULL",
    )
    .await
}

async fn schema_objects<'e, E>(executor: E, query: &str) -> Result<SchemaObjects, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(query).fetch_all(executor).await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get::<String, _>(0), row.get::<String, _>(1)))
        .collect())
}

async fn columns<'e, E>(executor: E, table_name: &str) -> Result<Vec<String>, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table_name))
        .fetch_all(executor)
        .await?;
    Ok(rows.into_iter().map(|row| row.get::<String, _>(1)).collect())
}

fn rename_create_table(sql: &str, from: &str, to: &str) -> String {
    let pattern = format!(
        r#"(?i)^\s*CREATE\s+TABLE\s+(IF\s+NOT\s+EXISTS\s+)?["`]?{}["`]?"#,
        regex::escape(from)
    );
    match Regex::new(&pattern) {
        Ok(re) => re.replace(sql, format!("CREATE TABLE {}", to)).into_owned(),
        Err(_) => sql.replacen(from, to, 1),
    }
}

pub fn normalize_sql(sql: &str) -> String {
    static PATTERNS: once_cell::sync::Lazy<[(Regex, &str); 4]> = once_cell::sync::Lazy::new(|| {
        [
            (Regex::new(r"--[^\n]*(\n|$)").expect("valid regex"), " "),
            (Regex::new(r"\s+").expect("valid regex"), " "),
            (Regex::new(r" *([(),]) *").expect("valid regex"), "$1"),
            (Regex::new(r#""(\w+)""#).expect("valid regex"), "$1"),
        ]
    });

    let mut sql = sql.to_string();
    for (pattern, replacement) in PATTERNS.iter() {
        sql = pattern.replace_all(&sql, *replacement).into_owned();
    }
    sql.trim().to_string()
}

#[instrument(skip(pool))]
pub async fn migrate_database_declaratively(
    pool: Pool<Sqlite>,
    target_schema: &str,
    allow_deletions: bool,
) -> Result<u32, AppError> {
    DeclarativeMigrator::new(pool, target_schema, allow_deletions)
        .migrate()
        .await
}

#[instrument(skip(pool))]
pub async fn get_schema_changes(
    pool: Pool<Sqlite>,
    target_schema: &str,
) -> Result<SchemaChanges, AppError> {
    DeclarativeMigrator::new(pool, target_schema, false)
        .plan()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_ignores_layout_and_comments() {
        let a = "CREATE TABLE t (\n  id INTEGER, -- key\n  name TEXT\n)";
        let b = "CREATE TABLE \"t\" (id INTEGER,name TEXT)";
        assert_eq!(normalize_sql(a), normalize_sql(b));
    }

    #[test]
    fn rename_handles_quoting_and_if_not_exists() {
        assert_eq!(
            rename_create_table("CREATE TABLE IF NOT EXISTS \"users\" (id)", "users", "users_new"),
            "CREATE TABLE users_new (id)"
        );
        assert_eq!(
            rename_create_table("CREATE TABLE users (id)", "users", "users_new"),
            "CREATE TABLE users_new (id)"
        );
    }
}
