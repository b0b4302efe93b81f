use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::features::meta::MetaService;

/// Versioned DDL file: `<14-digit version>_<name>.sql`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: String,
    pub name: String,
    pub sql: String,
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("duplicate migration version {0}")]
    DuplicateVersion(String),

    #[error("failed to read migration {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("migration {version} failed: {source}")]
    Failed {
        version: String,
        source: sqlx::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn filename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{14})_(.+)\.sql$").unwrap())
}

/// Forward-only migration runner over a configured directory. Applied
/// versions are tracked in `_schema_migrations`; there is no rollback.
#[derive(Clone)]
pub struct MigrationService {
    pool: SqlitePool,
    meta: MetaService,
}

impl MigrationService {
    pub fn new(pool: SqlitePool, meta: MetaService) -> Self {
        Self { pool, meta }
    }

    /// Scan a directory for migration files, sorted by version ascending.
    /// A missing directory yields an empty set, not an error.
    pub fn read_from_dir(dir: &Path) -> Result<Vec<Migration>, MigrationError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(MigrationError::Io {
                    path: dir.to_path_buf(),
                    source: e,
                })
            }
        };

        let mut migrations = Vec::new();
        let mut seen = HashSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| MigrationError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(caps) = filename_re().captures(name) else {
                continue;
            };

            let version = caps[1].to_string();
            if !seen.insert(version.clone()) {
                return Err(MigrationError::DuplicateVersion(version));
            }

            let path = entry.path();
            let sql = std::fs::read_to_string(&path)
                .map_err(|e| MigrationError::Io { path, source: e })?;
            migrations.push(Migration {
                version,
                name: caps[2].to_string(),
                sql,
            });
        }

        migrations.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(migrations)
    }

    pub async fn get_applied(&self) -> Result<Vec<String>, MigrationError> {
        let versions =
            sqlx::query_scalar::<_, String>("SELECT version FROM _schema_migrations ORDER BY version")
                .fetch_all(&self.pool)
                .await?;
        Ok(versions)
    }

    pub async fn get_pending(&self, dir: &Path) -> Result<Vec<Migration>, MigrationError> {
        let applied: HashSet<String> = self.get_applied().await?.into_iter().collect();
        Ok(Self::read_from_dir(dir)?
            .into_iter()
            .filter(|m| !applied.contains(&m.version))
            .collect())
    }

    /// Execute the migration's statements and record the version in one
    /// transaction; any failure rolls the whole migration back.
    pub async fn apply(&self, migration: &Migration) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::raw_sql(&migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::Failed {
                version: migration.version.clone(),
                source: e,
            })?;

        sqlx::query("INSERT INTO _schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(&migration.version)
            .bind(&migration.name)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        // Raw DDL bypasses per-table invalidation.
        self.meta.invalidate_all().await;
        Ok(())
    }

    pub async fn apply_pending(&self, dir: &Path) -> Result<usize, MigrationError> {
        let pending = self.get_pending(dir).await?;
        let count = pending.len();
        for migration in &pending {
            tracing::info!(version = %migration.version, name = %migration.name, "Applying migration");
            self.apply(migration).await?;
        }
        Ok(count)
    }
}
