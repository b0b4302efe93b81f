use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;

use super::models::{ColumnDef, CreateTableRequest, TableResponse};
use crate::features::meta::service::is_reserved_table;
use crate::features::meta::{ColumnMeta, FtsIndex, MetaService, PgType};
use crate::features::rls::RlsService;
use crate::features::rest::builder::quote_ident;

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("Invalid table name '{0}'")]
    InvalidName(String),

    #[error("Unknown column type '{0}'")]
    UnknownType(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    #[error("A table needs at least one column")]
    NoColumns,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl AdminError {
    fn to_status_code(&self) -> StatusCode {
        match self {
            Self::InvalidName(_) | Self::UnknownType(_) | Self::NoColumns => {
                StatusCode::BAD_REQUEST
            }
            Self::TableExists(_) => StatusCode::CONFLICT,
            Self::TableNotFound(_) | Self::ColumnNotFound(_) => StatusCode::NOT_FOUND,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "InvalidName",
            Self::UnknownType(_) => "TypeMismatch",
            Self::TableExists(_) => "UniqueViolation",
            Self::TableNotFound(_) => "TableNotFound",
            Self::ColumnNotFound(_) => "ColumnUnknown",
            Self::NoColumns => "InvalidName",
            Self::Database(_) => "StorageError",
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.to_status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Admin internal error");
            "Internal error".to_string()
        } else {
            self.to_string()
        };
        (
            status,
            Json(json!({"error": {"code": self.code(), "message": message}})),
        )
            .into_response()
    }
}

/// Typed DDL surface. Every DDL statement registers or removes matching
/// `_columns` metadata inside the same transaction; a failure in either
/// half rolls both back.
#[derive(Clone)]
pub struct AdminService {
    pool: SqlitePool,
    meta: MetaService,
    rls: RlsService,
}

impl AdminService {
    pub fn new(pool: SqlitePool, meta: MetaService, rls: RlsService) -> Self {
        Self { pool, meta, rls }
    }

    pub fn meta(&self) -> &MetaService {
        &self.meta
    }

    pub fn rls(&self) -> &RlsService {
        &self.rls
    }

    fn check_name(name: &str) -> Result<(), AdminError> {
        if name.is_empty() || is_reserved_table(name) {
            return Err(AdminError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    fn column_meta(table: &str, def: &ColumnDef) -> Result<ColumnMeta, AdminError> {
        let pg_type = PgType::parse(&def.pg_type)
            .ok_or_else(|| AdminError::UnknownType(def.pg_type.clone()))?;
        Ok(ColumnMeta {
            table_name: table.to_string(),
            column_name: def.name.clone(),
            pg_type,
            is_nullable: def.nullable.unwrap_or(true) && !def.primary.unwrap_or(false),
            default_value: def.default.clone(),
            is_primary: def.primary.unwrap_or(false),
        })
    }

    fn column_ddl(def: &ColumnDef, meta: &ColumnMeta) -> String {
        let mut ddl = format!(
            "{} {}",
            quote_ident(&meta.column_name),
            meta.pg_type.sqlite_type()
        );
        if meta.is_primary {
            ddl.push_str(" PRIMARY KEY");
        }
        if !meta.is_nullable && !meta.is_primary {
            ddl.push_str(" NOT NULL");
        }
        if let Some(default) = &meta.default_value {
            ddl.push_str(&format!(" DEFAULT {}", default));
        }
        if let Some(fk) = &def.references {
            ddl.push_str(&format!(
                " REFERENCES {} ({})",
                quote_ident(&fk.table),
                quote_ident(&fk.column)
            ));
        }
        ddl
    }

    pub async fn create_table(&self, req: CreateTableRequest) -> Result<TableResponse, AdminError> {
        Self::check_name(&req.name)?;
        if req.columns.is_empty() {
            return Err(AdminError::NoColumns);
        }
        if self.meta.table_exists(&req.name).await? {
            return Err(AdminError::TableExists(req.name));
        }

        let mut metas = Vec::with_capacity(req.columns.len());
        let mut column_ddl = Vec::with_capacity(req.columns.len());
        for def in &req.columns {
            let meta = Self::column_meta(&req.name, def)?;
            column_ddl.push(Self::column_ddl(def, &meta));
            metas.push(meta);
        }

        let ddl = format!(
            "CREATE TABLE {} ({})",
            quote_ident(&req.name),
            column_ddl.join(", ")
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&ddl).execute(&mut *tx).await?;
        for meta in &metas {
            MetaService::register_column_tx(&mut tx, meta).await?;
        }
        tx.commit().await?;

        self.meta.invalidate_cache(&req.name).await;
        for def in &req.columns {
            if let Some(fk) = &def.references {
                self.meta.invalidate_cache(&fk.table).await;
            }
        }

        tracing::info!(table = %req.name, "Created table");
        Ok(TableResponse {
            name: req.name,
            columns: metas,
        })
    }

    pub async fn list_tables(&self) -> Result<Vec<TableResponse>, AdminError> {
        let mut tables = Vec::new();
        for name in self.meta.list_tables().await? {
            let columns = self.meta.get_columns(&name).await?;
            tables.push(TableResponse { name, columns });
        }
        Ok(tables)
    }

    pub async fn get_table(&self, name: &str) -> Result<TableResponse, AdminError> {
        Self::check_name(name)?;
        if !self.meta.table_exists(name).await? {
            return Err(AdminError::TableNotFound(name.to_string()));
        }
        let columns = self.meta.get_columns(name).await?;
        Ok(TableResponse {
            name: name.to_string(),
            columns,
        })
    }

    pub async fn drop_table(&self, name: &str) -> Result<(), AdminError> {
        Self::check_name(name)?;
        if !self.meta.table_exists(name).await? {
            return Err(AdminError::TableNotFound(name.to_string()));
        }

        let fts = self.meta.get_fts_index(name).await?;

        let mut tx = self.pool.begin().await?;
        if let Some(fts) = &fts {
            Self::drop_fts_artifacts(&mut tx, &fts.index_table).await?;
        }
        sqlx::query(&format!("DROP TABLE {}", quote_ident(name)))
            .execute(&mut *tx)
            .await?;
        MetaService::delete_table_columns_tx(&mut tx, name).await?;
        sqlx::query("DELETE FROM _rls_policies WHERE table_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM _rls_tables WHERE table_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM _fts_indexes WHERE table_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        // Other tables may have pointed FKs here; drop the whole cache.
        self.meta.invalidate_all().await;
        tracing::info!(table = %name, "Dropped table");
        Ok(())
    }

    pub async fn add_column(&self, table: &str, def: ColumnDef) -> Result<ColumnMeta, AdminError> {
        Self::check_name(table)?;
        if !self.meta.table_exists(table).await? {
            return Err(AdminError::TableNotFound(table.to_string()));
        }

        let meta = Self::column_meta(table, &def)?;
        let ddl = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            Self::column_ddl(&def, &meta)
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&ddl).execute(&mut *tx).await?;
        MetaService::register_column_tx(&mut tx, &meta).await?;
        tx.commit().await?;

        self.meta.invalidate_cache(table).await;
        if let Some(fk) = &def.references {
            self.meta.invalidate_cache(&fk.table).await;
        }
        Ok(meta)
    }

    pub async fn drop_column(&self, table: &str, column: &str) -> Result<(), AdminError> {
        Self::check_name(table)?;
        if !self.meta.table_exists(table).await? {
            return Err(AdminError::TableNotFound(table.to_string()));
        }
        let known = self
            .meta
            .get_columns(table)
            .await?
            .iter()
            .any(|c| c.column_name == column);
        if !known {
            return Err(AdminError::ColumnNotFound(column.to_string()));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_ident(table),
            quote_ident(column)
        ))
        .execute(&mut *tx)
        .await?;
        MetaService::delete_column_tx(&mut tx, table, column).await?;
        tx.commit().await?;

        self.meta.invalidate_cache(table).await;
        Ok(())
    }

    // ==================== FTS ====================

    /// Create the FTS5 shadow table plus sync triggers and register the
    /// index so the `fts` operator family has a target.
    pub async fn create_fts(&self, table: &str, columns: Vec<String>) -> Result<FtsIndex, AdminError> {
        Self::check_name(table)?;
        if !self.meta.table_exists(table).await? {
            return Err(AdminError::TableNotFound(table.to_string()));
        }
        if columns.is_empty() {
            return Err(AdminError::NoColumns);
        }
        let registered = self.meta.get_columns(table).await?;
        for column in &columns {
            if !registered.iter().any(|c| &c.column_name == column) {
                return Err(AdminError::ColumnNotFound(column.clone()));
            }
        }

        let index_table = format!("{}_fts", table);
        let quoted_cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let new_cols: Vec<String> = columns
            .iter()
            .map(|c| format!("new.{}", quote_ident(c)))
            .collect();
        let old_cols: Vec<String> = columns
            .iter()
            .map(|c| format!("old.{}", quote_ident(c)))
            .collect();

        let create = format!(
            "CREATE VIRTUAL TABLE {} USING fts5({}, content='{}', content_rowid='rowid')",
            quote_ident(&index_table),
            quoted_cols.join(", "),
            table.replace('\'', "''")
        );
        let insert_trigger = format!(
            "CREATE TRIGGER {} AFTER INSERT ON {} BEGIN
                 INSERT INTO {} (rowid, {}) VALUES (new.rowid, {});
             END",
            quote_ident(&format!("{}_ai", index_table)),
            quote_ident(table),
            quote_ident(&index_table),
            quoted_cols.join(", "),
            new_cols.join(", ")
        );
        let delete_trigger = format!(
            "CREATE TRIGGER {} AFTER DELETE ON {} BEGIN
                 INSERT INTO {} ({}, rowid, {}) VALUES ('delete', old.rowid, {});
             END",
            quote_ident(&format!("{}_ad", index_table)),
            quote_ident(table),
            quote_ident(&index_table),
            quote_ident(&index_table),
            quoted_cols.join(", "),
            old_cols.join(", ")
        );
        let update_trigger = format!(
            "CREATE TRIGGER {} AFTER UPDATE ON {} BEGIN
                 INSERT INTO {} ({}, rowid, {}) VALUES ('delete', old.rowid, {});
                 INSERT INTO {} (rowid, {}) VALUES (new.rowid, {});
             END",
            quote_ident(&format!("{}_au", index_table)),
            quote_ident(table),
            quote_ident(&index_table),
            quote_ident(&index_table),
            quoted_cols.join(", "),
            old_cols.join(", "),
            quote_ident(&index_table),
            quoted_cols.join(", "),
            new_cols.join(", ")
        );

        let index = FtsIndex {
            table_name: table.to_string(),
            index_table,
            columns: serde_json::to_string(&columns).unwrap_or_else(|_| "[]".to_string()),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(&create).execute(&mut *tx).await?;
        sqlx::query(&insert_trigger).execute(&mut *tx).await?;
        sqlx::query(&delete_trigger).execute(&mut *tx).await?;
        sqlx::query(&update_trigger).execute(&mut *tx).await?;
        MetaService::register_fts_index_tx(&mut tx, &index).await?;
        tx.commit().await?;

        tracing::info!(table = %table, index = %index.index_table, "Registered FTS index");
        Ok(index)
    }

    async fn drop_fts_artifacts(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        index_table: &str,
    ) -> Result<(), AdminError> {
        for suffix in ["ai", "ad", "au"] {
            sqlx::query(&format!(
                "DROP TRIGGER IF EXISTS {}",
                quote_ident(&format!("{}_{}", index_table, suffix))
            ))
            .execute(&mut **tx)
            .await?;
        }
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(index_table)))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}
