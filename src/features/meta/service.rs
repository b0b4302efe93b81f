use std::collections::HashMap;
use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use super::models::{ColumnMeta, FtsIndex, PgType, RelKind, Relationship, TableInfo};

/// Table names with these prefixes hold server-internal state and are never
/// routable through `/rest/v1`, service role included.
pub const RESERVED_PREFIXES: [&str; 4] = ["auth_", "storage_", "_", "sqlite_"];

pub fn is_reserved_table(name: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Owns the `_columns` registry, the `_fts_indexes` registry and the derived
/// relationship cache. The cache is a read-mostly map with explicit
/// invalidation and no TTL.
#[derive(Clone)]
pub struct MetaService {
    pool: SqlitePool,
    rel_cache: Arc<RwLock<HashMap<String, Arc<Vec<Relationship>>>>>,
}

impl MetaService {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            rel_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // ==================== COLUMN REGISTRY ====================

    pub async fn register_column(&self, col: &ColumnMeta) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        Self::register_column_tx(&mut conn, col).await
    }

    /// Upsert one `_columns` row. Callers running DDL use this inside the
    /// same transaction as the DDL statement.
    pub async fn register_column_tx(
        conn: &mut sqlx::SqliteConnection,
        col: &ColumnMeta,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO _columns (table_name, column_name, pg_type, is_nullable, default_value, is_primary)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (table_name, column_name) DO UPDATE SET
                 pg_type = excluded.pg_type,
                 is_nullable = excluded.is_nullable,
                 default_value = excluded.default_value,
                 is_primary = excluded.is_primary",
        )
        .bind(&col.table_name)
        .bind(&col.column_name)
        .bind(col.pg_type)
        .bind(col.is_nullable)
        .bind(&col.default_value)
        .bind(col.is_primary)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn delete_column_tx(
        conn: &mut sqlx::SqliteConnection,
        table: &str,
        column: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM _columns WHERE table_name = ? AND column_name = ?")
            .bind(table)
            .bind(column)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn delete_table_columns_tx(
        conn: &mut sqlx::SqliteConnection,
        table: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM _columns WHERE table_name = ?")
            .bind(table)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn get_columns(&self, table: &str) -> Result<Vec<ColumnMeta>, sqlx::Error> {
        sqlx::query_as::<_, ColumnMeta>(
            "SELECT table_name, column_name, pg_type, is_nullable, default_value, is_primary
             FROM _columns WHERE table_name = ? ORDER BY rowid",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_tables(&self) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT table_name FROM _columns ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, sqlx::Error> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    // ==================== TABLE INFO ====================

    /// Column metadata for the builder. Tables created through raw SQL
    /// migrations have no `_columns` rows; their metadata is synthesized
    /// from the storage engine's own table info.
    pub async fn table_columns_or_synthesized(
        &self,
        table: &str,
    ) -> Result<Vec<ColumnMeta>, sqlx::Error> {
        let registered = self.get_columns(table).await?;
        if !registered.is_empty() {
            return Ok(registered);
        }

        let rows = sqlx::query("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?)")
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let declared: String = row.get("type");
                ColumnMeta {
                    table_name: table.to_string(),
                    column_name: row.get("name"),
                    pg_type: PgType::from_declared(&declared),
                    is_nullable: row.get::<i64, _>("notnull") == 0,
                    default_value: None,
                    is_primary: row.get::<i64, _>("pk") > 0,
                }
            })
            .collect())
    }

    pub async fn get_table_info(&self, table: &str) -> Result<TableInfo, sqlx::Error> {
        let columns = self.table_columns_or_synthesized(table).await?;
        let relationships = self.get_relationships(table).await?;
        let fts = self.get_fts_index(table).await?;
        Ok(TableInfo {
            name: table.to_string(),
            columns,
            relationships: relationships.as_ref().clone(),
            fts,
        })
    }

    // ==================== RELATIONSHIPS ====================

    /// Every FK edge touching `table`: many-to-one via its own foreign
    /// keys, one-to-many by scanning the other tables' FK lists. Cached
    /// per process until DDL invalidates it.
    pub async fn get_relationships(
        &self,
        table: &str,
    ) -> Result<Arc<Vec<Relationship>>, sqlx::Error> {
        if let Some(cached) = self.rel_cache.read().await.get(table) {
            return Ok(cached.clone());
        }

        let derived = Arc::new(self.derive_relationships(table).await?);
        self.rel_cache
            .write()
            .await
            .insert(table.to_string(), derived.clone());
        Ok(derived)
    }

    async fn derive_relationships(&self, table: &str) -> Result<Vec<Relationship>, sqlx::Error> {
        let mut rels = Vec::new();

        for fk in self.foreign_keys_of(table).await? {
            rels.push(Relationship {
                name: fk.foreign_table.clone(),
                local_column: fk.local_column,
                foreign_table: fk.foreign_table,
                foreign_column: fk.foreign_column,
                kind: RelKind::ManyToOne,
            });
        }

        for other in self.all_user_tables().await? {
            if other == table {
                continue;
            }
            for fk in self.foreign_keys_of(&other).await? {
                if fk.foreign_table == table {
                    rels.push(Relationship {
                        name: other.clone(),
                        local_column: fk.foreign_column,
                        foreign_table: other.clone(),
                        foreign_column: fk.local_column,
                        kind: RelKind::OneToMany,
                    });
                }
            }
        }

        Ok(rels)
    }

    async fn foreign_keys_of(&self, table: &str) -> Result<Vec<ForeignKey>, sqlx::Error> {
        let rows = sqlx::query("SELECT \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?)")
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        let mut fks = Vec::with_capacity(rows.len());
        for row in rows {
            let foreign_table: String = row.get("table");
            let local_column: String = row.get("from");
            // "to" is NULL when the FK references the implicit primary key.
            let foreign_column: Option<String> = row.get("to");
            let foreign_column = match foreign_column {
                Some(c) => c,
                None => self.primary_key_of(&foreign_table).await?,
            };
            fks.push(ForeignKey {
                local_column,
                foreign_table,
                foreign_column,
            });
        }
        Ok(fks)
    }

    async fn primary_key_of(&self, table: &str) -> Result<String, sqlx::Error> {
        let pk: Option<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info(?) WHERE pk > 0 LIMIT 1")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;
        Ok(pk.unwrap_or_else(|| "rowid".to_string()))
    }

    async fn all_user_tables(&self) -> Result<Vec<String>, sqlx::Error> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(names.into_iter().filter(|n| !is_reserved_table(n)).collect())
    }

    pub async fn invalidate_cache(&self, table: &str) {
        self.rel_cache.write().await.remove(table);
    }

    /// Raw-SQL migrations bypass per-table invalidation, so a migration
    /// apply drops the whole cache.
    pub async fn invalidate_all(&self) {
        self.rel_cache.write().await.clear();
    }

    // ==================== FTS REGISTRY ====================

    pub async fn get_fts_index(&self, table: &str) -> Result<Option<FtsIndex>, sqlx::Error> {
        sqlx::query_as::<_, FtsIndex>(
            "SELECT table_name, index_table, columns FROM _fts_indexes WHERE table_name = ?",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn register_fts_index_tx(
        conn: &mut sqlx::SqliteConnection,
        index: &FtsIndex,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO _fts_indexes (table_name, index_table, columns) VALUES (?, ?, ?)
             ON CONFLICT (table_name) DO UPDATE SET
                 index_table = excluded.index_table, columns = excluded.columns",
        )
        .bind(&index.table_name)
        .bind(&index.index_table)
        .bind(&index.columns)
        .execute(conn)
        .await?;
        Ok(())
    }
}

struct ForeignKey {
    local_column: String,
    foreign_table: String,
    foreign_column: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefixes_block_internal_names() {
        assert!(is_reserved_table("auth_users"));
        assert!(is_reserved_table("storage_objects"));
        assert!(is_reserved_table("_columns"));
        assert!(is_reserved_table("sqlite_master"));
        assert!(!is_reserved_table("todos"));
        assert!(!is_reserved_table("authors"));
    }
}
