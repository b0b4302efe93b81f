use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Logical column type tracked in `_columns`. The storage engine is
/// dynamically typed; this is the contract REST payloads are validated
/// against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PgType {
    Uuid,
    Text,
    Integer,
    Numeric,
    Boolean,
    Timestamptz,
    Jsonb,
    Bytea,
}

impl PgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PgType::Uuid => "uuid",
            PgType::Text => "text",
            PgType::Integer => "integer",
            PgType::Numeric => "numeric",
            PgType::Boolean => "boolean",
            PgType::Timestamptz => "timestamptz",
            PgType::Jsonb => "jsonb",
            PgType::Bytea => "bytea",
        }
    }

    pub fn parse(s: &str) -> Option<PgType> {
        match s {
            "uuid" => Some(PgType::Uuid),
            "text" => Some(PgType::Text),
            "integer" => Some(PgType::Integer),
            "numeric" => Some(PgType::Numeric),
            "boolean" => Some(PgType::Boolean),
            "timestamptz" => Some(PgType::Timestamptz),
            "jsonb" => Some(PgType::Jsonb),
            "bytea" => Some(PgType::Bytea),
        _ => None,
        }
    }

    /// Storage affinity used when emitting DDL.
    pub fn sqlite_type(&self) -> &'static str {
        match self {
            PgType::Uuid | PgType::Text | PgType::Timestamptz | PgType::Jsonb => "TEXT",
            PgType::Integer | PgType::Boolean => "INTEGER",
            PgType::Numeric => "NUMERIC",
            // bytea values are persisted in base64 text form so rows stay
            // JSON-projectable; the declared type is still BLOB affinity.
            PgType::Bytea => "BLOB",
        }
    }

    /// Best-effort reverse mapping for tables created by raw SQL
    /// migrations, where no `_columns` row exists.
    pub fn from_declared(decl: &str) -> PgType {
        let decl = decl.to_ascii_uppercase();
        if decl.contains("INT") {
            PgType::Integer
        } else if decl.contains("REAL") || decl.contains("NUMERIC") || decl.contains("DECIMAL") {
            PgType::Numeric
        } else if decl.contains("BLOB") {
            PgType::Bytea
        } else if decl.contains("BOOL") {
            PgType::Boolean
        } else {
            PgType::Text
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub table_name: String,
    pub column_name: String,
    pub pg_type: PgType,
    pub is_nullable: bool,
    pub default_value: Option<String>,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelKind {
    ManyToOne,
    OneToMany,
}

/// A directed edge in the foreign-key graph, derived from the storage
/// engine's FK metadata and cached per process.
#[derive(Debug, Clone, Serialize)]
pub struct Relationship {
    pub name: String,
    pub local_column: String,
    pub foreign_table: String,
    pub foreign_column: String,
    pub kind: RelKind,
}

#[derive(Debug, Clone, FromRow)]
pub struct FtsIndex {
    pub table_name: String,
    pub index_table: String,
    /// JSON array of indexed column names.
    pub columns: String,
}

impl FtsIndex {
    pub fn column_list(&self) -> Vec<String> {
        serde_json::from_str(&self.columns).unwrap_or_default()
    }
}

/// Everything the SQL builder needs to know about one table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    pub relationships: Vec<Relationship>,
    pub fts: Option<FtsIndex>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.column_name == name)
    }

    pub fn primary_key(&self) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.is_primary)
    }
}
