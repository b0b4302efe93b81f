use serde::{Deserialize, Serialize};

use crate::features::meta::ColumnMeta;

#[derive(Debug, Clone, Deserialize)]
pub struct ForeignRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub pg_type: String,
    pub nullable: Option<bool>,
    pub primary: Option<bool>,
    pub default: Option<String>,
    pub references: Option<ForeignRef>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTableRequest {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Serialize)]
pub struct TableResponse {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
}

#[derive(Debug, Deserialize)]
pub struct RlsToggleRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateFtsRequest {
    pub columns: Vec<String>,
}
