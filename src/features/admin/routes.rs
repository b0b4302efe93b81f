use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};

use super::models::{
    ColumnDef, CreateFtsRequest, CreateTableRequest, RlsToggleRequest, TableResponse,
};
use super::service::{AdminError, AdminService};
use crate::features::meta::ColumnMeta;
use crate::features::rls::{CreatePolicyInput, RlsPolicy};
use crate::features::rest::error::ApiError;

pub fn admin_routes() -> Router<AdminService> {
    Router::new()
        .route("/tables", post(create_table_handler).get(list_tables_handler))
        .route(
            "/tables/:name",
            get(get_table_handler).delete(drop_table_handler),
        )
        .route("/tables/:name/columns", post(add_column_handler))
        .route(
            "/tables/:name/columns/:column",
            delete(drop_column_handler),
        )
        .route("/tables/:name/rls", put(set_rls_handler))
        .route(
            "/tables/:name/policies",
            post(create_policy_handler).get(list_policies_handler),
        )
        .route(
            "/tables/:name/policies/:policy",
            delete(delete_policy_handler),
        )
        .route("/tables/:name/fts", post(create_fts_handler))
}

#[axum::debug_handler]
async fn create_table_handler(
    State(service): State<AdminService>,
    Json(req): Json<CreateTableRequest>,
) -> Result<(StatusCode, Json<TableResponse>), AdminError> {
    let table = service.create_table(req).await?;
    Ok((StatusCode::CREATED, Json(table)))
}

#[axum::debug_handler]
async fn list_tables_handler(
    State(service): State<AdminService>,
) -> Result<Json<Vec<TableResponse>>, AdminError> {
    Ok(Json(service.list_tables().await?))
}

#[axum::debug_handler]
async fn get_table_handler(
    State(service): State<AdminService>,
    Path(name): Path<String>,
) -> Result<Json<TableResponse>, AdminError> {
    Ok(Json(service.get_table(&name).await?))
}

#[axum::debug_handler]
async fn drop_table_handler(
    State(service): State<AdminService>,
    Path(name): Path<String>,
) -> Result<StatusCode, AdminError> {
    service.drop_table(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn add_column_handler(
    State(service): State<AdminService>,
    Path(name): Path<String>,
    Json(def): Json<ColumnDef>,
) -> Result<(StatusCode, Json<ColumnMeta>), AdminError> {
    let meta = service.add_column(&name, def).await?;
    Ok((StatusCode::CREATED, Json(meta)))
}

#[axum::debug_handler]
async fn drop_column_handler(
    State(service): State<AdminService>,
    Path((name, column)): Path<(String, String)>,
) -> Result<StatusCode, AdminError> {
    service.drop_column(&name, &column).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn set_rls_handler(
    State(service): State<AdminService>,
    Path(name): Path<String>,
    Json(req): Json<RlsToggleRequest>,
) -> Result<StatusCode, ApiError> {
    if !service.meta().table_exists(&name).await? {
        return Err(ApiError::table_not_found(&name));
    }
    service.rls().set_table_rls(&name, req.enabled).await?;
    tracing::info!(table = %name, enabled = req.enabled, "RLS flag updated");
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn create_policy_handler(
    State(service): State<AdminService>,
    Path(name): Path<String>,
    Json(input): Json<CreatePolicyInput>,
) -> Result<(StatusCode, Json<RlsPolicy>), ApiError> {
    if !service.meta().table_exists(&name).await? {
        return Err(ApiError::table_not_found(&name));
    }
    let policy = service.rls().create_policy(&name, input).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

#[axum::debug_handler]
async fn list_policies_handler(
    State(service): State<AdminService>,
    Path(name): Path<String>,
) -> Result<Json<Vec<RlsPolicy>>, ApiError> {
    Ok(Json(service.rls().list_policies(&name).await?))
}

#[axum::debug_handler]
async fn delete_policy_handler(
    State(service): State<AdminService>,
    Path((name, policy)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    service.rls().delete_policy(&name, &policy).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn create_fts_handler(
    State(service): State<AdminService>,
    Path(name): Path<String>,
    Json(req): Json<CreateFtsRequest>,
) -> Result<StatusCode, AdminError> {
    service.create_fts(&name, req.columns).await?;
    Ok(StatusCode::CREATED)
}
