use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use serde_json::{Map, Value};
use sqlx::SqlitePool;

use super::builder::{
    build_check_violations, build_count, build_delete, build_insert_row, build_rowids,
    build_select, build_update, resolve_relationship, BuiltQuery, RlsConditions, SchemaSet,
    SqlParam,
};
use super::error::ApiError;
use super::parser::{QueryPlan, SelectItem};
use super::response::{
    content_range, parse_range, shape_rows, Preferences, Resolution, ReturnShape,
};
use crate::features::meta::service::is_reserved_table;
use crate::features::meta::{MetaService, TableInfo};
use crate::features::rls::{PolicyCommand, RlsService};
use crate::middleware::auth::AuthContext;

#[derive(Clone)]
pub struct RestService {
    pool: SqlitePool,
    meta: MetaService,
    rls: RlsService,
}

impl RestService {
    pub fn new(pool: SqlitePool, meta: MetaService, rls: RlsService) -> Self {
        Self { pool, meta, rls }
    }

    /// Internal tables are blocked before the engine sees them; the reply
    /// is indistinguishable from a genuinely missing table.
    async fn guard_table(&self, table: &str) -> Result<(), ApiError> {
        if is_reserved_table(table) {
            return Err(ApiError::table_not_found(table));
        }
        if !self.meta.table_exists(table).await? {
            return Err(ApiError::table_not_found(table));
        }
        Ok(())
    }
}

pub fn rest_routes() -> Router<RestService> {
    Router::new().route(
        "/:table",
        get(select_handler)
            .post(insert_handler)
            .patch(update_handler)
            .delete(delete_handler),
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Load the root table plus every table reachable through the embed tree.
async fn load_schema(
    service: &RestService,
    root: TableInfo,
    items: &[SelectItem],
) -> Result<SchemaSet, ApiError> {
    let mut set = SchemaSet::default();
    let mut queue: Vec<(String, Vec<SelectItem>)> = vec![(root.name.clone(), items.to_vec())];
    set.tables.insert(root.name.clone(), root);

    while let Some((table, items)) = queue.pop() {
        let parent = set.get(&table)?.clone();
        for item in &items {
            if let SelectItem::Embed(embed) = item {
                let rel = resolve_relationship(&parent, embed)?;
                let target = rel.foreign_table.clone();
                if is_reserved_table(&target) {
                    return Err(ApiError::select_syntax(format!(
                        "Could not find a relationship for '{}'",
                        embed.target
                    )));
                }
                if !set.tables.contains_key(&target) {
                    let info = service.meta.get_table_info(&target).await?;
                    set.tables.insert(target.clone(), info);
                }
                queue.push((target, embed.items.clone()));
            }
        }
    }
    Ok(set)
}

/// SELECT-visibility conditions for every table in the request's schema
/// set; embeds are filtered by their own table's policies.
async fn select_conditions(
    service: &RestService,
    schema: &SchemaSet,
    ctx: &AuthContext,
) -> Result<RlsConditions, ApiError> {
    let mut conditions = RlsConditions::new();
    for name in schema.tables.keys() {
        if let Some(cond) = service
            .rls
            .using_condition(name, PolicyCommand::Select, ctx)
            .await?
        {
            conditions.insert(name.clone(), cond);
        }
    }
    Ok(conditions)
}

fn bind_scalar<'q, T>(
    mut query: sqlx::query::QueryScalar<'q, sqlx::Sqlite, T, sqlx::sqlite::SqliteArguments<'q>>,
    params: &'q [SqlParam],
) -> sqlx::query::QueryScalar<'q, sqlx::Sqlite, T, sqlx::sqlite::SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlParam::Null => query.bind(None::<String>),
            SqlParam::Int(i) => query.bind(*i),
            SqlParam::Real(f) => query.bind(*f),
            SqlParam::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

fn bind_query<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    params: &'q [SqlParam],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlParam::Null => query.bind(None::<String>),
            SqlParam::Int(i) => query.bind(*i),
            SqlParam::Real(f) => query.bind(*f),
            SqlParam::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

async fn execute<'a, E>(executor: E, built: &BuiltQuery) -> Result<u64, ApiError>
where
    E: sqlx::Executor<'a, Database = sqlx::Sqlite>,
{
    bind_query(sqlx::query(&built.sql), &built.params)
        .execute(executor)
        .await
        .map(|result| result.rows_affected())
        .map_err(ApiError::from_sqlx)
}

async fn fetch_json_rows<'a, E>(executor: E, built: &BuiltQuery) -> Result<Vec<Value>, ApiError>
where
    E: sqlx::Executor<'a, Database = sqlx::Sqlite>,
{
    let raw = bind_scalar(sqlx::query_scalar::<_, String>(&built.sql), &built.params)
        .fetch_all(executor)
        .await
        .map_err(ApiError::from_sqlx)?;

    raw.into_iter()
        .map(|row| {
            serde_json::from_str(&row).map_err(|e| {
                tracing::error!(error = %e, "Row projection produced invalid JSON");
                ApiError::storage(&sqlx::Error::RowNotFound)
            })
        })
        .collect()
}

async fn fetch_count<'a, E>(executor: E, built: &BuiltQuery) -> Result<i64, ApiError>
where
    E: sqlx::Executor<'a, Database = sqlx::Sqlite>,
{
    bind_scalar(sqlx::query_scalar::<_, i64>(&built.sql), &built.params)
        .fetch_one(executor)
        .await
        .map_err(ApiError::from_sqlx)
}

async fn fetch_rowids<'a, E>(executor: E, built: &BuiltQuery) -> Result<Vec<i64>, ApiError>
where
    E: sqlx::Executor<'a, Database = sqlx::Sqlite>,
{
    bind_scalar(sqlx::query_scalar::<_, i64>(&built.sql), &built.params)
        .fetch_all(executor)
        .await
        .map_err(ApiError::from_sqlx)
}

async fn execute_returning_rowid<'a, E>(
    executor: E,
    built: &BuiltQuery,
) -> Result<Option<i64>, ApiError>
where
    E: sqlx::Executor<'a, Database = sqlx::Sqlite>,
{
    bind_scalar(sqlx::query_scalar::<_, i64>(&built.sql), &built.params)
        .fetch_optional(executor)
        .await
        .map_err(ApiError::from_sqlx)
}

fn with_content_range(mut response: Response, range: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(range) {
        response.headers_mut().insert("Content-Range", value);
    }
    response
}

fn body_rows(body: Value) -> Result<Vec<Map<String, Value>>, ApiError> {
    match body {
        Value::Object(map) => Ok(vec![map]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                _ => Err(ApiError::filter_syntax("Body rows must be JSON objects")),
            })
            .collect(),
        _ => Err(ApiError::filter_syntax(
            "Body must be a JSON object or an array of objects",
        )),
    }
}

// ==================== HANDLERS ====================

#[axum::debug_handler]
async fn select_handler(
    State(service): State<RestService>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    service.guard_table(&table).await?;

    let mut plan = QueryPlan::parse(&params)?;
    let prefs = Preferences::parse(header_str(&headers, "prefer"));
    let shape = ReturnShape::from_accept(header_str(&headers, "accept"));

    if plan.limit.is_none() && plan.offset.is_none() {
        if let Some((offset, limit)) = header_str(&headers, "range").and_then(parse_range) {
            plan.offset = Some(offset);
            plan.limit = Some(limit);
        }
    }

    let root = service.meta.get_table_info(&table).await?;
    let schema = load_schema(&service, root, &plan.select).await?;
    let root = schema.get(&table)?;
    let rls = select_conditions(&service, &schema, &ctx).await?;

    let total = if prefs.count.is_some() {
        let built = build_count(root, &schema, &plan, &rls)?;
        Some(fetch_count(&service.pool, &built).await?)
    } else {
        None
    };

    if plan.head || prefs.head {
        let response = Json(Value::Null).into_response();
        return Ok(with_content_range(response, &content_range(0, 0, total)));
    }

    let built = build_select(root, &schema, &plan, &rls, None)?;
    let rows = fetch_json_rows(&service.pool, &built).await?;

    let offset = plan.offset.unwrap_or(0);
    let range = content_range(offset, rows.len(), total);
    let body = shape_rows(rows, shape)?;
    Ok(with_content_range(Json(body).into_response(), &range))
}

#[axum::debug_handler]
async fn insert_handler(
    State(service): State<RestService>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    service.guard_table(&table).await?;

    let plan = QueryPlan::parse(&params)?;
    let prefs = Preferences::parse(header_str(&headers, "prefer"));
    let shape = ReturnShape::from_accept(header_str(&headers, "accept"));
    let rows = body_rows(body)?;

    let root = service.meta.get_table_info(&table).await?;
    let schema = load_schema(&service, root, &plan.select).await?;
    let root = schema.get(&table)?;

    let check = service.rls.check_condition(&table, &ctx).await?;
    let upsert = prefs.resolution == Some(Resolution::MergeDuplicates);

    if let Some(on_conflict) = &plan.on_conflict {
        let is_pk = root
            .primary_key()
            .map(|pk| &pk.column_name == on_conflict)
            .unwrap_or(false);
        if !is_pk {
            tracing::warn!(
                on_conflict = %on_conflict,
                "on_conflict is accepted but conflict resolution always targets the primary key"
            );
        }
    }

    let mut tx = service.pool.begin().await.map_err(ApiError::from_sqlx)?;
    let mut rowids = Vec::with_capacity(rows.len());
    for row in &rows {
        let row_upsert = upsert
            && root
                .primary_key()
                .map(|pk| row.contains_key(&pk.column_name))
                .unwrap_or(false);
        let built = build_insert_row(root, row, check.as_deref(), row_upsert)?;
        match execute_returning_rowid(&mut *tx, &built).await? {
            Some(rowid) => rowids.push(rowid),
            // With a CHECK in play an unreturned row means the policy
            // rejected it; the whole request fails.
            None if check.is_some() => return Err(ApiError::rls_violation()),
            None => {}
        }
    }

    if prefs.wants_representation() {
        let select_rls = select_conditions(&service, &schema, &ctx).await?;
        let rep_plan = QueryPlan {
            select: plan.select.clone(),
            ..QueryPlan::default()
        };
        let built = build_select(root, &schema, &rep_plan, &select_rls, Some(&rowids))?;
        let returned = fetch_json_rows(&mut *tx, &built).await?;
        tx.commit().await.map_err(ApiError::from_sqlx)?;
        let body = shape_rows(returned, shape)?;
        Ok((StatusCode::CREATED, Json(body)).into_response())
    } else {
        tx.commit().await.map_err(ApiError::from_sqlx)?;
        Ok(StatusCode::CREATED.into_response())
    }
}

#[axum::debug_handler]
async fn update_handler(
    State(service): State<RestService>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    service.guard_table(&table).await?;

    let plan = QueryPlan::parse(&params)?;
    let prefs = Preferences::parse(header_str(&headers, "prefer"));
    let shape = ReturnShape::from_accept(header_str(&headers, "accept"));
    let patch = match body {
        Value::Object(map) => map,
        _ => return Err(ApiError::filter_syntax("Body must be a JSON object")),
    };

    let root = service.meta.get_table_info(&table).await?;
    let schema = load_schema(&service, root, &plan.select).await?;
    let root = schema.get(&table)?;

    let using = service
        .rls
        .using_condition(&table, PolicyCommand::Update, &ctx)
        .await?;
    let check = service.rls.update_check_condition(&table, &ctx).await?;

    let mut tx = service.pool.begin().await.map_err(ApiError::from_sqlx)?;
    let built = build_update(root, &schema, &patch, &plan, using.as_deref())?;
    let rowids = fetch_rowids(&mut *tx, &built).await?;

    if let Some(check) = &check {
        if !rowids.is_empty() {
            let violations = build_check_violations(root, &rowids, check);
            if fetch_count(&mut *tx, &violations).await? > 0 {
                return Err(ApiError::rls_violation());
            }
        }
    }

    if prefs.wants_representation() {
        let select_rls = select_conditions(&service, &schema, &ctx).await?;
        let rep_plan = QueryPlan {
            select: plan.select.clone(),
            ..QueryPlan::default()
        };
        let built = build_select(root, &schema, &rep_plan, &select_rls, Some(&rowids))?;
        let returned = fetch_json_rows(&mut *tx, &built).await?;
        tx.commit().await.map_err(ApiError::from_sqlx)?;
        let body = shape_rows(returned, shape)?;
        Ok(Json(body).into_response())
    } else {
        tx.commit().await.map_err(ApiError::from_sqlx)?;
        Ok(StatusCode::NO_CONTENT.into_response())
    }
}

#[axum::debug_handler]
async fn delete_handler(
    State(service): State<RestService>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    service.guard_table(&table).await?;

    let plan = QueryPlan::parse(&params)?;
    let prefs = Preferences::parse(header_str(&headers, "prefer"));
    let shape = ReturnShape::from_accept(header_str(&headers, "accept"));

    let root = service.meta.get_table_info(&table).await?;
    let schema = load_schema(&service, root, &plan.select).await?;
    let root = schema.get(&table)?;

    let using = service
        .rls
        .using_condition(&table, PolicyCommand::Delete, &ctx)
        .await?;

    let mut tx = service.pool.begin().await.map_err(ApiError::from_sqlx)?;

    if prefs.wants_representation() {
        // Capture the rows before they disappear.
        let targets = build_rowids(root, &schema, &plan, using.as_deref())?;
        let rowids = fetch_rowids(&mut *tx, &targets).await?;

        let rep_plan = QueryPlan {
            select: plan.select.clone(),
            ..QueryPlan::default()
        };
        let embed_rls = select_conditions(&service, &schema, &ctx).await?;
        let built = build_select(root, &schema, &rep_plan, &embed_rls, Some(&rowids))?;
        let returned = fetch_json_rows(&mut *tx, &built).await?;

        if !rowids.is_empty() {
            let placeholders = vec!["?"; rowids.len()].join(", ");
            let delete = BuiltQuery {
                sql: format!(
                    "DELETE FROM {} WHERE rowid IN ({})",
                    super::builder::quote_ident(&root.name),
                    placeholders
                ),
                params: rowids.iter().map(|id| SqlParam::Int(*id)).collect(),
            };
            execute(&mut *tx, &delete).await?;
        }
        tx.commit().await.map_err(ApiError::from_sqlx)?;

        let body = shape_rows(returned, shape)?;
        Ok(Json(body).into_response())
    } else {
        let built = build_delete(root, &schema, &plan, using.as_deref())?;
        fetch_rowids(&mut *tx, &built).await?;
        tx.commit().await.map_err(ApiError::from_sqlx)?;
        Ok(StatusCode::NO_CONTENT.into_response())
    }
}
