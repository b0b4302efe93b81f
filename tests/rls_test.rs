use serde_json::json;
use sqlx::SqlitePool;

use sblite::features::auth::jwt;
use sblite::features::auth::models::User;

mod common;

async fn create_todos_table(app: &axum::Router, auth: &str) {
    let (status, _, body) = common::request(
        app,
        "POST",
        "/admin/v1/tables",
        &[("authorization", auth)],
        Some(json!({
            "name": "todos",
            "columns": [
                {"name": "id", "type": "uuid", "primary": true},
                {"name": "user_id", "type": "text"},
                {"name": "body", "type": "text"}
            ]
        })),
    )
    .await;
    assert_eq!(status, 201, "{}", body);
}

async fn enable_owner_policy(app: &axum::Router, auth: &str) {
    let (status, _, _) = common::request(
        app,
        "PUT",
        "/admin/v1/tables/todos/rls",
        &[("authorization", auth)],
        Some(json!({"enabled": true})),
    )
    .await;
    assert_eq!(status, 204);

    let (status, _, body) = common::request(
        app,
        "POST",
        "/admin/v1/tables/todos/policies",
        &[("authorization", auth)],
        Some(json!({
            "policy_name": "owner_only",
            "command": "ALL",
            "using_expr": "user_id = auth.uid()"
        })),
    )
    .await;
    assert_eq!(status, 201, "{}", body);
}

fn bearer_for(user: &User, config: &sblite::config::Config) -> String {
    let token = jwt::create_access_token(user, uuid::Uuid::new_v4(), config)
        .expect("token signing failed");
    format!("Bearer {}", token)
}

#[sqlx::test]
async fn owner_policy_gates_insert_and_select(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let service_auth = format!("Bearer {}", common::service_key(&services.config));

    create_todos_table(&app, &service_auth).await;
    enable_owner_policy(&app, &service_auth).await;

    let u1 = services
        .auth_service
        .create_user("u1@x.io", "password1", json!({}))
        .await
        .unwrap();
    let u2 = services
        .auth_service
        .create_user("u2@x.io", "password1", json!({}))
        .await
        .unwrap();
    let u1_auth = bearer_for(&u1, &services.config);

    // Own row passes the CHECK mirror of USING.
    let (status, _, body) = common::request(
        &app,
        "POST",
        "/rest/v1/todos",
        &[("authorization", &u1_auth)],
        Some(json!({
            "id": "00000000-0000-0000-0000-000000000001",
            "user_id": u1.id.to_string(),
            "body": "a"
        })),
    )
    .await;
    assert_eq!(status, 201, "{}", body);

    // A row claiming another owner is rejected for the whole request.
    let (status, _, body) = common::request(
        &app,
        "POST",
        "/rest/v1/todos",
        &[("authorization", &u1_auth)],
        Some(json!({
            "id": "00000000-0000-0000-0000-000000000002",
            "user_id": u2.id.to_string(),
            "body": "b"
        })),
    )
    .await;
    assert_eq!(status, 403);
    assert_eq!(body["error"]["code"], "RLSViolation");

    // Service role bypasses the CHECK and seeds u2's row.
    let (status, _, _) = common::request(
        &app,
        "POST",
        "/rest/v1/todos",
        &[("authorization", &service_auth)],
        Some(json!({
            "id": "00000000-0000-0000-0000-000000000002",
            "user_id": u2.id.to_string(),
            "body": "b"
        })),
    )
    .await;
    assert_eq!(status, 201);

    // u1 sees exactly their row.
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/todos?select=body,user_id",
        &[("authorization", &u1_auth)],
        None,
    )
    .await;
    assert_eq!(status, 200);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["body"], "a");
    assert_eq!(rows[0]["user_id"], u1.id.to_string());

    // Service role sees the unfiltered set.
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/todos?select=body&order=body",
        &[("authorization", &service_auth)],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[sqlx::test]
async fn update_and_delete_shrink_silently(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let service_auth = format!("Bearer {}", common::service_key(&services.config));

    create_todos_table(&app, &service_auth).await;
    enable_owner_policy(&app, &service_auth).await;

    let u1 = services
        .auth_service
        .create_user("u1@x.io", "password1", json!({}))
        .await
        .unwrap();
    let u1_auth = bearer_for(&u1, &services.config);

    common::request(
        &app,
        "POST",
        "/rest/v1/todos",
        &[("authorization", &service_auth)],
        Some(json!([
            {"id": "00000000-0000-0000-0000-000000000001", "user_id": u1.id.to_string(), "body": "mine"},
            {"id": "00000000-0000-0000-0000-000000000002", "user_id": "someone-else", "body": "theirs"}
        ])),
    )
    .await;

    // An unfiltered PATCH touches only policy-visible rows; no error for
    // the rows outside the policy.
    let (status, _, body) = common::request(
        &app,
        "PATCH",
        "/rest/v1/todos",
        &[("authorization", &u1_auth), ("prefer", "return=representation")],
        Some(json!({"body": "updated"})),
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["body"], "updated");

    let (status, _, _) = common::request(
        &app,
        "DELETE",
        "/rest/v1/todos",
        &[("authorization", &u1_auth)],
        None,
    )
    .await;
    assert_eq!(status, 204);

    // The other row survived.
    let (_, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/todos?select=body",
        &[("authorization", &service_auth)],
        None,
    )
    .await;
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["body"], "theirs");
}

#[sqlx::test]
async fn embedded_relations_respect_their_own_policies(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let service_auth = format!("Bearer {}", common::service_key(&services.config));

    let (status, _, _) = common::request(
        &app,
        "POST",
        "/admin/v1/tables",
        &[("authorization", &service_auth)],
        Some(json!({
            "name": "lists",
            "columns": [{"name": "id", "type": "integer", "primary": true}]
        })),
    )
    .await;
    assert_eq!(status, 201);

    let (status, _, _) = common::request(
        &app,
        "POST",
        "/admin/v1/tables",
        &[("authorization", &service_auth)],
        Some(json!({
            "name": "todos",
            "columns": [
                {"name": "id", "type": "uuid", "primary": true},
                {"name": "user_id", "type": "text"},
                {"name": "body", "type": "text"},
                {"name": "list_id", "type": "integer",
                 "references": {"table": "lists", "column": "id"}}
            ]
        })),
    )
    .await;
    assert_eq!(status, 201);
    enable_owner_policy(&app, &service_auth).await;

    let u1 = services
        .auth_service
        .create_user("u1@x.io", "password1", json!({}))
        .await
        .unwrap();
    let u1_auth = bearer_for(&u1, &services.config);

    common::request(
        &app,
        "POST",
        "/rest/v1/lists",
        &[("authorization", &service_auth)],
        Some(json!({"id": 1})),
    )
    .await;
    common::request(
        &app,
        "POST",
        "/rest/v1/todos",
        &[("authorization", &service_auth)],
        Some(json!([
            {"id": "00000000-0000-0000-0000-000000000001", "user_id": u1.id.to_string(), "body": "mine", "list_id": 1},
            {"id": "00000000-0000-0000-0000-000000000002", "user_id": "someone-else", "body": "theirs", "list_id": 1}
        ])),
    )
    .await;

    // The embed carries only the rows u1's policy exposes.
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/lists?select=id,todos(body)",
        &[("authorization", &u1_auth)],
        None,
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    let embedded = body[0]["todos"].as_array().unwrap();
    assert_eq!(embedded.len(), 1);
    assert_eq!(embedded[0]["body"], "mine");

    // Service role sees both through the same embed.
    let (_, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/lists?select=id,todos(body)",
        &[("authorization", &service_auth)],
        None,
    )
    .await;
    assert_eq!(body[0]["todos"].as_array().unwrap().len(), 2);
}

#[sqlx::test]
async fn rls_disabled_matches_storage_results(pool: SqlitePool) {
    let services = common::setup_services(pool.clone()).await;
    let app = common::build_app(&services);
    let service_auth = format!("Bearer {}", common::service_key(&services.config));

    create_todos_table(&app, &service_auth).await;
    common::request(
        &app,
        "POST",
        "/rest/v1/todos",
        &[("authorization", &service_auth)],
        Some(json!([
            {"id": "00000000-0000-0000-0000-000000000001", "user_id": "a", "body": "x"},
            {"id": "00000000-0000-0000-0000-000000000002", "user_id": "b", "body": "y"}
        ])),
    )
    .await;

    // RLS disabled: anonymous REST results equal the storage-engine set.
    let anon = common::anon_key(&services.config);
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/todos?select=body",
        &[("apikey", anon.as_str())],
        None,
    )
    .await;
    assert_eq!(status, 200);
    let engine_count: i64 = sqlx::query_scalar("SELECT count(*) FROM todos")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(body.as_array().unwrap().len() as i64, engine_count);
}

#[sqlx::test]
async fn enabled_rls_without_policy_denies_non_bypass(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let service_auth = format!("Bearer {}", common::service_key(&services.config));

    create_todos_table(&app, &service_auth).await;
    common::request(
        &app,
        "POST",
        "/rest/v1/todos",
        &[("authorization", &service_auth)],
        Some(json!({"id": "00000000-0000-0000-0000-000000000001", "user_id": "a", "body": "x"})),
    )
    .await;

    let (status, _, _) = common::request(
        &app,
        "PUT",
        "/admin/v1/tables/todos/rls",
        &[("authorization", &service_auth)],
        Some(json!({"enabled": true})),
    )
    .await;
    assert_eq!(status, 204);

    // No policy: anon sees nothing, inserts are rejected.
    let anon = common::anon_key(&services.config);
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/todos",
        &[("apikey", anon.as_str())],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body.as_array().unwrap().len(), 0);

    let (status, _, _) = common::request(
        &app,
        "POST",
        "/rest/v1/todos",
        &[("apikey", anon.as_str())],
        Some(json!({"id": "00000000-0000-0000-0000-000000000003", "user_id": "c", "body": "z"})),
    )
    .await;
    assert_eq!(status, 403);

    // Service role still sees everything.
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/todos",
        &[("authorization", &service_auth)],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body.as_array().unwrap().len(), 1);
}
