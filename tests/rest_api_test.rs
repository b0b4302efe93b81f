use serde_json::{json, Value};
use sqlx::SqlitePool;

mod common;

async fn create_items_table(app: &axum::Router, key: &str) {
    let (status, _, body) = common::request(
        app,
        "POST",
        "/admin/v1/tables",
        &[("authorization", &format!("Bearer {}", key))],
        Some(json!({
            "name": "items",
            "columns": [
                {"name": "id", "type": "uuid", "primary": true},
                {"name": "qty", "type": "integer"},
                {"name": "label", "type": "text"},
                {"name": "active", "type": "boolean"},
                {"name": "attrs", "type": "jsonb"}
            ]
        })),
    )
    .await;
    assert_eq!(status, 201, "create table failed: {}", body);
}

#[sqlx::test]
async fn admin_surface_requires_service_role(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);

    let (status, _, body) = common::request(&app, "GET", "/admin/v1/tables", &[], None).await;
    assert_eq!(status, 403);
    assert_eq!(body["error"]["code"], "Forbidden");

    let anon = common::anon_key(&services.config);
    let (status, _, _) = common::request(
        &app,
        "GET",
        "/admin/v1/tables",
        &[("apikey", anon.as_str())],
        None,
    )
    .await;
    assert_eq!(status, 403);

    let key = common::service_key(&services.config);
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/admin/v1/tables",
        &[("apikey", key.as_str())],
        None,
    )
    .await;
    assert_eq!(status, 200, "{}", body);
}

#[sqlx::test]
async fn insert_validates_registered_types(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let key = common::service_key(&services.config);
    create_items_table(&app, &key).await;

    let auth = format!("Bearer {}", key);

    // qty must be an integer.
    let (status, _, body) = common::request(
        &app,
        "POST",
        "/rest/v1/items",
        &[("authorization", &auth)],
        Some(json!({"id": "00000000-0000-0000-0000-000000000001", "qty": "three"})),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "TypeMismatch");
    assert_eq!(body["error"]["details"]["column"], "qty");
    assert_eq!(body["error"]["details"]["expected"], "integer");

    let (status, _, _) = common::request(
        &app,
        "POST",
        "/rest/v1/items",
        &[("authorization", &auth)],
        Some(json!({"id": "00000000-0000-0000-0000-000000000001", "qty": 3})),
    )
    .await;
    assert_eq!(status, 201);
}

#[sqlx::test]
async fn select_filters_order_and_shapes_json(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let key = common::service_key(&services.config);
    create_items_table(&app, &key).await;
    let auth = format!("Bearer {}", key);

    let rows = json!([
        {"id": "00000000-0000-0000-0000-000000000001", "qty": 5, "label": "alpha", "active": true, "attrs": {"tag": "a"}},
        {"id": "00000000-0000-0000-0000-000000000002", "qty": 2, "label": "beta", "active": false, "attrs": {"tag": "b"}},
        {"id": "00000000-0000-0000-0000-000000000003", "qty": 9, "label": "gamma", "active": true, "attrs": {"tag": "c"}}
    ]);
    let (status, _, _) = common::request(
        &app,
        "POST",
        "/rest/v1/items",
        &[("authorization", &auth)],
        Some(rows),
    )
    .await;
    assert_eq!(status, 201);

    // Typed integer comparison over URL strings.
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/items?qty=gte.5&order=qty.desc&select=label,qty,active,attrs",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["label"], "gamma");
    assert_eq!(items[1]["label"], "alpha");
    // Booleans and jsonb nest as JSON, not as storage scalars.
    assert_eq!(items[0]["active"], Value::Bool(true));
    assert_eq!(items[0]["attrs"]["tag"], "c");

    // or= disjunction.
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/items?or=(label.eq.alpha,label.eq.beta)&select=label&order=label",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 200);
    let labels: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["label"].as_str().unwrap())
        .collect();
    assert_eq!(labels, vec!["alpha", "beta"]);

    // not. negation.
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/items?active=not.is.true&select=label",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["label"], "beta");

    // in list.
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/items?qty=in.(2,9)&select=label&order=qty",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body.as_array().unwrap().len(), 2);
    assert_eq!(body[0]["label"], "beta");

    // JSON path extraction.
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/items?select=label,attrs->>tag&label=eq.alpha",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body[0]["tag"], "a");
}

#[sqlx::test]
async fn count_head_and_content_range(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let key = common::service_key(&services.config);
    let auth = format!("Bearer {}", key);

    let (status, _, _) = common::request(
        &app,
        "POST",
        "/admin/v1/tables",
        &[("authorization", &auth)],
        Some(json!({
            "name": "characters",
            "columns": [
                {"name": "id", "type": "integer", "primary": true},
                {"name": "name", "type": "text"}
            ]
        })),
    )
    .await;
    assert_eq!(status, 201);

    let rows: Vec<Value> = (1..=5)
        .map(|i| json!({"id": i, "name": format!("c{}", i)}))
        .collect();
    common::request(
        &app,
        "POST",
        "/rest/v1/characters",
        &[("authorization", &auth)],
        Some(Value::Array(rows)),
    )
    .await;

    // head=true: count only, no body.
    let (status, headers, body) = common::request(
        &app,
        "GET",
        "/rest/v1/characters?select=*",
        &[("authorization", &auth), ("prefer", "count=exact, head=true")],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, Value::Null);
    assert_eq!(headers.get("content-range").unwrap(), "*/5");

    // Paged read carries start-end/total.
    let (status, headers, body) = common::request(
        &app,
        "GET",
        "/rest/v1/characters?select=name&order=id&limit=2&offset=2",
        &[("authorization", &auth), ("prefer", "count=exact")],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(headers.get("content-range").unwrap(), "2-3/5");
    assert_eq!(body.as_array().unwrap().len(), 2);
    assert_eq!(body[0]["name"], "c3");

    // Range header is the alternative pagination form.
    let (status, headers, _) = common::request(
        &app,
        "GET",
        "/rest/v1/characters?select=name&order=id",
        &[("authorization", &auth), ("range", "0-1")],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(headers.get("content-range").unwrap(), "0-1/*");
}

#[sqlx::test]
async fn single_and_maybe_single_modifiers(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let key = common::service_key(&services.config);
    create_items_table(&app, &key).await;
    let auth = format!("Bearer {}", key);

    common::request(
        &app,
        "POST",
        "/rest/v1/items",
        &[("authorization", &auth)],
        Some(json!({"id": "00000000-0000-0000-0000-000000000001", "qty": 1, "label": "only"})),
    )
    .await;

    // single: exactly one row comes back as a bare object.
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/items?label=eq.only&select=label",
        &[
            ("authorization", &auth),
            ("accept", "application/vnd.pgrst.object+json"),
        ],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["label"], "only");

    // single with zero rows errors.
    let (status, _, _) = common::request(
        &app,
        "GET",
        "/rest/v1/items?label=eq.ghost",
        &[
            ("authorization", &auth),
            ("accept", "application/vnd.pgrst.object+json"),
        ],
        None,
    )
    .await;
    assert_eq!(status, 406);

    // maybeSingle with zero rows is null.
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/items?label=eq.ghost",
        &[
            ("authorization", &auth),
            ("accept", "application/vnd.pgrst.object+json; nullable=true"),
        ],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, Value::Null);
}

#[sqlx::test]
async fn many_to_one_embed_returns_object(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let key = common::service_key(&services.config);
    let auth = format!("Bearer {}", key);

    common::request(
        &app,
        "POST",
        "/admin/v1/tables",
        &[("authorization", &auth)],
        Some(json!({
            "name": "countries",
            "columns": [
                {"name": "id", "type": "integer", "primary": true},
                {"name": "name", "type": "text"}
            ]
        })),
    )
    .await;
    common::request(
        &app,
        "POST",
        "/admin/v1/tables",
        &[("authorization", &auth)],
        Some(json!({
            "name": "cities",
            "columns": [
                {"name": "id", "type": "integer", "primary": true},
                {"name": "name", "type": "text"},
                {"name": "country_id", "type": "integer",
                 "references": {"table": "countries", "column": "id"}}
            ]
        })),
    )
    .await;

    common::request(
        &app,
        "POST",
        "/rest/v1/countries",
        &[("authorization", &auth)],
        Some(json!([
            {"id": 1, "name": "United States"},
            {"id": 2, "name": "Norway"}
        ])),
    )
    .await;
    common::request(
        &app,
        "POST",
        "/rest/v1/cities",
        &[("authorization", &auth)],
        Some(json!([
            {"id": 1, "name": "New York", "country_id": 1},
            {"id": 2, "name": "Chicago", "country_id": 1},
            {"id": 3, "name": "Oslo", "country_id": 2}
        ])),
    )
    .await;

    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/cities?select=name,country:country_id(name)&country_id=eq.1",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert_eq!(row["country"]["name"], "United States");
        assert!(row["country"].is_object());
    }

    // One-to-many embeds aggregate arrays; !inner drops childless parents.
    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/countries?select=name,cities(name)&order=id",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body[0]["cities"].as_array().unwrap().len(), 2);
    assert_eq!(body[1]["cities"].as_array().unwrap().len(), 1);
}

#[sqlx::test]
async fn reserved_tables_are_not_routable(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let key = common::service_key(&services.config);
    let auth = format!("Bearer {}", key);

    // Even service role gets an ordinary not-found.
    for table in ["auth_users", "storage_objects", "_columns", "sqlite_master"] {
        let uri = format!("/rest/v1/{}", table);
        let (status, _, body) =
            common::request(&app, "GET", &uri, &[("authorization", &auth)], None).await;
        assert_eq!(status, 404, "GET {}", table);
        assert_eq!(body["error"]["code"], "TableNotFound");

        let (status, _, _) = common::request(
            &app,
            "POST",
            &uri,
            &[("authorization", &auth)],
            Some(json!({"x": 1})),
        )
        .await;
        assert_eq!(status, 404, "POST {}", table);

        let (status, _, _) = common::request(
            &app,
            "PATCH",
            &uri,
            &[("authorization", &auth)],
            Some(json!({"x": 1})),
        )
        .await;
        assert_eq!(status, 404, "PATCH {}", table);

        let (status, _, _) =
            common::request(&app, "DELETE", &uri, &[("authorization", &auth)], None).await;
        assert_eq!(status, 404, "DELETE {}", table);
    }
}

#[sqlx::test]
async fn identifiers_with_spaces_round_trip(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let key = common::service_key(&services.config);
    let auth = format!("Bearer {}", key);

    let (status, _, body) = common::request(
        &app,
        "POST",
        "/admin/v1/tables",
        &[("authorization", &auth)],
        Some(json!({
            "name": "my table",
            "columns": [
                {"name": "my column", "type": "text"},
                {"name": "another column", "type": "integer"}
            ]
        })),
    )
    .await;
    assert_eq!(status, 201, "{}", body);

    let (status, _, body) = common::request(
        &app,
        "POST",
        "/rest/v1/my%20table",
        &[("authorization", &auth)],
        Some(json!({"my column": "x", "another column": 42})),
    )
    .await;
    assert_eq!(status, 201, "{}", body);

    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/my%20table?my%20column=eq.x",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body[0]["my column"], "x");
    assert_eq!(body[0]["another column"], 42);
}

#[sqlx::test]
async fn upsert_merges_on_primary_key(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let key = common::service_key(&services.config);
    create_items_table(&app, &key).await;
    let auth = format!("Bearer {}", key);

    common::request(
        &app,
        "POST",
        "/rest/v1/items",
        &[("authorization", &auth)],
        Some(json!({"id": "00000000-0000-0000-0000-000000000001", "qty": 1, "label": "v1"})),
    )
    .await;

    let (status, _, body) = common::request(
        &app,
        "POST",
        "/rest/v1/items",
        &[
            ("authorization", &auth),
            ("prefer", "resolution=merge-duplicates,return=representation"),
        ],
        Some(json!({"id": "00000000-0000-0000-0000-000000000001", "qty": 2, "label": "v2"})),
    )
    .await;
    assert_eq!(status, 201, "{}", body);
    assert_eq!(body[0]["label"], "v2");

    let (_, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/items?select=qty,label",
        &[("authorization", &auth)],
        None,
    )
    .await;
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["qty"], 2);
}

#[sqlx::test]
async fn patch_and_delete_respect_filters(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let key = common::service_key(&services.config);
    create_items_table(&app, &key).await;
    let auth = format!("Bearer {}", key);

    common::request(
        &app,
        "POST",
        "/rest/v1/items",
        &[("authorization", &auth)],
        Some(json!([
            {"id": "00000000-0000-0000-0000-000000000001", "qty": 1, "label": "keep"},
            {"id": "00000000-0000-0000-0000-000000000002", "qty": 2, "label": "touch"}
        ])),
    )
    .await;

    let (status, _, body) = common::request(
        &app,
        "PATCH",
        "/rest/v1/items?label=eq.touch",
        &[("authorization", &auth), ("prefer", "return=representation")],
        Some(json!({"qty": 20})),
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["qty"], 20);

    let (status, _, _) = common::request(
        &app,
        "DELETE",
        "/rest/v1/items?label=eq.touch",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 204);

    let (_, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/items?select=label",
        &[("authorization", &auth)],
        None,
    )
    .await;
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["label"], "keep");
}

#[sqlx::test]
async fn unknown_column_and_operator_errors(pool: SqlitePool) {
    let services = common::setup_services(pool).await;
    let app = common::build_app(&services);
    let key = common::service_key(&services.config);
    create_items_table(&app, &key).await;
    let auth = format!("Bearer {}", key);

    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/items?ghost=eq.1",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "ColumnUnknown");

    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/items?qty=superset.1",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "UnknownOperator");

    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/items?select=ghost",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "ColumnUnknown");

    let (status, _, body) = common::request(
        &app,
        "GET",
        "/rest/v1/nope",
        &[("authorization", &auth)],
        None,
    )
    .await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "TableNotFound");
}
