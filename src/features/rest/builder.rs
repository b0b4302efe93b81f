use std::collections::HashMap;

use serde_json::{Map, Value};

use super::error::ApiError;
use super::parser::{
    EmbedSelect, FilterCond, FilterNode, FilterOp, FtsDialect, IsValue, JsonStep, LogicOp,
    OrderTerm, QueryPlan, SelectItem,
};
use crate::features::meta::validate::validate_value;
use crate::features::meta::{ColumnMeta, PgType, RelKind, Relationship, TableInfo};

/// One bound statement parameter. Everything user-supplied travels through
/// here; identifiers are the only strings interpolated, and those are
/// double-quoted.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

#[derive(Debug)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Tables touched by one request: the root plus every embedded relation.
#[derive(Debug, Default)]
pub struct SchemaSet {
    pub tables: HashMap<String, TableInfo>,
}

impl SchemaSet {
    pub fn get(&self, name: &str) -> Result<&TableInfo, ApiError> {
        self.tables
            .get(name)
            .ok_or_else(|| ApiError::table_not_found(name))
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Resolve an embed against the parent's relationship edges. The target
/// may name the related table or the FK column; `!hint` disambiguates
/// when several foreign keys reach the same table.
pub fn resolve_relationship<'a>(
    parent: &'a TableInfo,
    embed: &EmbedSelect,
) -> Result<&'a Relationship, ApiError> {
    let candidates: Vec<&Relationship> = parent
        .relationships
        .iter()
        .filter(|r| {
            if let Some(hint) = &embed.fk_hint {
                (r.name == embed.target || r.foreign_table == embed.target)
                    && (&r.local_column == hint || &r.foreign_column == hint)
            } else {
                r.name == embed.target || r.local_column == embed.target
            }
        })
        .collect();

    match candidates.len() {
        1 => Ok(candidates[0]),
        0 => Err(ApiError::select_syntax(format!(
            "Could not find a relationship for '{}'",
            embed.target
        ))),
        _ => Err(ApiError::select_syntax(format!(
            "Embed '{}' is ambiguous; disambiguate with '!fk_column'",
            embed.target
        ))),
    }
}

/// Per-table RLS SELECT conditions; embedded relations are filtered by
/// their own table's policies, not just the root's.
pub type RlsConditions = HashMap<String, String>;

struct Builder<'a> {
    schema: &'a SchemaSet,
    rls: &'a RlsConditions,
    params: Vec<SqlParam>,
    alias_seq: usize,
}

impl<'a> Builder<'a> {
    fn new(schema: &'a SchemaSet, rls: &'a RlsConditions) -> Self {
        Self {
            schema,
            rls,
            params: Vec::new(),
            alias_seq: 0,
        }
    }

    fn next_alias(&mut self) -> String {
        let alias = format!("_e{}", self.alias_seq);
        self.alias_seq += 1;
        alias
    }

    // ==================== PROJECTION ====================

    /// Render the `json_object(...)` projection for one table level and
    /// collect the EXISTS predicates contributed by `!inner` embeds.
    fn projection(
        &mut self,
        info: &TableInfo,
        alias: &str,
        items: &[SelectItem],
    ) -> Result<(String, Vec<String>), ApiError> {
        let star = [SelectItem::Star];
        let items = if items.is_empty() { &star[..] } else { items };

        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut exists = Vec::new();

        for item in items {
            match item {
                SelectItem::Star => {
                    for col in &info.columns {
                        pairs.push((col.column_name.clone(), self.column_value_expr(alias, col)));
                    }
                }
                SelectItem::Column(select) => {
                    let meta = info
                        .column(&select.name)
                        .ok_or_else(|| ApiError::column_unknown(&select.name))?;
                    let expr = if select.json_path.is_empty() {
                        self.column_value_expr(alias, meta)
                    } else {
                        json_path_projection(alias, &select.name, &select.json_path)
                    };
                    pairs.push((select.output_key().to_string(), expr));
                }
                SelectItem::Embed(embed) => {
                    let (expr, embed_exists) = self.embed_expr(info, alias, embed)?;
                    pairs.push((embed.key.clone(), expr));
                    exists.extend(embed_exists);
                }
            }
        }

        let body = pairs
            .iter()
            .map(|(key, expr)| format!("{}, {}", sql_str(key), expr))
            .collect::<Vec<_>>()
            .join(", ");
        Ok((format!("json_object({})", body), exists))
    }

    /// Value expression for a plain column, shaped so booleans and jsonb
    /// nest as JSON rather than as numbers/strings.
    fn column_value_expr(&self, alias: &str, col: &ColumnMeta) -> String {
        let reference = format!("{}.{}", quote_ident(alias), quote_ident(&col.column_name));
        match col.pg_type {
            PgType::Boolean => format!(
                "json(CASE WHEN {r} IS NULL THEN NULL WHEN {r} THEN 'true' ELSE 'false' END)",
                r = reference
            ),
            PgType::Jsonb => format!("json({})", reference),
            _ => reference,
        }
    }

    fn embed_expr(
        &mut self,
        parent: &TableInfo,
        parent_alias: &str,
        embed: &EmbedSelect,
    ) -> Result<(String, Vec<String>), ApiError> {
        let rel = resolve_relationship(parent, embed)?.clone();
        let child = self.schema.get(&rel.foreign_table)?;
        let alias = self.next_alias();

        let (child_projection, child_exists) = self.projection(child, &alias, &embed.items)?;

        let mut conditions = vec![format!(
            "{}.{} = {}.{}",
            quote_ident(&alias),
            quote_ident(&rel.foreign_column),
            quote_ident(parent_alias),
            quote_ident(&rel.local_column)
        )];
        if let Some(cond) = self.rls.get(&rel.foreign_table) {
            conditions.push(format!("({})", cond));
        }
        conditions.extend(child_exists);
        let where_clause = conditions.join(" AND ");

        let from = format!("{} AS {}", quote_ident(&rel.foreign_table), quote_ident(&alias));

        // A scalar subquery loses the JSON subtype, so the result is
        // re-parsed with json() before nesting into the parent object.
        let expr = match rel.kind {
            RelKind::ManyToOne => format!(
                "json((SELECT {} FROM {} WHERE {} LIMIT 1))",
                child_projection, from, where_clause
            ),
            RelKind::OneToMany => format!(
                "json(coalesce((SELECT json_group_array({}) FROM {} WHERE {}), '[]'))",
                child_projection, from, where_clause
            ),
        };

        let mut exists = Vec::new();
        if embed.inner {
            let exists_alias = self.next_alias();
            let mut inner_where = format!(
                "{}.{} = {}.{}",
                quote_ident(&exists_alias),
                quote_ident(&rel.foreign_column),
                quote_ident(parent_alias),
                quote_ident(&rel.local_column)
            );
            if let Some(cond) = self.rls.get(&rel.foreign_table) {
                inner_where.push_str(&format!(" AND ({})", cond));
            }
            exists.push(format!(
                "EXISTS (SELECT 1 FROM {} AS {} WHERE {})",
                quote_ident(&rel.foreign_table),
                quote_ident(&exists_alias),
                inner_where
            ));
        }

        Ok((expr, exists))
    }

    // ==================== FILTERS ====================

    fn filter_sql(
        &mut self,
        info: &TableInfo,
        alias: &str,
        node: &FilterNode,
    ) -> Result<String, ApiError> {
        match node {
            FilterNode::Group {
                op,
                children,
                negated,
            } => {
                let joiner = match op {
                    LogicOp::And => " AND ",
                    LogicOp::Or => " OR ",
                };
                let parts: Vec<String> = children
                    .iter()
                    .map(|child| self.filter_sql(info, alias, child))
                    .collect::<Result<_, _>>()?;
                let body = format!("({})", parts.join(joiner));
                Ok(if *negated { format!("NOT {}", body) } else { body })
            }
            FilterNode::Cond(cond) => self.condition_sql(info, alias, cond),
        }
    }

    fn condition_sql(
        &mut self,
        info: &TableInfo,
        alias: &str,
        cond: &FilterCond,
    ) -> Result<String, ApiError> {
        let meta = info
            .column(&cond.column)
            .ok_or_else(|| ApiError::column_unknown(&cond.column))?;

        let lhs = if cond.json_path.is_empty() {
            format!("{}.{}", quote_ident(alias), quote_ident(&cond.column))
        } else {
            json_path_raw(alias, &cond.column, &cond.json_path)
        };
        // JSON-path extraction yields dynamic values; the registered type
        // only applies to the whole column.
        let coerce_meta = if cond.json_path.is_empty() {
            Some(meta)
        } else {
            None
        };

        let rendered = match &cond.op {
            FilterOp::Eq(v) => self.comparison(&lhs, "=", coerce_meta, v),
            FilterOp::Neq(v) => self.comparison(&lhs, "<>", coerce_meta, v),
            FilterOp::Gt(v) => self.comparison(&lhs, ">", coerce_meta, v),
            FilterOp::Gte(v) => self.comparison(&lhs, ">=", coerce_meta, v),
            FilterOp::Lt(v) => self.comparison(&lhs, "<", coerce_meta, v),
            FilterOp::Lte(v) => self.comparison(&lhs, "<=", coerce_meta, v),
            FilterOp::Like(pattern) => {
                self.params
                    .push(SqlParam::Text(pattern.replace('*', "%")));
                format!("{} LIKE ?", lhs)
            }
            FilterOp::Ilike(pattern) => {
                self.params
                    .push(SqlParam::Text(pattern.replace('*', "%")));
                format!("lower({}) LIKE lower(?)", lhs)
            }
            FilterOp::Is(value) => {
                let suffix = match value {
                    IsValue::Null => "IS NULL",
                    IsValue::NotNull => "IS NOT NULL",
                    IsValue::True => "IS TRUE",
                    IsValue::False => "IS FALSE",
                };
                format!("{} {}", lhs, suffix)
            }
            FilterOp::In(values) => {
                if values.is_empty() {
                    "1 = 0".to_string()
                } else {
                    for value in values {
                        let param = coerce_filter_value(coerce_meta, value);
                        self.params.push(param);
                    }
                    let placeholders = vec!["?"; values.len()].join(", ");
                    format!("{} IN ({})", lhs, placeholders)
                }
            }
            FilterOp::Fts { dialect, query } => {
                let Some(fts) = &info.fts else {
                    return Err(ApiError::filter_syntax(format!(
                        "No full-text index registered for table '{}'",
                        info.name
                    )));
                };
                self.params
                    .push(SqlParam::Text(translate_fts_query(*dialect, query)));
                format!(
                    "{}.rowid IN (SELECT rowid FROM {} WHERE {} MATCH ?)",
                    quote_ident(alias),
                    quote_ident(&fts.index_table),
                    quote_ident(&fts.index_table)
                )
            }
        };

        Ok(if cond.negated {
            format!("NOT ({})", rendered)
        } else {
            rendered
        })
    }

    fn comparison(
        &mut self,
        lhs: &str,
        op: &str,
        meta: Option<&ColumnMeta>,
        raw: &str,
    ) -> String {
        self.params.push(coerce_filter_value(meta, raw));
        format!("{} {} ?", lhs, op)
    }

    fn order_sql(&self, info: &TableInfo, alias: &str, terms: &[OrderTerm]) -> Result<String, ApiError> {
        let mut rendered = Vec::with_capacity(terms.len());
        for term in terms {
            if info.column(&term.column).is_none() {
                return Err(ApiError::column_unknown(&term.column));
            }
            let mut part = format!(
                "{}.{} {}",
                quote_ident(alias),
                quote_ident(&term.column),
                if term.descending { "DESC" } else { "ASC" }
            );
            match term.nulls_first {
                Some(true) => part.push_str(" NULLS FIRST"),
                Some(false) => part.push_str(" NULLS LAST"),
                None => {}
            }
            rendered.push(part);
        }
        Ok(rendered.join(", "))
    }
}

/// `col->a->>b` for the projection: the final value stays JSON unless the
/// last hop is `->>`.
fn json_path_projection(alias: &str, column: &str, path: &[JsonStep]) -> String {
    let expr = json_path_raw(alias, column, path);
    if path.last().map(|s| s.as_text).unwrap_or(false) {
        expr
    } else {
        format!("json({})", expr)
    }
}

fn json_path_raw(alias: &str, column: &str, path: &[JsonStep]) -> String {
    let mut expr = format!("{}.{}", quote_ident(alias), quote_ident(column));
    for step in path {
        let op = if step.as_text { "->>" } else { "->" };
        expr = format!("{} {} {}", expr, op, sql_str(&step.key));
    }
    expr
}

/// Bind a URL filter value with the column's registered type so TEXT
/// never compares against INTEGER storage.
fn coerce_filter_value(meta: Option<&ColumnMeta>, raw: &str) -> SqlParam {
    match meta.map(|m| m.pg_type) {
        Some(PgType::Integer) => raw
            .parse::<i64>()
            .map(SqlParam::Int)
            .unwrap_or_else(|_| SqlParam::Text(raw.to_string())),
        Some(PgType::Numeric) => {
            if let Ok(i) = raw.parse::<i64>() {
                SqlParam::Int(i)
            } else if let Ok(f) = raw.parse::<f64>() {
                SqlParam::Real(f)
            } else {
                SqlParam::Text(raw.to_string())
            }
        }
        Some(PgType::Boolean) => match raw {
            "true" | "1" => SqlParam::Int(1),
            "false" | "0" => SqlParam::Int(0),
            _ => SqlParam::Text(raw.to_string()),
        },
        Some(_) => SqlParam::Text(raw.to_string()),
        None => {
            if let Ok(i) = raw.parse::<i64>() {
                SqlParam::Int(i)
            } else if let Ok(f) = raw.parse::<f64>() {
                SqlParam::Real(f)
            } else {
                SqlParam::Text(raw.to_string())
            }
        }
    }
}

/// Translate a filter FTS input into the engine's MATCH syntax.
pub fn translate_fts_query(dialect: FtsDialect, input: &str) -> String {
    match dialect {
        FtsDialect::Native => input.to_string(),
        FtsDialect::Plain => input
            .split_whitespace()
            .map(quote_fts_term)
            .collect::<Vec<_>>()
            .join(" AND "),
        FtsDialect::Phrase => quote_fts_term(input.trim()),
        FtsDialect::Websearch => translate_websearch(input),
    }
}

fn quote_fts_term(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

fn translate_websearch(input: &str) -> String {
    let mut tokens: Vec<(bool, String)> = Vec::new(); // (negated, term)
    let mut or_positions = Vec::new();

    let mut chars = input.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '"' {
            chars.next();
            let mut phrase = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                phrase.push(c);
            }
            if !phrase.is_empty() {
                tokens.push((false, quote_fts_term(&phrase)));
            }
            continue;
        }
        let mut word = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            word.push(c);
            chars.next();
        }
        if word.eq_ignore_ascii_case("or") {
            or_positions.push(tokens.len());
            continue;
        }
        if let Some(stripped) = word.strip_prefix('-') {
            if !stripped.is_empty() {
                tokens.push((true, quote_fts_term(stripped)));
            }
            continue;
        }
        tokens.push((false, quote_fts_term(&word)));
    }

    let mut result = String::new();
    for (idx, (negated, term)) in tokens.iter().enumerate() {
        if result.is_empty() {
            // A leading negation has no left operand; drop the minus.
            result = term.clone();
            continue;
        }
        let connector = if *negated {
            " NOT "
        } else if or_positions.contains(&idx) {
            " OR "
        } else {
            " AND "
        };
        result.push_str(connector);
        result.push_str(term);
    }
    result
}

// ==================== READ PATH ====================

pub fn build_select(
    root: &TableInfo,
    schema: &SchemaSet,
    plan: &QueryPlan,
    rls: &RlsConditions,
    rowids: Option<&[i64]>,
) -> Result<BuiltQuery, ApiError> {
    let mut builder = Builder::new(schema, rls);
    let alias = root.name.as_str();

    let (projection, mut where_parts) = builder.projection(root, alias, &plan.select)?;

    for filter in &plan.filters {
        let rendered = builder.filter_sql(root, alias, filter)?;
        where_parts.push(rendered);
    }
    if let Some(cond) = rls.get(&root.name) {
        where_parts.push(format!("({})", cond));
    }
    if let Some(ids) = rowids {
        if ids.is_empty() {
            where_parts.push("1 = 0".to_string());
        } else {
            for id in ids {
                builder.params.push(SqlParam::Int(*id));
            }
            where_parts.push(format!(
                "{}.rowid IN ({})",
                quote_ident(alias),
                vec!["?"; ids.len()].join(", ")
            ));
        }
    }

    let mut sql = format!(
        "SELECT {} AS __row FROM {} AS {}",
        projection,
        quote_ident(&root.name),
        quote_ident(alias)
    );
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    if !plan.order.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&builder.order_sql(root, alias, &plan.order)?);
    }
    match (plan.limit, plan.offset) {
        (Some(limit), Some(offset)) => {
            sql.push_str(" LIMIT ? OFFSET ?");
            builder.params.push(SqlParam::Int(limit));
            builder.params.push(SqlParam::Int(offset));
        }
        (Some(limit), None) => {
            sql.push_str(" LIMIT ?");
            builder.params.push(SqlParam::Int(limit));
        }
        (None, Some(offset)) => {
            sql.push_str(" LIMIT -1 OFFSET ?");
            builder.params.push(SqlParam::Int(offset));
        }
        (None, None) => {}
    }

    Ok(BuiltQuery {
        sql,
        params: builder.params,
    })
}

/// Count over the same filters (and `!inner` predicates), without
/// pagination.
pub fn build_count(
    root: &TableInfo,
    schema: &SchemaSet,
    plan: &QueryPlan,
    rls: &RlsConditions,
) -> Result<BuiltQuery, ApiError> {
    let mut builder = Builder::new(schema, rls);
    let alias = root.name.as_str();

    let (_, mut where_parts) = builder.projection(root, alias, &plan.select)?;

    for filter in &plan.filters {
        let rendered = builder.filter_sql(root, alias, filter)?;
        where_parts.push(rendered);
    }
    if let Some(cond) = rls.get(&root.name) {
        where_parts.push(format!("({})", cond));
    }

    let mut sql = format!(
        "SELECT count(*) FROM {} AS {}",
        quote_ident(&root.name),
        quote_ident(alias)
    );
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }

    Ok(BuiltQuery {
        sql,
        params: builder.params,
    })
}

// ==================== WRITE PATH ====================

/// Validate a write value against the registered type; unregistered
/// columns pass through untyped.
fn coerce_write_value(
    column: &str,
    meta: Option<&ColumnMeta>,
    value: &Value,
) -> Result<SqlParam, ApiError> {
    if let Some(meta) = meta {
        if let Err(e) = validate_value(meta.pg_type, value) {
            return Err(ApiError::type_mismatch(column, e.expected, &e.got));
        }
    }

    if value.is_null() {
        return Ok(SqlParam::Null);
    }

    match meta.map(|m| m.pg_type) {
        Some(PgType::Integer) => {
            let n = value
                .as_i64()
                .or_else(|| value.as_f64().map(|f| f as i64))
                .unwrap_or_default();
            Ok(SqlParam::Int(n))
        }
        Some(PgType::Numeric) => match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(SqlParam::Int(i))
                } else {
                    Ok(SqlParam::Real(n.as_f64().unwrap_or_default()))
                }
            }
            Value::String(s) => Ok(SqlParam::Text(s.clone())),
            _ => Ok(SqlParam::Null),
        },
        Some(PgType::Boolean) => {
            let b = value.as_bool().unwrap_or(value.as_i64() == Some(1));
            Ok(SqlParam::Int(i64::from(b)))
        }
        Some(PgType::Jsonb) => match value {
            Value::String(s) => Ok(SqlParam::Text(s.clone())),
            other => Ok(SqlParam::Text(other.to_string())),
        },
        Some(PgType::Bytea) => match value {
            Value::String(s) => Ok(SqlParam::Text(s.clone())),
            Value::Array(items) => {
                let bytes: Vec<u8> = items
                    .iter()
                    .filter_map(|v| v.as_u64().map(|b| b as u8))
                    .collect();
                Ok(SqlParam::Text(base64::encode(bytes)))
            }
            _ => Ok(SqlParam::Null),
        },
        Some(PgType::Uuid) | Some(PgType::Text) | Some(PgType::Timestamptz) => {
            Ok(SqlParam::Text(value.as_str().unwrap_or_default().to_string()))
        }
        None => match value {
            Value::String(s) => Ok(SqlParam::Text(s.clone())),
            Value::Bool(b) => Ok(SqlParam::Int(i64::from(*b))),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(SqlParam::Int(i))
                } else {
                    Ok(SqlParam::Real(n.as_f64().unwrap_or_default()))
                }
            }
            other => Ok(SqlParam::Text(other.to_string())),
        },
    }
}

/// One INSERT statement per candidate row. With a CHECK condition the row
/// travels through an aliased inner SELECT so the expression can reference
/// its columns; a check-rejected row inserts nothing.
pub fn build_insert_row(
    info: &TableInfo,
    row: &Map<String, Value>,
    check_condition: Option<&str>,
    upsert: bool,
) -> Result<BuiltQuery, ApiError> {
    if row.is_empty() {
        return Err(ApiError::filter_syntax("Empty row in insert body"));
    }

    let mut columns = Vec::with_capacity(row.len());
    let mut params = Vec::with_capacity(row.len());
    for (column, value) in row {
        let meta = info.column(column);
        params.push(coerce_write_value(column, meta, value)?);
        columns.push(column.clone());
    }

    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");

    let mut sql = match check_condition {
        Some(check) => {
            let aliased = columns
                .iter()
                .map(|c| format!("? AS {}", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {} ({}) SELECT {} FROM (SELECT {}) WHERE {}",
                quote_ident(&info.name),
                column_list,
                column_list,
                aliased,
                check
            )
        }
        None => format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&info.name),
            column_list,
            placeholders
        ),
    };

    if upsert {
        let pk = info.primary_key().ok_or_else(|| {
            ApiError::filter_syntax(format!("Table '{}' has no primary key to upsert on", info.name))
        })?;
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| **c != pk.column_name)
            .map(|c| format!("{} = excluded.{}", quote_ident(c), quote_ident(c)))
            .collect();
        if updates.is_empty() {
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO NOTHING",
                quote_ident(&pk.column_name)
            ));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                quote_ident(&pk.column_name),
                updates.join(", ")
            ));
        }
    }

    sql.push_str(" RETURNING rowid");
    Ok(BuiltQuery { sql, params })
}

pub fn build_update(
    info: &TableInfo,
    schema: &SchemaSet,
    patch: &Map<String, Value>,
    plan: &QueryPlan,
    rls_condition: Option<&str>,
) -> Result<BuiltQuery, ApiError> {
    if patch.is_empty() {
        return Err(ApiError::filter_syntax("Empty patch body"));
    }

    let empty_rls = RlsConditions::new();
    let mut builder = Builder::new(schema, &empty_rls);
    let alias = info.name.as_str();

    let mut assignments = Vec::with_capacity(patch.len());
    for (column, value) in patch {
        let meta = info.column(column);
        builder.params.push(coerce_write_value(column, meta, value)?);
        assignments.push(format!("{} = ?", quote_ident(column)));
    }

    let mut where_parts = Vec::new();
    for filter in &plan.filters {
        where_parts.push(builder.filter_sql(info, alias, filter)?);
    }
    if let Some(rls) = rls_condition {
        where_parts.push(format!("({})", rls));
    }

    let mut sql = format!(
        "UPDATE {} SET {}",
        quote_ident(&info.name),
        assignments.join(", ")
    );
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" RETURNING rowid");

    Ok(BuiltQuery {
        sql,
        params: builder.params,
    })
}

pub fn build_delete(
    info: &TableInfo,
    schema: &SchemaSet,
    plan: &QueryPlan,
    rls_condition: Option<&str>,
) -> Result<BuiltQuery, ApiError> {
    let empty_rls = RlsConditions::new();
    let mut builder = Builder::new(schema, &empty_rls);
    let alias = info.name.as_str();

    let mut where_parts = Vec::new();
    for filter in &plan.filters {
        where_parts.push(builder.filter_sql(info, alias, filter)?);
    }
    if let Some(rls) = rls_condition {
        where_parts.push(format!("({})", rls));
    }

    let mut sql = format!("DELETE FROM {}", quote_ident(&info.name));
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" RETURNING rowid");

    Ok(BuiltQuery {
        sql,
        params: builder.params,
    })
}

/// Rowids matching the user filters plus the RLS condition; the DELETE
/// representation path selects the rows before removing them.
pub fn build_rowids(
    info: &TableInfo,
    schema: &SchemaSet,
    plan: &QueryPlan,
    rls_condition: Option<&str>,
) -> Result<BuiltQuery, ApiError> {
    let empty_rls = RlsConditions::new();
    let mut builder = Builder::new(schema, &empty_rls);
    let alias = info.name.as_str();

    let mut where_parts = Vec::new();
    for filter in &plan.filters {
        where_parts.push(builder.filter_sql(info, alias, filter)?);
    }
    if let Some(rls) = rls_condition {
        where_parts.push(format!("({})", rls));
    }

    let mut sql = format!(
        "SELECT {}.rowid FROM {} AS {}",
        quote_ident(alias),
        quote_ident(&info.name),
        quote_ident(alias)
    );
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }

    Ok(BuiltQuery {
        sql,
        params: builder.params,
    })
}

/// Post-UPDATE validation: count affected rows that fail the CHECK
/// expression. A non-zero count rolls the transaction back.
pub fn build_check_violations(
    info: &TableInfo,
    rowids: &[i64],
    check_condition: &str,
) -> BuiltQuery {
    let placeholders = vec!["?"; rowids.len()].join(", ");
    let sql = format!(
        "SELECT count(*) FROM {} WHERE rowid IN ({}) AND NOT ({})",
        quote_ident(&info.name),
        placeholders,
        check_condition
    );
    BuiltQuery {
        sql,
        params: rowids.iter().map(|id| SqlParam::Int(*id)).collect(),
    }
}
