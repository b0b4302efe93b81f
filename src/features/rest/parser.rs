use super::error::ApiError;

/// Keys with reserved meaning; never treated as column filters.
pub const RESERVED_KEYS: [&str; 9] = [
    "select",
    "order",
    "limit",
    "offset",
    "count",
    "or",
    "and",
    "on_conflict",
    "head",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMode {
    Exact,
    Planned,
    Estimated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonStep {
    pub key: String,
    pub as_text: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Star,
    Column(ColumnSelect),
    Embed(EmbedSelect),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSelect {
    pub name: String,
    pub json_path: Vec<JsonStep>,
    pub alias: Option<String>,
}

impl ColumnSelect {
    /// JSON key the value is emitted under: the alias, else the last path
    /// segment, else the column name.
    pub fn output_key(&self) -> &str {
        if let Some(alias) = &self.alias {
            return alias;
        }
        self.json_path
            .last()
            .map(|s| s.key.as_str())
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedSelect {
    pub key: String,
    pub target: String,
    pub fk_hint: Option<String>,
    pub inner: bool,
    pub items: Vec<SelectItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtsDialect {
    /// `fts`: engine-native match syntax, passed through.
    Native,
    /// `plfts`: tokenize and AND the terms.
    Plain,
    /// `phfts`: the whole input is one phrase.
    Phrase,
    /// `wfts`: websearch operators (`or`, `-neg`, quoted phrases).
    Websearch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsValue {
    Null,
    NotNull,
    True,
    False,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(String),
    Neq(String),
    Gt(String),
    Gte(String),
    Lt(String),
    Lte(String),
    Like(String),
    Ilike(String),
    Is(IsValue),
    In(Vec<String>),
    Fts { dialect: FtsDialect, query: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterCond {
    pub column: String,
    pub json_path: Vec<JsonStep>,
    pub op: FilterOp,
    pub negated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Cond(FilterCond),
    Group {
        op: LogicOp,
        children: Vec<FilterNode>,
        negated: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
    pub column: String,
    pub descending: bool,
    /// None keeps the engine default.
    pub nulls_first: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    /// Empty means `select=*`.
    pub select: Vec<SelectItem>,
    pub filters: Vec<FilterNode>,
    pub order: Vec<OrderTerm>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub head: bool,
    pub on_conflict: Option<String>,
}

impl QueryPlan {
    pub fn parse(params: &[(String, String)]) -> Result<QueryPlan, ApiError> {
        let mut plan = QueryPlan::default();

        for (key, value) in params {
            match key.as_str() {
                "select" => plan.select = parse_select_list(value)?,
                "order" => plan.order = parse_order(value)?,
                "limit" => {
                    plan.limit = Some(value.parse().map_err(|_| {
                        ApiError::filter_syntax(format!("Invalid limit '{}'", value))
                    })?)
                }
                "offset" => {
                    plan.offset = Some(value.parse().map_err(|_| {
                        ApiError::filter_syntax(format!("Invalid offset '{}'", value))
                    })?)
                }
                "head" => plan.head = value == "true",
                "on_conflict" => plan.on_conflict = Some(value.clone()),
                "count" => {}
                "or" => plan.filters.push(parse_group(value, LogicOp::Or, false)?),
                "and" => plan.filters.push(parse_group(value, LogicOp::And, false)?),
                "not.or" => plan.filters.push(parse_group(value, LogicOp::Or, true)?),
                "not.and" => plan.filters.push(parse_group(value, LogicOp::And, true)?),
                _ => {
                    let (column, json_path) = parse_column_path(key)?;
                    let (op, negated) = parse_op_value(value)?;
                    plan.filters.push(FilterNode::Cond(FilterCond {
                        column,
                        json_path,
                        op,
                        negated,
                    }));
                }
            }
        }

        Ok(plan)
    }
}

/// Split on `sep` at the top level only: parentheses and double quotes
/// shield their content.
fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_quotes = false;

    for ch in s.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '(' if !in_quotes => {
                depth += 1;
                current.push(ch);
            }
            ')' if !in_quotes => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            c if c == sep && depth == 0 && !in_quotes => {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            c => current.push(c),
        }
    }
    parts.push(current.trim().to_string());
    parts
}

// ==================== SELECT ====================

pub fn parse_select_list(input: &str) -> Result<Vec<SelectItem>, ApiError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(vec![SelectItem::Star]);
    }

    let mut items = Vec::new();
    for token in split_top_level(input, ',') {
        if token.is_empty() {
            return Err(ApiError::select_syntax("Empty select item"));
        }
        items.push(parse_select_item(&token)?);
    }
    Ok(items)
}

fn parse_select_item(token: &str) -> Result<SelectItem, ApiError> {
    if token == "*" {
        return Ok(SelectItem::Star);
    }

    // An alias applies to whatever follows the first top-level colon.
    let (alias, rest) = match top_level_colon(token) {
        Some(idx) => (Some(token[..idx].trim().to_string()), token[idx + 1..].trim()),
        None => (None, token),
    };

    if let Some(open) = rest.find('(') {
        if !rest.ends_with(')') {
            return Err(ApiError::select_syntax(format!(
                "Unbalanced parentheses in '{}'",
                token
            )));
        }
        let name_part = &rest[..open];
        let inner_list = &rest[open + 1..rest.len() - 1];

        let mut segments = name_part.split('!');
        let target = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::select_syntax(format!("Missing embed name in '{}'", token)))?
            .to_string();
        let mut fk_hint = None;
        let mut inner = false;
        for seg in segments {
            if seg == "inner" {
                inner = true;
            } else if fk_hint.is_none() {
                fk_hint = Some(seg.to_string());
            } else {
                return Err(ApiError::select_syntax(format!(
                    "Too many '!' modifiers in '{}'",
                    token
                )));
            }
        }

        let items = parse_select_list(inner_list)?;
        let key = alias.clone().unwrap_or_else(|| target.clone());
        return Ok(SelectItem::Embed(EmbedSelect {
            key,
            target,
            fk_hint,
            inner,
            items,
        }));
    }

    let (name, json_path) = parse_column_path(rest)?;
    Ok(SelectItem::Column(ColumnSelect {
        name,
        json_path,
        alias,
    }))
}

/// Position of an aliasing colon: top level, before any parenthesis.
fn top_level_colon(token: &str) -> Option<usize> {
    for (idx, ch) in token.char_indices() {
        match ch {
            ':' => return Some(idx),
            '(' => return None,
            _ => {}
        }
    }
    None
}

/// `col`, `col->key`, `col->>key`, arbitrarily chained.
pub fn parse_column_path(input: &str) -> Result<(String, Vec<JsonStep>), ApiError> {
    let mut parts = input.split("->");
    let name = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::select_syntax(format!("Invalid column reference '{}'", input)))?
        .to_string();

    let mut json_path = Vec::new();
    for part in parts {
        let (key, as_text) = match part.strip_prefix('>') {
            Some(rest) => (rest, true),
            None => (part, false),
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ApiError::select_syntax(format!(
                "Empty JSON path segment in '{}'",
                input
            )));
        }
        json_path.push(JsonStep {
            key: key.to_string(),
            as_text,
        });
    }

    Ok((name, json_path))
}

// ==================== FILTERS ====================

/// `[not.]op[.value]`; the value keeps any further dots.
pub fn parse_op_value(input: &str) -> Result<(FilterOp, bool), ApiError> {
    let (negated, rest) = match input.strip_prefix("not.") {
        Some(rest) => (true, rest),
        None => (false, input),
    };

    let (op_token, value) = match rest.split_once('.') {
        Some((op, value)) => (op, value),
        None => (rest, ""),
    };

    // `plfts(english).x` carries a text-search config; the engine has a
    // fixed tokenizer, so the config is accepted and dropped.
    let op_name = op_token.split_once('(').map(|(n, _)| n).unwrap_or(op_token);

    let op = match op_name {
        "eq" => FilterOp::Eq(value.to_string()),
        "neq" => FilterOp::Neq(value.to_string()),
        "gt" => FilterOp::Gt(value.to_string()),
        "gte" => FilterOp::Gte(value.to_string()),
        "lt" => FilterOp::Lt(value.to_string()),
        "lte" => FilterOp::Lte(value.to_string()),
        "like" => FilterOp::Like(value.to_string()),
        "ilike" => FilterOp::Ilike(value.to_string()),
        "is" => FilterOp::Is(match value {
            "null" => IsValue::Null,
            "not.null" => IsValue::NotNull,
            "true" => IsValue::True,
            "false" => IsValue::False,
            other => {
                return Err(ApiError::filter_syntax(format!(
                    "Invalid 'is' value '{}'",
                    other
                )))
            }
        }),
        "in" => FilterOp::In(parse_in_list(value)?),
        "fts" => FilterOp::Fts {
            dialect: FtsDialect::Native,
            query: value.to_string(),
        },
        "plfts" => FilterOp::Fts {
            dialect: FtsDialect::Plain,
            query: value.to_string(),
        },
        "phfts" => FilterOp::Fts {
            dialect: FtsDialect::Phrase,
            query: value.to_string(),
        },
        "wfts" => FilterOp::Fts {
            dialect: FtsDialect::Websearch,
            query: value.to_string(),
        },
        other => return Err(ApiError::unknown_operator(other)),
    };

    Ok((op, negated))
}

fn parse_in_list(value: &str) -> Result<Vec<String>, ApiError> {
    let inner = value
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(|| {
            ApiError::filter_syntax(format!("'in' expects a parenthesized list, got '{}'", value))
        })?;

    Ok(split_top_level(inner, ',')
        .into_iter()
        .filter(|item| !item.is_empty())
        .map(|item| unquote(&item))
        .collect())
}

fn unquote(item: &str) -> String {
    if item.len() >= 2 && item.starts_with('"') && item.ends_with('"') {
        item[1..item.len() - 1].replace("\"\"", "\"")
    } else {
        item.to_string()
    }
}

/// `(cond,cond,...)` where each element is `col.op.value`, a nested
/// `and(...)`/`or(...)`, or a `not.`-prefixed form of either.
fn parse_group(value: &str, op: LogicOp, negated: bool) -> Result<FilterNode, ApiError> {
    let inner = value
        .trim()
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(|| {
            ApiError::filter_syntax(format!("Logic group must be parenthesized: '{}'", value))
        })?;

    let mut children = Vec::new();
    for element in split_top_level(inner, ',') {
        if element.is_empty() {
            return Err(ApiError::filter_syntax("Empty element in logic group"));
        }
        children.push(parse_group_element(&element)?);
    }
    if children.is_empty() {
        return Err(ApiError::filter_syntax("Empty logic group"));
    }

    Ok(FilterNode::Group {
        op,
        children,
        negated,
    })
}

fn parse_group_element(element: &str) -> Result<FilterNode, ApiError> {
    let (negated, rest) = match element.strip_prefix("not.") {
        Some(rest) if rest.starts_with("and(") || rest.starts_with("or(") => (true, rest),
        _ => (false, element),
    };

    if let Some(body) = rest.strip_prefix("and") {
        if body.starts_with('(') {
            return parse_group(body, LogicOp::And, negated);
        }
    }
    if let Some(body) = rest.strip_prefix("or") {
        if body.starts_with('(') {
            return parse_group(body, LogicOp::Or, negated);
        }
    }

    // `col.op.value` in dotted form.
    let (column_part, op_part) = element.split_once('.').ok_or_else(|| {
        ApiError::filter_syntax(format!("Invalid condition '{}' in logic group", element))
    })?;
    let (column, json_path) = parse_column_path(column_part)?;
    let (op, negated) = parse_op_value(op_part)?;
    Ok(FilterNode::Cond(FilterCond {
        column,
        json_path,
        op,
        negated,
    }))
}

// ==================== ORDER ====================

fn parse_order(input: &str) -> Result<Vec<OrderTerm>, ApiError> {
    let mut terms = Vec::new();
    for token in split_top_level(input, ',') {
        if token.is_empty() {
            continue;
        }
        let mut parts = token.split('.');
        let mut column = parts
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        let mut descending = false;
        if let Some(stripped) = column.strip_prefix('-') {
            column = stripped.to_string();
            descending = true;
        }
        if column.is_empty() {
            return Err(ApiError::filter_syntax(format!("Invalid order term '{}'", token)));
        }

        let mut nulls_first = None;
        for modifier in parts {
            match modifier {
                "asc" => descending = false,
                "desc" => descending = true,
                "nullsfirst" => nulls_first = Some(true),
                "nullslast" => nulls_first = Some(false),
                other => {
                    return Err(ApiError::filter_syntax(format!(
                        "Unknown order modifier '{}'",
                        other
                    )))
                }
            }
        }

        terms.push(OrderTerm {
            column,
            descending,
            nulls_first,
        });
    }
    Ok(terms)
}
