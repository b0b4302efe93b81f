use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde_json::Value;

use super::models::PgType;

/// A value that does not fit the column's registered type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeError {
    pub expected: &'static str,
    pub got: String,
}

impl TypeError {
    fn new(expected: &'static str, value: &Value) -> TypeError {
        TypeError {
            expected,
            got: describe(value),
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            if s.len() > 64 {
                format!("{}…", &s[..64])
            } else {
                s.clone()
            }
        }
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .unwrap()
    })
}

fn numeric_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-?\d+(\.\d+)?$").unwrap())
}

/// Validate a JSON payload value against a registered PgType. `Null`
/// always passes; NOT NULL enforcement belongs to the storage engine.
pub fn validate_value(pg_type: PgType, value: &Value) -> Result<(), TypeError> {
    if value.is_null() {
        return Ok(());
    }

    match pg_type {
        PgType::Uuid => match value {
            Value::String(s) if uuid_re().is_match(s) => Ok(()),
            _ => Err(TypeError::new("uuid", value)),
        },
        PgType::Text => match value {
            Value::String(_) => Ok(()),
            _ => Err(TypeError::new("text", value)),
        },
        PgType::Integer => match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if i >= i64::from(i32::MIN) && i <= i64::from(i32::MAX) {
                        return Ok(());
                    }
                } else if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f >= f64::from(i32::MIN) && f <= f64::from(i32::MAX) {
                        return Ok(());
                    }
                }
                Err(TypeError::new("integer", value))
            }
            _ => Err(TypeError::new("integer", value)),
        },
        PgType::Numeric => match value {
            Value::Number(_) => Ok(()),
            Value::String(s) if numeric_re().is_match(s) => Ok(()),
            _ => Err(TypeError::new("numeric", value)),
        },
        PgType::Boolean => match value {
            Value::Bool(_) => Ok(()),
            Value::Number(n) if n.as_i64() == Some(0) || n.as_i64() == Some(1) => Ok(()),
            _ => Err(TypeError::new("boolean", value)),
        },
        PgType::Timestamptz => match value {
            Value::String(s) if is_timestamp(s) => Ok(()),
            _ => Err(TypeError::new("timestamptz", value)),
        },
        PgType::Jsonb => match value {
            Value::Object(_) | Value::Array(_) => Ok(()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(_)) | Ok(Value::Array(_)) => Ok(()),
                _ => Err(TypeError::new("jsonb", value)),
            },
            _ => Err(TypeError::new("jsonb", value)),
        },
        PgType::Bytea => match value {
            Value::String(s) => {
                if s.chars().any(char::is_whitespace) {
                    return Err(TypeError::new("bytea", value));
                }
                base64::decode(s)
                    .map(|_| ())
                    .map_err(|_| TypeError::new("bytea", value))
            }
            Value::Array(items) => {
                let all_bytes = items
                    .iter()
                    .all(|v| v.as_u64().map(|b| b <= 255).unwrap_or(false));
                if all_bytes {
                    Ok(())
                } else {
                    Err(TypeError::new("bytea", value))
                }
            }
            _ => Err(TypeError::new("bytea", value)),
        },
    }
}

/// ISO-8601 date-time, with or without offset, fractional seconds allowed.
/// Date-only strings are rejected.
fn is_timestamp(s: &str) -> bool {
    if chrono::DateTime::parse_from_rfc3339(s).is_ok() {
        return true;
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if NaiveDateTime::parse_from_str(s, fmt).is_ok() {
            return true;
        }
    }
    false
}
