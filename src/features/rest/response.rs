use serde_json::Value;

use super::error::ApiError;
use super::parser::CountMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    Representation,
    Minimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    MergeDuplicates,
    IgnoreDuplicates,
}

/// Parsed `Prefer` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct Preferences {
    pub count: Option<CountMode>,
    pub representation: Option<Representation>,
    pub resolution: Option<Resolution>,
    pub head: bool,
}

impl Preferences {
    pub fn parse(header: Option<&str>) -> Preferences {
        let mut prefs = Preferences::default();
        let Some(header) = header else {
            return prefs;
        };

        for item in header.split(',') {
            let item = item.trim();
            match item.split_once('=') {
                Some(("count", "exact")) => prefs.count = Some(CountMode::Exact),
                Some(("count", "planned")) => prefs.count = Some(CountMode::Planned),
                Some(("count", "estimated")) => prefs.count = Some(CountMode::Estimated),
                Some(("return", "representation")) => {
                    prefs.representation = Some(Representation::Representation)
                }
                Some(("return", "minimal")) => prefs.representation = Some(Representation::Minimal),
                Some(("resolution", "merge-duplicates")) => {
                    prefs.resolution = Some(Resolution::MergeDuplicates)
                }
                Some(("resolution", "ignore-duplicates")) => {
                    prefs.resolution = Some(Resolution::IgnoreDuplicates)
                }
                Some(("head", "true")) => prefs.head = true,
                _ => {}
            }
        }
        prefs
    }

    pub fn wants_representation(&self) -> bool {
        self.representation == Some(Representation::Representation)
    }
}

/// Requested result shape, signaled through the `Accept` header.
/// `single` expects exactly one row; `maybeSingle` (the `nullable`
/// media-type parameter) tolerates zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    Array,
    Single,
    MaybeSingle,
}

impl ReturnShape {
    pub fn from_accept(header: Option<&str>) -> ReturnShape {
        let Some(header) = header else {
            return ReturnShape::Array;
        };
        if !header.contains("application/vnd.pgrst.object+json") {
            return ReturnShape::Array;
        }
        if header.contains("nullable=true") {
            ReturnShape::MaybeSingle
        } else {
            ReturnShape::Single
        }
    }
}

/// Shape a fetched row set per the requested modifier.
pub fn shape_rows(rows: Vec<Value>, shape: ReturnShape) -> Result<Value, ApiError> {
    match shape {
        ReturnShape::Array => Ok(Value::Array(rows)),
        ReturnShape::Single => {
            if rows.len() == 1 {
                Ok(rows.into_iter().next().unwrap_or(Value::Null))
            } else {
                Err(ApiError::single_row_expected(rows.len()))
            }
        }
        ReturnShape::MaybeSingle => match rows.len() {
            0 => Ok(Value::Null),
            1 => Ok(rows.into_iter().next().unwrap_or(Value::Null)),
            n => Err(ApiError::single_row_expected(n)),
        },
    }
}

/// `Content-Range: start-end/total`; `*` stands in for an empty range or
/// an unknown total.
pub fn content_range(offset: i64, returned: usize, total: Option<i64>) -> String {
    let total_part = total
        .map(|t| t.to_string())
        .unwrap_or_else(|| "*".to_string());
    if returned == 0 {
        return format!("*/{}", total_part);
    }
    let end = offset + returned as i64 - 1;
    format!("{}-{}/{}", offset, end, total_part)
}

/// `Range: start-end` header (inclusive) as the alternative pagination
/// form.
pub fn parse_range(header: &str) -> Option<(i64, i64)> {
    let raw = header.trim().trim_start_matches("items=");
    let (start, end) = raw.split_once('-')?;
    let start: i64 = start.trim().parse().ok()?;
    let end: i64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    Some((start, end - start + 1))
}
