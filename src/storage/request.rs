//! Query request parsing
//!
//! The engine owns the (deliberately small) query grammar: a JSON object
//! whose shape depends on the API endpoint it arrived through.

use serde_json::Value;
use thiserror::Error;

use crate::types::{parse_timestamp, ApiEndpoint, Timestamp};

/// Query-text parsing failure.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("invalid query: {0}")]
    Invalid(String),
    #[error("invalid query: {0}")]
    Json(#[from] serde_json::Error),
}

/// Output representation requested for range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOutput {
    #[default]
    Csv,
    Json,
}

/// A parsed query, one variant per API endpoint shape.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRequest {
    /// Range select over one metric
    Select {
        metric: String,
        range: (Timestamp, Timestamp),
        where_tags: Vec<(String, String)>,
        output: QueryOutput,
    },
    /// Metric-name completion
    Suggest { prefix: String },
    /// Metric-name text match
    Search { text: String },
}

impl QueryRequest {
    /// Parse UTF-8 query text according to the endpoint it arrived through.
    pub fn parse(text: &[u8], endpoint: ApiEndpoint) -> Result<Self, RequestError> {
        let text = std::str::from_utf8(text)
            .map_err(|_| RequestError::Invalid("query is not valid UTF-8".to_string()))?;
        let root: Value = serde_json::from_str(text)?;
        let object = root
            .as_object()
            .ok_or_else(|| RequestError::Invalid("query must be a JSON object".to_string()))?;
        match endpoint {
            ApiEndpoint::Query => {
                let metric = required_str(object, "select")?;
                let range = match object.get("range") {
                    Some(range) => parse_range(range)?,
                    None => (0, Timestamp::MAX),
                };
                let where_tags = match object.get("where") {
                    Some(Value::Object(map)) => map
                        .iter()
                        .map(|(key, value)| match value.as_str() {
                            Some(s) => Ok((key.clone(), s.to_string())),
                            None => Err(RequestError::Invalid(format!(
                                "`where.{}` must be a string",
                                key
                            ))),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    Some(_) => {
                        return Err(RequestError::Invalid("`where` must be an object".to_string()))
                    }
                    None => Vec::new(),
                };
                let output = match object.get("output").and_then(|o| o.get("format")) {
                    Some(Value::String(s)) if s.eq_ignore_ascii_case("csv") => QueryOutput::Csv,
                    Some(Value::String(s)) if s.eq_ignore_ascii_case("json") => QueryOutput::Json,
                    Some(other) => {
                        return Err(RequestError::Invalid(format!(
                            "unknown output format: {}",
                            other
                        )))
                    }
                    None => QueryOutput::default(),
                };
                Ok(QueryRequest::Select {
                    metric,
                    range,
                    where_tags,
                    output,
                })
            }
            ApiEndpoint::Suggest => {
                expect_metric_names(object)?;
                let prefix = match object.get("starts-with") {
                    Some(Value::String(s)) => s.clone(),
                    Some(_) => {
                        return Err(RequestError::Invalid(
                            "`starts-with` must be a string".to_string(),
                        ))
                    }
                    None => String::new(),
                };
                Ok(QueryRequest::Suggest { prefix })
            }
            ApiEndpoint::Search => {
                expect_metric_names(object)?;
                let text = match object.get("matching") {
                    Some(Value::String(s)) => s.clone(),
                    Some(_) => {
                        return Err(RequestError::Invalid("`matching` must be a string".to_string()))
                    }
                    None => String::new(),
                };
                Ok(QueryRequest::Search { text })
            }
        }
    }
}

fn required_str(
    object: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<String, RequestError> {
    match object.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(_) => Err(RequestError::Invalid(format!("`{}` must be a string", key))),
        None => Err(RequestError::Invalid(format!("`{}` field is missing", key))),
    }
}

fn expect_metric_names(object: &serde_json::Map<String, Value>) -> Result<(), RequestError> {
    match object.get("select") {
        Some(Value::String(s)) if s == "metric-names" => Ok(()),
        _ => Err(RequestError::Invalid(
            "`select` must be \"metric-names\"".to_string(),
        )),
    }
}

fn parse_range(range: &Value) -> Result<(Timestamp, Timestamp), RequestError> {
    let object = range
        .as_object()
        .ok_or_else(|| RequestError::Invalid("`range` must be an object".to_string()))?;
    let from = parse_bound(object.get("from"), 0)?;
    let to = parse_bound(object.get("to"), Timestamp::MAX)?;
    if from > to {
        return Err(RequestError::Invalid(
            "`range.from` is greater than `range.to`".to_string(),
        ));
    }
    Ok((from, to))
}

fn parse_bound(value: Option<&Value>, default: Timestamp) -> Result<Timestamp, RequestError> {
    match value {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| RequestError::Invalid(format!("bad range bound: {}", n))),
        Some(Value::String(s)) => parse_timestamp(s)
            .ok_or_else(|| RequestError::Invalid(format!("bad range bound: `{}`", s))),
        Some(other) => Err(RequestError::Invalid(format!("bad range bound: {}", other))),
    }
}
