use crate::ipc::error::err;
use crate::ipc::types::Request;
use crate::records::parse_time;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

pub fn required_str(req: &Request, key: &str) -> Result<String, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn optional_bool(req: &Request, key: &str) -> Result<Option<bool>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_bool().map(Some).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be boolean", key),
                None,
            )
        }),
    }
}

pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be a number", key),
                None,
            )
        }),
    }
}

pub fn optional_time(req: &Request, key: &str) -> Result<Option<DateTime<Utc>>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_str().and_then(parse_time).map(Some).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be an RFC 3339 timestamp", key),
                Some(json!({ "value": v })),
            )
        }),
    }
}

/// `params.now` when given (lets clients replay at a fixed time), else the
/// wall clock.
pub fn request_now(req: &Request) -> Result<DateTime<Utc>, Value> {
    Ok(optional_time(req, "now")?.unwrap_or_else(Utc::now))
}

/// 1-based column index parameter.
pub fn column_index(req: &Request, key: &str, required: bool) -> Result<Option<usize>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) if !required => Ok(None),
        Some(v) => match v.as_u64() {
            Some(n) if n >= 1 => Ok(Some(n as usize)),
            _ => Err(err(
                &req.id,
                "bad_params",
                format!("{} must be an integer >= 1", key),
                Some(json!({ "value": v })),
            )),
        },
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}
