use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::QuizResult;
use crate::ipc::error::{err, ok, quiz_err};
use crate::ipc::types::{AppState, Request};

/// Handler outcome; the error side is already a wire response.
pub type Reply = Result<JsonValue, JsonValue>;

pub fn respond(req: &Request, reply: Reply) -> JsonValue {
    match reply {
        Ok(result) => ok(&req.id, result),
        Err(e) => e,
    }
}

pub trait OrReply<T> {
    fn or_reply(self, req: &Request) -> Result<T, JsonValue>;
}

impl<T> OrReply<T> for QuizResult<T> {
    fn or_reply(self, req: &Request) -> Result<T, JsonValue> {
        self.map_err(|e| quiz_err(&req.id, e))
    }
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, JsonValue> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn bad_params(req: &Request, message: impl Into<String>) -> JsonValue {
    err(&req.id, "bad_params", message, None)
}

pub fn required_str(req: &Request, key: &str) -> Result<String, JsonValue> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_params(req, format!("missing {}", key)))
}

pub fn opt_str(req: &Request, key: &str) -> Result<Option<String>, JsonValue> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| bad_params(req, format!("{} must be a string", key)))?
                .trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
    }
}

pub fn opt_i64(req: &Request, key: &str) -> Result<Option<i64>, JsonValue> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| bad_params(req, format!("{} must be integer or null", key))),
    }
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, JsonValue> {
    opt_i64(req, key)?.ok_or_else(|| bad_params(req, format!("missing {}", key)))
}

pub fn opt_f64(req: &Request, key: &str) -> Result<Option<f64>, JsonValue> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| bad_params(req, format!("{} must be a number or null", key))),
    }
}

pub fn opt_bool(req: &Request, key: &str, default: bool) -> Result<bool, JsonValue> {
    match req.params.get(key) {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| bad_params(req, format!("{} must be boolean", key))),
    }
}

/// `params.now` when the caller pins the clock, otherwise wall time.
pub fn now_param(req: &Request) -> Result<i64, JsonValue> {
    Ok(opt_i64(req, "now")?.unwrap_or_else(|| chrono::Utc::now().timestamp()))
}

pub fn seed_param(req: &Request) -> Result<Option<u64>, JsonValue> {
    match opt_i64(req, "seed")? {
        None => Ok(None),
        Some(s) if s >= 0 => Ok(Some(s as u64)),
        Some(_) => Err(bad_params(req, "seed must not be negative")),
    }
}

pub fn parse_param<T: DeserializeOwned>(req: &Request, key: &str) -> Result<T, JsonValue> {
    let raw = req
        .params
        .get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| bad_params(req, format!("missing {}", key)))?;
    serde_json::from_value(raw.clone()).map_err(|e| bad_params(req, format!("{}: {}", key, e)))
}

pub fn parse_opt_param<T: DeserializeOwned>(req: &Request, key: &str) -> Result<Option<T>, JsonValue> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| bad_params(req, format!("{}: {}", key, e))),
    }
}
