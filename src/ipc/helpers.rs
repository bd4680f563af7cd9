use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;

use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn db_update(e: rusqlite::Error, table: &str) -> Self {
        Self {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

/// Shared shell for db-backed handlers: checks a workspace is open, maps the
/// result into the response envelope.
pub fn with_conn<F>(state: &mut AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn get_optional_bool(params: &serde_json::Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

/// Money params accept a decimal string or a JSON number. A JSON number is
/// parsed from its literal text so the value stays exact.
pub fn get_required_amount(params: &serde_json::Value, key: &str) -> Result<Decimal, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    };
    decimal_from_value(v).ok_or_else(|| {
        HandlerErr::bad_params(format!("{} must be a decimal number or string", key))
    })
}

fn decimal_from_value(v: &serde_json::Value) -> Option<Decimal> {
    if let Some(s) = v.as_str() {
        return Decimal::from_str(s.trim()).ok();
    }
    if v.is_number() {
        return Decimal::from_str(&v.to_string()).ok();
    }
    None
}

pub fn get_required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    parse_date_text(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn get_optional_date(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<NaiveDate>, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()) {
        None => Ok(None),
        Some(raw) => parse_date_text(raw)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key))),
    }
}

pub fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Reads a TEXT money column. A corrupt cell is a db-level failure, not a
/// caller error.
pub fn decimal_column(raw: &str) -> Result<Decimal, HandlerErr> {
    Decimal::from_str(raw.trim())
        .map_err(|_| HandlerErr::new("db_corrupt_amount", format!("unparseable amount: {}", raw)))
}

pub fn date_column(raw: &str) -> Result<NaiveDate, HandlerErr> {
    parse_date_text(raw)
        .ok_or_else(|| HandlerErr::new("db_corrupt_date", format!("unparseable date: {}", raw)))
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn school_exists(conn: &Connection, school_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM schools WHERE id = ?", [school_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

pub fn require_school(conn: &Connection, school_id: &str) -> Result<(), HandlerErr> {
    if school_exists(conn, school_id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("school not found"))
    }
}

/// Per-school monotonic counter, used for invoice and challan numbering.
pub fn next_counter(conn: &Connection, school_id: &str, name: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "INSERT INTO counters(school_id, name, value) VALUES(?, ?, 1)
         ON CONFLICT(school_id, name) DO UPDATE SET value = value + 1
         RETURNING value",
        (school_id, name),
        |r| r.get(0),
    )
    .map_err(HandlerErr::db)
}
