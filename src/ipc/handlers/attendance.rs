use crate::ipc::helpers::{
    get_optional_str, get_required_date, get_required_str, require_school, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;

const VALID_CODES: [char; 4] = ['P', 'A', 'L', 'E'];

fn parse_code(raw: &str) -> Result<char, HandlerErr> {
    let t = raw.trim();
    let mut chars = t.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return Err(HandlerErr::bad_params("code must be a single character"));
    };
    let c = c.to_ascii_uppercase();
    if !VALID_CODES.contains(&c) {
        return Err(HandlerErr::bad_params(format!(
            "code must be one of P, A, L, E (got {})",
            t
        )));
    }
    Ok(c)
}

fn attendance_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let day = get_required_date(params, "day")?;
    let day_key = day.format("%Y-%m-%d").to_string();

    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut marked = 0usize;
    let mut skipped = 0usize;
    for entry in entries {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            return Err(HandlerErr::bad_params("entry missing studentId"));
        };
        let Some(code_raw) = entry.get("code").and_then(|v| v.as_str()) else {
            return Err(HandlerErr::bad_params("entry missing code"));
        };
        let code = parse_code(code_raw)?;

        // Unknown students are skipped, not fatal; the roster may have
        // changed under a stale client.
        let exists = tx
            .query_row(
                "SELECT 1 FROM students WHERE school_id = ? AND id = ?",
                (&school_id, student_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(HandlerErr::db)?
            .is_some();
        if !exists {
            skipped += 1;
            continue;
        }

        tx.execute(
            "INSERT INTO attendance_days(school_id, student_id, day, code)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(student_id, day) DO UPDATE SET code = excluded.code",
            (&school_id, student_id, &day_key, code.to_string()),
        )
        .map_err(|e| HandlerErr::db_update(e, "attendance_days"))?;
        marked += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "marked": marked, "skipped": skipped }))
}

fn attendance_summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let from = get_required_date(params, "from")?.format("%Y-%m-%d").to_string();
    let to = get_required_date(params, "to")?.format("%Y-%m-%d").to_string();
    if from > to {
        return Err(HandlerErr::bad_params("from must not be after to"));
    }
    let student_filter = get_optional_str(params, "studentId");

    let mut stmt = conn
        .prepare(
            "SELECT a.student_id, s.last_name, s.first_name, a.code
             FROM attendance_days a
             JOIN students s ON s.id = a.student_id
             WHERE a.school_id = ?
               AND a.day >= ?2 AND a.day <= ?3
               AND (?4 IS NULL OR a.student_id = ?4)
             ORDER BY s.last_name, s.first_name",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map((&school_id, &from, &to, &student_filter), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    struct Tally {
        display_name: String,
        present: i64,
        absent: i64,
        late: i64,
        excused: i64,
    }

    let mut by_student: BTreeMap<String, Tally> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    for (student_id, last, first, code) in rows {
        let tally = by_student.entry(student_id.clone()).or_insert_with(|| {
            order.push(student_id.clone());
            Tally {
                display_name: format!("{}, {}", last, first),
                present: 0,
                absent: 0,
                late: 0,
                excused: 0,
            }
        });
        match code.as_str() {
            "P" => tally.present += 1,
            "A" => tally.absent += 1,
            "L" => tally.late += 1,
            "E" => tally.excused += 1,
            _ => {}
        }
    }

    let summary: Vec<serde_json::Value> = order
        .iter()
        .filter_map(|id| by_student.get(id).map(|t| (id, t)))
        .map(|(id, t)| {
            let marked = t.present + t.absent + t.late + t.excused;
            // Late still counts as attended for the percentage.
            let attended = t.present + t.late;
            let percent = if marked > 0 {
                100.0 * attended as f64 / marked as f64
            } else {
                0.0
            };
            json!({
                "studentId": id,
                "displayName": t.display_name,
                "present": t.present,
                "absent": t.absent,
                "late": t.late,
                "excused": t.excused,
                "markedDays": marked,
                "presentPercent": percent,
            })
        })
        .collect();

    Ok(json!({ "from": from, "to": to, "rows": summary }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(with_conn(state, req, attendance_mark)),
        "attendance.summary" => Some(with_conn(state, req, attendance_summary)),
        _ => None,
    }
}
