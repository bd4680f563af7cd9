use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_required_str, require_school, today, with_conn,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;

    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    if last_name.is_empty() || first_name.is_empty() {
        return Err(HandlerErr::bad_params("names must not be empty"));
    }
    let admission_no = get_optional_str(params, "admissionNo");
    let class_label = get_optional_str(params, "classLabel");
    let active = get_optional_bool(params, "active").unwrap_or(true);

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, school_id, last_name, first_name, admission_no, class_label, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &school_id,
            &last_name,
            &first_name,
            &admission_no,
            &class_label,
            active as i64,
            today().format("%Y-%m-%d").to_string(),
        ),
    )
    .map_err(|e| HandlerErr::db_update(e, "students"))?;

    Ok(json!({ "studentId": student_id }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let class_label = get_optional_str(params, "classLabel");
    let active_only = get_optional_bool(params, "activeOnly").unwrap_or(false);

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, admission_no, class_label, active
             FROM students
             WHERE school_id = ?
               AND (?2 IS NULL OR class_label = ?2)
               AND (?3 = 0 OR active = 1)
             ORDER BY last_name, first_name",
        )
        .map_err(HandlerErr::db)?;
    let students = stmt
        .query_map((&school_id, &class_label, active_only as i64), |row| {
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "displayName": format!("{}, {}", last, first),
                "lastName": last,
                "firstName": first,
                "admissionNo": row.get::<_, Option<String>>(3)?,
                "classLabel": row.get::<_, Option<String>>(4)?,
                "active": row.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "students": students }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let student_id = get_required_str(params, "studentId")?;

    let exists = conn
        .query_row(
            "SELECT 1 FROM students WHERE school_id = ? AND id = ?",
            (&school_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if !exists {
        return Err(HandlerErr::not_found("student not found"));
    }

    let Some(patch) = params.get("patch") else {
        return Err(HandlerErr::bad_params("missing patch"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Some(v) = patch.get("lastName").and_then(|v| v.as_str()) {
        tx.execute("UPDATE students SET last_name = ? WHERE id = ?", (v, &student_id))
            .map_err(|e| HandlerErr::db_update(e, "students"))?;
    }
    if let Some(v) = patch.get("firstName").and_then(|v| v.as_str()) {
        tx.execute("UPDATE students SET first_name = ? WHERE id = ?", (v, &student_id))
            .map_err(|e| HandlerErr::db_update(e, "students"))?;
    }
    if let Some(v) = patch.get("admissionNo").and_then(|v| v.as_str()) {
        tx.execute("UPDATE students SET admission_no = ? WHERE id = ?", (v, &student_id))
            .map_err(|e| HandlerErr::db_update(e, "students"))?;
    }
    if let Some(v) = patch.get("classLabel").and_then(|v| v.as_str()) {
        tx.execute("UPDATE students SET class_label = ? WHERE id = ?", (v, &student_id))
            .map_err(|e| HandlerErr::db_update(e, "students"))?;
    }
    if let Some(v) = patch.get("active").and_then(|v| v.as_bool()) {
        tx.execute(
            "UPDATE students SET active = ? WHERE id = ?",
            (v as i64, &student_id),
        )
        .map_err(|e| HandlerErr::db_update(e, "students"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "updated": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.update" => Some(with_conn(state, req, students_update)),
        _ => None,
    }
}
