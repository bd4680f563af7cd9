use crate::ipc::helpers::{get_optional_str, get_required_str, today, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn schools_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let academic_year = get_optional_str(params, "academicYear");

    let school_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schools(id, name, academic_year, created_at) VALUES(?, ?, ?, ?)",
        (
            &school_id,
            &name,
            &academic_year,
            today().format("%Y-%m-%d").to_string(),
        ),
    )
    .map_err(|e| HandlerErr::db_update(e, "schools"))?;

    Ok(json!({ "schoolId": school_id, "name": name }))
}

fn schools_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = conn
        .prepare(
            "SELECT
               sc.id,
               sc.name,
               sc.academic_year,
               (SELECT COUNT(*) FROM students s WHERE s.school_id = sc.id) AS student_count,
               (SELECT COUNT(*) FROM staff st WHERE st.school_id = sc.id) AS staff_count,
               (SELECT COUNT(*) FROM parents p WHERE p.school_id = sc.id) AS parent_count
             FROM schools sc
             ORDER BY sc.name",
        )
        .map_err(HandlerErr::db)?;

    let schools = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "academicYear": row.get::<_, Option<String>>(2)?,
                "studentCount": row.get::<_, i64>(3)?,
                "staffCount": row.get::<_, i64>(4)?,
                "parentCount": row.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "schools": schools }))
}

fn schools_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM schools WHERE id = ?", [&school_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("school not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    let statements: &[(&str, &str)] = &[
        ("payments", "DELETE FROM payments WHERE school_id = ?"),
        (
            "invoice_lines",
            "DELETE FROM invoice_lines WHERE invoice_id IN (SELECT id FROM invoices WHERE school_id = ?)",
        ),
        ("invoices", "DELETE FROM invoices WHERE school_id = ?"),
        (
            "student_discounts",
            "DELETE FROM student_discounts WHERE student_id IN (SELECT id FROM students WHERE school_id = ?)",
        ),
        ("discounts", "DELETE FROM discounts WHERE school_id = ?"),
        ("fee_heads", "DELETE FROM fee_heads WHERE school_id = ?"),
        (
            "exam_marks",
            "DELETE FROM exam_marks WHERE exam_subject_id IN (
               SELECT es.id FROM exam_subjects es
               JOIN exams e ON e.id = es.exam_id
               WHERE e.school_id = ?
             )",
        ),
        (
            "exam_subjects",
            "DELETE FROM exam_subjects WHERE exam_id IN (SELECT id FROM exams WHERE school_id = ?)",
        ),
        ("exams", "DELETE FROM exams WHERE school_id = ?"),
        ("attendance_days", "DELETE FROM attendance_days WHERE school_id = ?"),
        (
            "kinships",
            "DELETE FROM kinships WHERE parent_id IN (SELECT id FROM parents WHERE school_id = ?)",
        ),
        ("parents", "DELETE FROM parents WHERE school_id = ?"),
        ("staff", "DELETE FROM staff WHERE school_id = ?"),
        ("students", "DELETE FROM students WHERE school_id = ?"),
        ("counters", "DELETE FROM counters WHERE school_id = ?"),
        ("schools", "DELETE FROM schools WHERE id = ?"),
    ];
    for (table, sql) in statements {
        if let Err(e) = tx.execute(sql, [&school_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::db_update(e, table));
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schools.create" => Some(with_conn(state, req, schools_create)),
        "schools.list" => Some(with_conn(state, req, |c, _| schools_list(c))),
        "schools.delete" => Some(with_conn(state, req, schools_delete)),
        _ => None,
    }
}
