use crate::ipc::helpers::{
    decimal_column, get_optional_bool, get_optional_str, get_required_str, require_school,
    with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

fn parents_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;

    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    if last_name.is_empty() || first_name.is_empty() {
        return Err(HandlerErr::bad_params("names must not be empty"));
    }
    let phone = get_optional_str(params, "phone");
    let email = get_optional_str(params, "email");

    let parent_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO parents(id, school_id, last_name, first_name, phone, email)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&parent_id, &school_id, &last_name, &first_name, &phone, &email),
    )
    .map_err(|e| HandlerErr::db_update(e, "parents"))?;

    Ok(json!({ "parentId": parent_id }))
}

fn parents_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT
               p.id, p.last_name, p.first_name, p.phone, p.email,
               (SELECT COUNT(*) FROM kinships k WHERE k.parent_id = p.id) AS child_count
             FROM parents p
             WHERE p.school_id = ?
             ORDER BY p.last_name, p.first_name",
        )
        .map_err(HandlerErr::db)?;
    let parents = stmt
        .query_map([&school_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "lastName": row.get::<_, String>(1)?,
                "firstName": row.get::<_, String>(2)?,
                "phone": row.get::<_, Option<String>>(3)?,
                "email": row.get::<_, Option<String>>(4)?,
                "childCount": row.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "parents": parents }))
}

fn parent_exists(conn: &Connection, school_id: &str, parent_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM parents WHERE school_id = ? AND id = ?",
        (school_id, parent_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

fn kinship_link(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let parent_id = get_required_str(params, "parentId")?;
    let student_id = get_required_str(params, "studentId")?;
    let relationship = get_required_str(params, "relationship")?.trim().to_string();
    if relationship.is_empty() {
        return Err(HandlerErr::bad_params("relationship must not be empty"));
    }
    let primary_contact = get_optional_bool(params, "primaryContact").unwrap_or(false);

    if !parent_exists(conn, &school_id, &parent_id)? {
        return Err(HandlerErr::not_found("parent not found"));
    }
    let student_exists = conn
        .query_row(
            "SELECT 1 FROM students WHERE school_id = ? AND id = ?",
            (&school_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if !student_exists {
        return Err(HandlerErr::not_found("student not found"));
    }

    conn.execute(
        "INSERT INTO kinships(parent_id, student_id, relationship, primary_contact)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(parent_id, student_id) DO UPDATE SET
           relationship = excluded.relationship,
           primary_contact = excluded.primary_contact",
        (&parent_id, &student_id, &relationship, primary_contact as i64),
    )
    .map_err(|e| HandlerErr::db_update(e, "kinships"))?;

    Ok(json!({ "linked": true }))
}

fn kinship_unlink(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let parent_id = get_required_str(params, "parentId")?;
    let student_id = get_required_str(params, "studentId")?;

    if !parent_exists(conn, &school_id, &parent_id)? {
        return Err(HandlerErr::not_found("parent not found"));
    }
    let removed = conn
        .execute(
            "DELETE FROM kinships WHERE parent_id = ? AND student_id = ?",
            (&parent_id, &student_id),
        )
        .map_err(|e| HandlerErr::db_update(e, "kinships"))?;

    Ok(json!({ "unlinked": removed > 0 }))
}

fn parents_children(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let parent_id = get_required_str(params, "parentId")?;
    if !parent_exists(conn, &school_id, &parent_id)? {
        return Err(HandlerErr::not_found("parent not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name, s.class_label, s.active,
                    k.relationship, k.primary_contact
             FROM kinships k
             JOIN students s ON s.id = k.student_id
             WHERE k.parent_id = ?
             ORDER BY s.last_name, s.first_name",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&parent_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)? != 0,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut pending_stmt = conn
        .prepare(
            "SELECT total_amount, paid_amount FROM invoices
             WHERE student_id = ? AND status != 'paid'",
        )
        .map_err(HandlerErr::db)?;

    let mut children = Vec::new();
    for (id, last, first, class_label, active, relationship, primary_contact) in rows {
        let amounts = pending_stmt
            .query_map([&id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?;
        let mut outstanding = Decimal::ZERO;
        for (total_raw, paid_raw) in amounts {
            outstanding += decimal_column(&total_raw)? - decimal_column(&paid_raw)?;
        }
        children.push(json!({
            "studentId": id,
            "displayName": format!("{}, {}", last, first),
            "classLabel": class_label,
            "active": active,
            "relationship": relationship,
            "primaryContact": primary_contact,
            "outstandingAmount": outstanding.to_string(),
        }));
    }

    Ok(json!({ "children": children }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "parents.create" => Some(with_conn(state, req, parents_create)),
        "parents.list" => Some(with_conn(state, req, parents_list)),
        "parents.children" => Some(with_conn(state, req, parents_children)),
        "kinship.link" => Some(with_conn(state, req, kinship_link)),
        "kinship.unlink" => Some(with_conn(state, req, kinship_unlink)),
        _ => None,
    }
}
