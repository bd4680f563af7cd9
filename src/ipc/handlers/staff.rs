use crate::ipc::helpers::{
    get_optional_str, get_required_str, require_school, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn staff_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;

    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    let role = get_required_str(params, "role")?.trim().to_string();
    if last_name.is_empty() || first_name.is_empty() || role.is_empty() {
        return Err(HandlerErr::bad_params("lastName, firstName, role must not be empty"));
    }
    let phone = get_optional_str(params, "phone");

    let staff_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO staff(id, school_id, last_name, first_name, role, phone, active)
         VALUES(?, ?, ?, ?, ?, ?, 1)",
        (&staff_id, &school_id, &last_name, &first_name, &role, &phone),
    )
    .map_err(|e| HandlerErr::db_update(e, "staff"))?;

    Ok(json!({ "staffId": staff_id }))
}

fn staff_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let role = get_optional_str(params, "role");

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, role, phone, active
             FROM staff
             WHERE school_id = ? AND (?2 IS NULL OR role = ?2)
             ORDER BY last_name, first_name",
        )
        .map_err(HandlerErr::db)?;
    let staff = stmt
        .query_map((&school_id, &role), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "lastName": row.get::<_, String>(1)?,
                "firstName": row.get::<_, String>(2)?,
                "role": row.get::<_, String>(3)?,
                "phone": row.get::<_, Option<String>>(4)?,
                "active": row.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "staff": staff }))
}

fn staff_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let staff_id = get_required_str(params, "staffId")?;

    let exists = conn
        .query_row(
            "SELECT 1 FROM staff WHERE school_id = ? AND id = ?",
            (&school_id, &staff_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if !exists {
        return Err(HandlerErr::not_found("staff member not found"));
    }

    let Some(patch) = params.get("patch") else {
        return Err(HandlerErr::bad_params("missing patch"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Some(v) = patch.get("role").and_then(|v| v.as_str()) {
        tx.execute("UPDATE staff SET role = ? WHERE id = ?", (v, &staff_id))
            .map_err(|e| HandlerErr::db_update(e, "staff"))?;
    }
    if let Some(v) = patch.get("phone").and_then(|v| v.as_str()) {
        tx.execute("UPDATE staff SET phone = ? WHERE id = ?", (v, &staff_id))
            .map_err(|e| HandlerErr::db_update(e, "staff"))?;
    }
    if let Some(v) = patch.get("active").and_then(|v| v.as_bool()) {
        tx.execute(
            "UPDATE staff SET active = ? WHERE id = ?",
            (v as i64, &staff_id),
        )
        .map_err(|e| HandlerErr::db_update(e, "staff"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "updated": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "staff.create" => Some(with_conn(state, req, staff_create)),
        "staff.list" => Some(with_conn(state, req, staff_list)),
        "staff.update" => Some(with_conn(state, req, staff_update)),
        _ => None,
    }
}
