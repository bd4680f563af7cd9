use crate::finance::{self, DiscountKind, InvoiceStatus};
use crate::ipc::helpers::{
    date_column, decimal_column, get_optional_date, get_optional_str, get_required_amount,
    get_required_date, get_required_str, next_counter, require_school, today, with_conn,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

fn fee_heads_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let amount = get_required_amount(params, "amount")?;
    if amount < Decimal::ZERO {
        return Err(HandlerErr::bad_params("amount must not be negative"));
    }

    conn.execute(
        "INSERT INTO fee_heads(id, school_id, name, amount)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(school_id, name) DO UPDATE SET amount = excluded.amount",
        (
            Uuid::new_v4().to_string(),
            &school_id,
            &name,
            amount.to_string(),
        ),
    )
    .map_err(|e| HandlerErr::db_update(e, "fee_heads"))?;

    Ok(json!({ "name": name, "amount": amount.to_string() }))
}

fn fee_heads_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;

    let mut stmt = conn
        .prepare("SELECT id, name, amount FROM fee_heads WHERE school_id = ? ORDER BY name")
        .map_err(HandlerErr::db)?;
    let heads = stmt
        .query_map([&school_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "amount": row.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "feeHeads": heads }))
}

fn discounts_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let kind_raw = get_required_str(params, "kind")?;
    let Some(kind) = DiscountKind::parse(&kind_raw) else {
        return Err(HandlerErr::bad_params("kind must be percent or flat"));
    };
    let value = get_required_amount(params, "value")?;
    if value < Decimal::ZERO {
        return Err(HandlerErr::bad_params("value must not be negative"));
    }
    if kind == DiscountKind::Percent && value > Decimal::from(100) {
        return Err(HandlerErr::bad_params("percent value must not exceed 100"));
    }

    let discount_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO discounts(id, school_id, name, kind, value) VALUES(?, ?, ?, ?, ?)",
        (
            &discount_id,
            &school_id,
            &name,
            kind.as_str(),
            value.to_string(),
        ),
    )
    .map_err(|e| HandlerErr::db_update(e, "discounts"))?;

    Ok(json!({ "discountId": discount_id }))
}

fn discounts_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT
               d.id, d.name, d.kind, d.value,
               (SELECT COUNT(*) FROM student_discounts sd WHERE sd.discount_id = d.id)
             FROM discounts d
             WHERE d.school_id = ?
             ORDER BY d.name",
        )
        .map_err(HandlerErr::db)?;
    let discounts = stmt
        .query_map([&school_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "kind": row.get::<_, String>(2)?,
                "value": row.get::<_, String>(3)?,
                "assignedCount": row.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "discounts": discounts }))
}

fn discounts_assign(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let student_id = get_required_str(params, "studentId")?;
    let discount_id = get_required_str(params, "discountId")?;

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
    let discount_exists = conn
        .query_row(
            "SELECT 1 FROM discounts WHERE school_id = ? AND id = ?",
            (&school_id, &discount_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if !discount_exists {
        return Err(HandlerErr::not_found("discount not found"));
    }

    conn.execute(
        "INSERT INTO student_discounts(student_id, discount_id) VALUES(?, ?)
         ON CONFLICT(student_id, discount_id) DO NOTHING",
        (&student_id, &discount_id),
    )
    .map_err(|e| HandlerErr::db_update(e, "student_discounts"))?;

    Ok(json!({ "assigned": true }))
}

fn student_discounts(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<(DiscountKind, Decimal)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT d.kind, d.value
             FROM student_discounts sd
             JOIN discounts d ON d.id = sd.discount_id
             WHERE sd.student_id = ?
             ORDER BY d.name",
        )
        .map_err(HandlerErr::db)?;
    let raw = stmt
        .query_map([student_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut out = Vec::with_capacity(raw.len());
    for (kind_raw, value_raw) in raw {
        let Some(kind) = DiscountKind::parse(&kind_raw) else {
            return Err(HandlerErr::new(
                "db_corrupt_discount",
                format!("unknown discount kind: {}", kind_raw),
            ));
        };
        out.push((kind, decimal_column(&value_raw)?));
    }
    Ok(out)
}

fn invoices_generate(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let period = get_required_str(params, "period")?.trim().to_string();
    if period.is_empty() {
        return Err(HandlerErr::bad_params("period must not be empty"));
    }
    let due_date = get_required_date(params, "dueDate")?.format("%Y-%m-%d").to_string();

    let mut head_stmt = conn
        .prepare("SELECT name, amount FROM fee_heads WHERE school_id = ? ORDER BY name")
        .map_err(HandlerErr::db)?;
    let heads = head_stmt
        .query_map([&school_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    if heads.is_empty() {
        return Err(HandlerErr::new(
            "no_fee_heads",
            "configure fee heads before generating invoices",
        ));
    }
    let mut lines = Vec::with_capacity(heads.len());
    let mut gross = Decimal::ZERO;
    for (name, amount_raw) in heads {
        let amount = decimal_column(&amount_raw)?;
        gross += amount;
        lines.push((name, amount));
    }

    let mut student_stmt = conn
        .prepare(
            "SELECT id FROM students
             WHERE school_id = ? AND active = 1
               AND id NOT IN (
                 SELECT student_id FROM invoices WHERE school_id = ?1 AND period = ?2
               )
             ORDER BY rowid",
        )
        .map_err(HandlerErr::db)?;
    let student_ids = student_stmt
        .query_map((&school_id, &period), |row| row.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let active_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE school_id = ? AND active = 1",
            [&school_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let created_at = today().format("%Y-%m-%d").to_string();
    let mut created = 0usize;
    for student_id in &student_ids {
        let discounts = student_discounts(&tx, student_id)?;
        let (net, discount_total) = finance::apply_discounts(gross, &discounts);
        let seq = next_counter(&tx, &school_id, "invoice")?;
        let invoice_no = format!("INV-{:05}", seq);
        let invoice_id = Uuid::new_v4().to_string();
        let status = finance::derive_status(net, Decimal::ZERO);
        tx.execute(
            "INSERT INTO invoices(
               id, school_id, student_id, invoice_no, period, due_date,
               gross_amount, discount_amount, total_amount, paid_amount, status, created_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, '0', ?, ?)",
            (
                &invoice_id,
                &school_id,
                student_id,
                &invoice_no,
                &period,
                &due_date,
                gross.to_string(),
                discount_total.to_string(),
                net.to_string(),
                status.as_str(),
                &created_at,
            ),
        )
        .map_err(|e| HandlerErr::db_update(e, "invoices"))?;
        for (name, amount) in &lines {
            tx.execute(
                "INSERT INTO invoice_lines(id, invoice_id, fee_head_name, amount)
                 VALUES(?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &invoice_id,
                    name,
                    amount.to_string(),
                ),
            )
            .map_err(|e| HandlerErr::db_update(e, "invoice_lines"))?;
        }
        created += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "createdCount": created,
        "skippedCount": active_count - created as i64,
        "period": period,
    }))
}

fn invoices_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let student_filter = get_optional_str(params, "studentId");
    let status_filter = get_optional_str(params, "status");
    let as_of = get_optional_date(params, "asOf")?.unwrap_or_else(today);

    let mut stmt = conn
        .prepare(
            "SELECT i.id, i.invoice_no, i.period, i.due_date,
                    i.gross_amount, i.discount_amount, i.total_amount, i.paid_amount,
                    i.status, s.last_name, s.first_name, i.student_id
             FROM invoices i
             JOIN students s ON s.id = i.student_id
             WHERE i.school_id = ?
               AND (?2 IS NULL OR i.student_id = ?2)
             ORDER BY i.due_date, i.rowid",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map((&school_id, &student_filter), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
                row.get::<_, String>(11)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut invoices = Vec::new();
    for (id, invoice_no, period, due_raw, gross, discount, total_raw, paid_raw, status_raw, last, first, student_id) in rows {
        let due_date = date_column(&due_raw)?;
        let total = decimal_column(&total_raw)?;
        let paid = decimal_column(&paid_raw)?;
        let stored = InvoiceStatus::from_str(&status_raw);
        let effective = finance::effective_status(stored, due_date, as_of);
        if let Some(ref want) = status_filter {
            if effective.as_str() != want {
                continue;
            }
        }
        invoices.push(json!({
            "id": id,
            "invoiceNo": invoice_no,
            "studentId": student_id,
            "student": format!("{}, {}", last, first),
            "period": period,
            "dueDate": due_raw,
            "grossAmount": gross,
            "discountAmount": discount,
            "totalAmount": total_raw,
            "paidAmount": paid_raw,
            "pendingAmount": (total - paid).to_string(),
            "status": effective.as_str(),
        }));
    }

    Ok(json!({ "asOf": as_of.format("%Y-%m-%d").to_string(), "invoices": invoices }))
}

fn invoices_outstanding(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let parent_id = get_required_str(params, "parentId")?;

    let parent_exists = conn
        .query_row(
            "SELECT 1 FROM parents WHERE school_id = ? AND id = ?",
            (&school_id, &parent_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if !parent_exists {
        return Err(HandlerErr::not_found("parent not found"));
    }

    let open = fetch_outstanding_for_parent(conn, &school_id, &parent_id)?;
    let invoices: Vec<serde_json::Value> = open
        .iter()
        .map(|inv| {
            json!({
                "id": inv.id,
                "invoiceNo": inv.invoice_no,
                "student": inv.student_name,
                "dueDate": inv.due_date.format("%Y-%m-%d").to_string(),
                "totalAmount": inv.total_amount.to_string(),
                "paidAmount": inv.paid_amount.to_string(),
                "pendingAmount": inv.pending_amount().to_string(),
            })
        })
        .collect();

    Ok(json!({ "invoices": invoices }))
}

/// All of a parent's children's open invoices, oldest due date first, ties by
/// creation order. This is the allocator's input ordering.
pub fn fetch_outstanding_for_parent(
    conn: &Connection,
    school_id: &str,
    parent_id: &str,
) -> Result<Vec<finance::OutstandingInvoice>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT i.id, i.invoice_no, s.last_name, s.first_name, i.due_date,
                    i.total_amount, i.paid_amount
             FROM invoices i
             JOIN students s ON s.id = i.student_id
             JOIN kinships k ON k.student_id = s.id
             WHERE k.parent_id = ? AND i.school_id = ? AND i.status != 'paid'
             ORDER BY i.due_date, i.rowid",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map((parent_id, school_id), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut out = Vec::with_capacity(rows.len());
    for (id, invoice_no, last, first, due_raw, total_raw, paid_raw) in rows {
        let inv = finance::OutstandingInvoice {
            id,
            invoice_no,
            student_name: format!("{}, {}", last, first),
            due_date: date_column(&due_raw)?,
            total_amount: decimal_column(&total_raw)?,
            paid_amount: decimal_column(&paid_raw)?,
        };
        if inv.pending_amount() > Decimal::ZERO {
            out.push(inv);
        }
    }
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "feeHeads.upsert" => Some(with_conn(state, req, fee_heads_upsert)),
        "feeHeads.list" => Some(with_conn(state, req, fee_heads_list)),
        "discounts.create" => Some(with_conn(state, req, discounts_create)),
        "discounts.list" => Some(with_conn(state, req, discounts_list)),
        "discounts.assign" => Some(with_conn(state, req, discounts_assign)),
        "invoices.generate" => Some(with_conn(state, req, invoices_generate)),
        "invoices.list" => Some(with_conn(state, req, invoices_list)),
        "invoices.outstanding" => Some(with_conn(state, req, invoices_outstanding)),
        _ => None,
    }
}
