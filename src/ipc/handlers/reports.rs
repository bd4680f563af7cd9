use crate::finance::{self, InvoiceStatus};
use crate::ipc::helpers::{
    date_column, decimal_column, get_optional_date, get_required_str, require_school, today,
    with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::BTreeMap;

// Amounts live in TEXT columns, so these aggregates are in-memory Decimal
// reductions rather than SQL SUMs.

fn dashboard(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let as_of = get_optional_date(params, "asOf")?.unwrap_or_else(today);

    let count = |sql: &str| -> Result<i64, HandlerErr> {
        conn.query_row(sql, [&school_id], |r| r.get(0))
            .map_err(HandlerErr::db)
    };
    let student_count = count("SELECT COUNT(*) FROM students WHERE school_id = ? AND active = 1")?;
    let staff_count = count("SELECT COUNT(*) FROM staff WHERE school_id = ? AND active = 1")?;
    let parent_count = count("SELECT COUNT(*) FROM parents WHERE school_id = ?")?;

    let mut stmt = conn
        .prepare(
            "SELECT total_amount, paid_amount, due_date, status
             FROM invoices WHERE school_id = ?",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&school_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut invoiced = Decimal::ZERO;
    let mut collected = Decimal::ZERO;
    let mut outstanding = Decimal::ZERO;
    let mut overdue_count = 0i64;
    for (total_raw, paid_raw, due_raw, status_raw) in rows {
        let total = decimal_column(&total_raw)?;
        let paid = decimal_column(&paid_raw)?;
        invoiced += total;
        collected += paid;
        outstanding += total - paid;
        let effective = finance::effective_status(
            InvoiceStatus::from_str(&status_raw),
            date_column(&due_raw)?,
            as_of,
        );
        if effective == InvoiceStatus::Overdue {
            overdue_count += 1;
        }
    }

    Ok(json!({
        "asOf": as_of.format("%Y-%m-%d").to_string(),
        "studentCount": student_count,
        "staffCount": staff_count,
        "parentCount": parent_count,
        "fees": {
            "invoicedAmount": invoiced.to_string(),
            "collectedAmount": collected.to_string(),
            "outstandingAmount": outstanding.to_string(),
            "overdueInvoiceCount": overdue_count,
        }
    }))
}

fn dues_summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT COALESCE(s.class_label, ''), i.total_amount, i.paid_amount
             FROM invoices i
             JOIN students s ON s.id = i.student_id
             WHERE i.school_id = ?",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&school_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    struct Bucket {
        invoice_count: i64,
        total: Decimal,
        paid: Decimal,
    }

    let mut by_class: BTreeMap<String, Bucket> = BTreeMap::new();
    for (class_label, total_raw, paid_raw) in rows {
        let bucket = by_class.entry(class_label).or_insert(Bucket {
            invoice_count: 0,
            total: Decimal::ZERO,
            paid: Decimal::ZERO,
        });
        bucket.invoice_count += 1;
        bucket.total += decimal_column(&total_raw)?;
        bucket.paid += decimal_column(&paid_raw)?;
    }

    let groups: Vec<serde_json::Value> = by_class
        .iter()
        .map(|(class_label, b)| {
            json!({
                "classLabel": if class_label.is_empty() { serde_json::Value::Null } else { json!(class_label) },
                "invoiceCount": b.invoice_count,
                "totalAmount": b.total.to_string(),
                "paidAmount": b.paid.to_string(),
                "pendingAmount": (b.total - b.paid).to_string(),
            })
        })
        .collect();

    Ok(json!({ "groups": groups }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.dashboard" => Some(with_conn(state, req, dashboard)),
        "reports.duesSummary" => Some(with_conn(state, req, dues_summary)),
        _ => None,
    }
}
