use crate::finance;
use crate::ipc::handlers::fees::fetch_outstanding_for_parent;
use crate::ipc::helpers::{
    decimal_column, get_optional_str, get_required_amount, get_required_str, next_counter,
    require_school, today, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

fn insert_challan(
    conn: &Connection,
    school_id: &str,
    invoice_id: &str,
    amount: Decimal,
    method: &str,
    remarks: &Option<String>,
) -> Result<String, HandlerErr> {
    let seq = next_counter(conn, school_id, "challan")?;
    let challan_no = format!("CHN-{:06}", seq);
    conn.execute(
        "INSERT INTO payments(id, school_id, invoice_id, challan_no, amount, method, remarks, paid_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            school_id,
            invoice_id,
            &challan_no,
            amount.to_string(),
            method,
            remarks,
            today().format("%Y-%m-%d").to_string(),
        ),
    )
    .map_err(|e| HandlerErr::db_update(e, "payments"))?;
    Ok(challan_no)
}

fn apply_to_invoice(
    conn: &Connection,
    invoice_id: &str,
    new_paid: Decimal,
    status: finance::InvoiceStatus,
) -> Result<(), HandlerErr> {
    conn.execute(
        "UPDATE invoices SET paid_amount = ?, status = ? WHERE id = ?",
        (new_paid.to_string(), status.as_str(), invoice_id),
    )
    .map_err(|e| HandlerErr::db_update(e, "invoices"))?;
    Ok(())
}

fn payments_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let invoice_id = get_required_str(params, "invoiceId")?;
    let amount = get_required_amount(params, "amount")?;
    let method = get_required_str(params, "method")?;
    let remarks = get_optional_str(params, "remarks");

    if amount <= Decimal::ZERO {
        return Err(HandlerErr::new(
            "invalid_amount",
            "payment amount must be positive",
        ));
    }

    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT total_amount, paid_amount FROM invoices WHERE school_id = ? AND id = ?",
            (&school_id, &invoice_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((total_raw, paid_raw)) = row else {
        return Err(HandlerErr::not_found("invoice not found"));
    };
    let total = decimal_column(&total_raw)?;
    let paid = decimal_column(&paid_raw)?;
    let pending = total - paid;

    // A single-invoice payment has nowhere to put a surplus; reject instead.
    if amount > pending {
        return Err(HandlerErr {
            code: "over_payment",
            message: format!("amount exceeds pending balance of {}", pending),
            details: Some(json!({ "pendingAmount": pending.to_string() })),
        });
    }

    let new_paid = paid + amount;
    let status = finance::derive_status(total, new_paid);

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let challan_no = insert_challan(&tx, &school_id, &invoice_id, amount, &method, &remarks)?;
    apply_to_invoice(&tx, &invoice_id, new_paid, status)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "challanNo": challan_no,
        "paidAmount": new_paid.to_string(),
        "pendingAmount": (total - new_paid).to_string(),
        "status": status.as_str(),
    }))
}

/// Lump-sum distribution across a parent's outstanding invoices: run the pure
/// allocator, then persist one challan per application in one transaction.
fn payments_distribute(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let parent_id = get_required_str(params, "parentId")?;
    let amount = get_required_amount(params, "amount")?;
    let method = get_required_str(params, "method")?;
    let remarks = get_optional_str(params, "remarks");

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

    let outstanding = fetch_outstanding_for_parent(conn, &school_id, &parent_id)?;
    let distribution = finance::distribute_payment(amount, &outstanding)
        .map_err(|e| HandlerErr::new("invalid_amount", e.message))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut breakdown = Vec::with_capacity(distribution.breakdown.len());
    for app in &distribution.breakdown {
        let challan_no =
            insert_challan(&tx, &school_id, &app.invoice_id, app.amount_applied, &method, &remarks)?;
        let (total_raw, paid_raw): (String, String) = tx
            .query_row(
                "SELECT total_amount, paid_amount FROM invoices WHERE id = ?",
                [&app.invoice_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(HandlerErr::db)?;
        let total = decimal_column(&total_raw)?;
        let new_paid = decimal_column(&paid_raw)? + app.amount_applied;
        // Rederiving from the stored row agrees with the allocator's verdict
        // and guards against a stale snapshot.
        let status = finance::derive_status(total, new_paid);
        apply_to_invoice(&tx, &app.invoice_id, new_paid, status)?;
        breakdown.push(json!({
            "invoiceId": app.invoice_id,
            "invoiceNo": app.invoice_no,
            "student": app.student_name,
            "challanNo": challan_no,
            "paid": app.amount_applied.to_string(),
            "status": app.resulting_status.as_str(),
        }));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "distributedAmount": distribution.distributed_amount.to_string(),
        "remainingBalance": distribution.remaining_balance.to_string(),
        "breakdown": breakdown,
    }))
}

fn payments_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let invoice_filter = get_optional_str(params, "invoiceId");
    let student_filter = get_optional_str(params, "studentId");

    let mut stmt = conn
        .prepare(
            "SELECT p.challan_no, p.invoice_id, i.invoice_no, p.amount, p.method, p.remarks, p.paid_at
             FROM payments p
             JOIN invoices i ON i.id = p.invoice_id
             WHERE p.school_id = ?
               AND (?2 IS NULL OR p.invoice_id = ?2)
               AND (?3 IS NULL OR i.student_id = ?3)
             ORDER BY p.rowid",
        )
        .map_err(HandlerErr::db)?;
    let challans = stmt
        .query_map((&school_id, &invoice_filter, &student_filter), |row| {
            Ok(json!({
                "challanNo": row.get::<_, String>(0)?,
                "invoiceId": row.get::<_, String>(1)?,
                "invoiceNo": row.get::<_, String>(2)?,
                "amount": row.get::<_, String>(3)?,
                "method": row.get::<_, String>(4)?,
                "remarks": row.get::<_, Option<String>>(5)?,
                "paidAt": row.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "challans": challans }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.record" => Some(with_conn(state, req, payments_record)),
        "payments.distribute" => Some(with_conn(state, req, payments_distribute)),
        "payments.list" => Some(with_conn(state, req, payments_list)),
        _ => None,
    }
}
