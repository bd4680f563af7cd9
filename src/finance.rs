use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

/// Stored invoice states. `Overdue` is never written to the database; it is
/// derived against a reference date at read time (see `effective_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Unpaid,
    Partial,
    Paid,
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Unpaid => "unpaid",
            InvoiceStatus::Partial => "partial",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "partial" => InvoiceStatus::Partial,
            "paid" => InvoiceStatus::Paid,
            "overdue" => InvoiceStatus::Overdue,
            _ => InvoiceStatus::Unpaid,
        }
    }
}

/// Status implied by the paid/total pair alone.
pub fn derive_status(total_amount: Decimal, paid_amount: Decimal) -> InvoiceStatus {
    if paid_amount >= total_amount {
        InvoiceStatus::Paid
    } else if paid_amount > Decimal::ZERO {
        InvoiceStatus::Partial
    } else {
        InvoiceStatus::Unpaid
    }
}

/// Substitutes `overdue` for an open invoice whose due date has passed.
pub fn effective_status(stored: InvoiceStatus, due_date: NaiveDate, as_of: NaiveDate) -> InvoiceStatus {
    match stored {
        InvoiceStatus::Paid => InvoiceStatus::Paid,
        other => {
            if due_date < as_of {
                InvoiceStatus::Overdue
            } else {
                other
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutstandingInvoice {
    pub id: String,
    pub invoice_no: String,
    pub student_name: String,
    pub due_date: NaiveDate,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
}

impl OutstandingInvoice {
    pub fn pending_amount(&self) -> Decimal {
        self.total_amount - self.paid_amount
    }
}

#[derive(Debug, Clone)]
pub struct PaymentApplication {
    pub invoice_id: String,
    pub invoice_no: String,
    pub student_name: String,
    pub amount_applied: Decimal,
    pub resulting_status: InvoiceStatus,
}

#[derive(Debug, Clone)]
pub struct Distribution {
    pub breakdown: Vec<PaymentApplication>,
    pub distributed_amount: Decimal,
    pub remaining_balance: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinanceError {
    pub code: String,
    pub message: String,
}

impl FinanceError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Distributes one incoming payment across a family's outstanding invoices,
/// oldest due date first. Pure: computes the intended applications, persists
/// nothing.
///
/// Invariants:
/// - `distributed_amount + remaining_balance == amount` exactly;
/// - no application exceeds its invoice's pending amount;
/// - zero-amount applications are never emitted;
/// - ties on due date keep the caller's (creation) order.
pub fn distribute_payment(
    amount: Decimal,
    invoices: &[OutstandingInvoice],
) -> Result<Distribution, FinanceError> {
    if amount <= Decimal::ZERO {
        return Err(FinanceError::new(
            "invalid_amount",
            "payment amount must be positive",
        ));
    }

    let mut open: Vec<&OutstandingInvoice> = invoices
        .iter()
        .filter(|inv| inv.pending_amount() > Decimal::ZERO)
        .collect();
    // sort_by is stable, so equal due dates keep input order.
    open.sort_by(|a, b| a.due_date.cmp(&b.due_date));

    let mut remaining = amount;
    let mut breakdown = Vec::new();
    for inv in open {
        if remaining == Decimal::ZERO {
            break;
        }
        let pending = inv.pending_amount();
        let applied = remaining.min(pending);
        let resulting_status = if applied == pending {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::Partial
        };
        breakdown.push(PaymentApplication {
            invoice_id: inv.id.clone(),
            invoice_no: inv.invoice_no.clone(),
            student_name: inv.student_name.clone(),
            amount_applied: applied,
            resulting_status,
        });
        remaining -= applied;
    }

    Ok(Distribution {
        distributed_amount: amount - remaining,
        remaining_balance: remaining,
        breakdown,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountKind {
    Percent,
    Flat,
}

impl DiscountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountKind::Percent => "percent",
            DiscountKind::Flat => "flat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "percent" => Some(DiscountKind::Percent),
            "flat" => Some(DiscountKind::Flat),
            _ => None,
        }
    }
}

/// Applies a student's discounts to a gross invoice amount. Percent discounts
/// are taken against the gross (not compounded) and rounded to 2 dp; the
/// combined discount never exceeds the gross. Returns (net, discount_total).
pub fn apply_discounts(gross: Decimal, discounts: &[(DiscountKind, Decimal)]) -> (Decimal, Decimal) {
    let mut discount_total = Decimal::ZERO;
    for (kind, value) in discounts {
        match kind {
            DiscountKind::Percent => {
                discount_total += (gross * *value / Decimal::from(100)).round_dp(2);
            }
            DiscountKind::Flat => {
                discount_total += *value;
            }
        }
    }
    if discount_total > gross {
        discount_total = gross;
    }
    (gross - discount_total, discount_total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn inv(id: &str, due: &str, total: Decimal, paid: Decimal) -> OutstandingInvoice {
        OutstandingInvoice {
            id: id.to_string(),
            invoice_no: format!("INV-{}", id),
            student_name: format!("Student {}", id),
            due_date: NaiveDate::parse_from_str(due, "%Y-%m-%d").expect("date"),
            total_amount: total,
            paid_amount: paid,
        }
    }

    #[test]
    fn rejects_non_positive_amount() {
        let invoices = vec![inv("1", "2024-01-10", dec!(100), dec!(0))];
        assert!(distribute_payment(Decimal::ZERO, &invoices).is_err());
        assert!(distribute_payment(dec!(-5), &invoices).is_err());
        let e = distribute_payment(Decimal::ZERO, &invoices).unwrap_err();
        assert_eq!(e.code, "invalid_amount");
    }

    #[test]
    fn settles_oldest_invoice_first() {
        let invoices = vec![
            inv("2", "2024-02-10", dec!(150), dec!(0)),
            inv("1", "2024-01-10", dec!(100), dec!(0)),
        ];
        let d = distribute_payment(dec!(100), &invoices).unwrap();
        assert_eq!(d.breakdown.len(), 1);
        assert_eq!(d.breakdown[0].invoice_id, "1");
        assert_eq!(d.breakdown[0].amount_applied, dec!(100));
        assert_eq!(d.breakdown[0].resulting_status, InvoiceStatus::Paid);
        assert_eq!(d.distributed_amount, dec!(100));
        assert_eq!(d.remaining_balance, Decimal::ZERO);
    }

    #[test]
    fn splits_across_invoices_with_partial_tail() {
        let invoices = vec![
            inv("1", "2024-01-10", dec!(100), dec!(0)),
            inv("2", "2024-02-10", dec!(150), dec!(0)),
        ];
        let d = distribute_payment(dec!(120), &invoices).unwrap();
        assert_eq!(d.breakdown.len(), 2);
        assert_eq!(d.breakdown[0].amount_applied, dec!(100));
        assert_eq!(d.breakdown[0].resulting_status, InvoiceStatus::Paid);
        assert_eq!(d.breakdown[1].amount_applied, dec!(20));
        assert_eq!(d.breakdown[1].resulting_status, InvoiceStatus::Partial);
        assert_eq!(d.remaining_balance, Decimal::ZERO);
    }

    #[test]
    fn surplus_stays_unallocated() {
        let invoices = vec![
            inv("1", "2024-01-10", dec!(100), dec!(0)),
            inv("2", "2024-02-10", dec!(150), dec!(0)),
        ];
        let d = distribute_payment(dec!(500), &invoices).unwrap();
        assert_eq!(d.breakdown.len(), 2);
        assert!(d
            .breakdown
            .iter()
            .all(|a| a.resulting_status == InvoiceStatus::Paid));
        assert_eq!(d.distributed_amount, dec!(250));
        assert_eq!(d.remaining_balance, dec!(250));
    }

    #[test]
    fn empty_input_returns_full_balance() {
        let d = distribute_payment(dec!(50), &[]).unwrap();
        assert!(d.breakdown.is_empty());
        assert_eq!(d.distributed_amount, Decimal::ZERO);
        assert_eq!(d.remaining_balance, dec!(50));
    }

    #[test]
    fn skips_zero_pending_entries() {
        let invoices = vec![
            inv("1", "2024-01-10", dec!(100), dec!(100)),
            inv("2", "2024-02-10", dec!(150), dec!(50)),
        ];
        let d = distribute_payment(dec!(60), &invoices).unwrap();
        assert_eq!(d.breakdown.len(), 1);
        assert_eq!(d.breakdown[0].invoice_id, "2");
        assert_eq!(d.breakdown[0].amount_applied, dec!(60));
        assert_eq!(d.breakdown[0].resulting_status, InvoiceStatus::Partial);
    }

    #[test]
    fn due_date_ties_keep_creation_order() {
        let invoices = vec![
            inv("a", "2024-03-01", dec!(40), dec!(0)),
            inv("b", "2024-03-01", dec!(40), dec!(0)),
        ];
        let d = distribute_payment(dec!(50), &invoices).unwrap();
        assert_eq!(d.breakdown[0].invoice_id, "a");
        assert_eq!(d.breakdown[1].invoice_id, "b");
        assert_eq!(d.breakdown[1].amount_applied, dec!(10));
    }

    #[test]
    fn conservation_holds_exactly() {
        let invoices = vec![
            inv("1", "2024-01-10", dec!(33.33), dec!(0)),
            inv("2", "2024-01-20", dec!(66.67), dec!(12.01)),
            inv("3", "2024-02-01", dec!(10.10), dec!(0)),
        ];
        for amount in [dec!(0.01), dec!(33.33), dec!(50.55), dec!(1000)] {
            let d = distribute_payment(amount, &invoices).unwrap();
            assert_eq!(d.distributed_amount + d.remaining_balance, amount);
            for (app, src) in d.breakdown.iter().zip(invoices.iter()) {
                assert!(app.amount_applied <= src.pending_amount());
            }
        }
    }

    #[test]
    fn identical_inputs_give_identical_output() {
        let invoices = vec![
            inv("1", "2024-01-10", dec!(100), dec!(25)),
            inv("2", "2024-02-10", dec!(150), dec!(0)),
        ];
        let a = distribute_payment(dec!(90), &invoices).unwrap();
        let b = distribute_payment(dec!(90), &invoices).unwrap();
        assert_eq!(a.breakdown.len(), b.breakdown.len());
        for (x, y) in a.breakdown.iter().zip(b.breakdown.iter()) {
            assert_eq!(x.invoice_id, y.invoice_id);
            assert_eq!(x.amount_applied, y.amount_applied);
        }
    }

    #[test]
    fn discounts_combine_and_clamp() {
        let (net, total) = apply_discounts(
            dec!(1000),
            &[(DiscountKind::Percent, dec!(10)), (DiscountKind::Flat, dec!(50))],
        );
        assert_eq!(total, dec!(150));
        assert_eq!(net, dec!(850));

        let (net, total) = apply_discounts(dec!(100), &[(DiscountKind::Flat, dec!(500))]);
        assert_eq!(total, dec!(100));
        assert_eq!(net, Decimal::ZERO);
    }

    #[test]
    fn percent_discount_rounds_to_cents() {
        let (net, total) = apply_discounts(dec!(999.99), &[(DiscountKind::Percent, dec!(7.5))]);
        assert_eq!(total, dec!(75.00));
        assert_eq!(net, dec!(924.99));
    }

    #[test]
    fn status_derivation() {
        assert_eq!(derive_status(dec!(100), dec!(0)), InvoiceStatus::Unpaid);
        assert_eq!(derive_status(dec!(100), dec!(40)), InvoiceStatus::Partial);
        assert_eq!(derive_status(dec!(100), dec!(100)), InvoiceStatus::Paid);

        let due = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let before = NaiveDate::from_ymd_opt(2024, 1, 9).unwrap();
        let after = NaiveDate::from_ymd_opt(2024, 1, 11).unwrap();
        assert_eq!(
            effective_status(InvoiceStatus::Unpaid, due, after),
            InvoiceStatus::Overdue
        );
        assert_eq!(
            effective_status(InvoiceStatus::Unpaid, due, before),
            InvoiceStatus::Unpaid
        );
        assert_eq!(
            effective_status(InvoiceStatus::Paid, due, after),
            InvoiceStatus::Paid
        );
    }
}
