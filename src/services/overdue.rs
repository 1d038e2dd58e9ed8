use chrono::NaiveDate;
use sqlx::PgPool;

use crate::{error::AppResult, repository::table_service::map_db_error};

/// Flip pending installments of live, active contracts to `overdue` once their
/// due date has passed. Returns the number of rows changed.
pub async fn mark_overdue_installments(pool: &PgPool, today: NaiveDate) -> AppResult<u64> {
    let result = sqlx::query(
        "UPDATE installments i
         SET status = 'overdue'
         FROM contracts c
         WHERE c.id = i.contract_id
           AND c.deleted_at IS NULL
           AND c.status = 'active'
           AND i.status = 'pending'
           AND i.due_date < $1",
    )
    .bind(today)
    .execute(pool)
    .await
    .map_err(map_db_error)?;

    Ok(result.rows_affected())
}

/// Status an installment should carry after its paid amount changes.
pub fn installment_status_for(
    amount: f64,
    paid_amount: f64,
    due_date: Option<NaiveDate>,
    today: NaiveDate,
) -> &'static str {
    if crate::values::money_eq(paid_amount, amount) || paid_amount > amount {
        return "paid";
    }
    match due_date {
        Some(due) if due < today => "overdue",
        _ => "pending",
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::installment_status_for;

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    #[test]
    fn fully_paid_installments_are_paid() {
        let today = date("2026-06-01");
        assert_eq!(installment_status_for(500.0, 500.0, Some(date("2026-01-01")), today), "paid");
        assert_eq!(installment_status_for(500.0, 499.999, None, today), "paid");
    }

    #[test]
    fn unpaid_installments_depend_on_due_date() {
        let today = date("2026-06-01");
        assert_eq!(installment_status_for(500.0, 100.0, Some(date("2026-05-31")), today), "overdue");
        assert_eq!(installment_status_for(500.0, 0.0, Some(date("2026-06-01")), today), "pending");
        assert_eq!(installment_status_for(500.0, 0.0, None, today), "pending");
    }
}
