//! Safe balance movements. Every function here expects to run inside a
//! transaction: balances are read under `FOR UPDATE` and written back in the
//! same connection.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgConnection;

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{create_row, lock_live_row, update_row},
    values::{round2, value_number, value_str},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoucherKind {
    Receipt,
    Payment,
}

impl VoucherKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Receipt => "receipt",
            Self::Payment => "payment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "receipt" => Some(Self::Receipt),
            "payment" => Some(Self::Payment),
            _ => None,
        }
    }

    /// Signed effect of a voucher of this kind on the safe balance.
    pub fn balance_delta(self, amount: f64) -> f64 {
        match self {
            Self::Receipt => amount,
            Self::Payment => -amount,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoucherDraft {
    pub kind: VoucherKind,
    pub safe_id: String,
    pub amount: f64,
    pub voucher_date: NaiveDate,
    pub description: Option<String>,
    pub party_name: Option<String>,
    pub contract_id: Option<String>,
    pub installment_id: Option<String>,
    pub broker_due_id: Option<String>,
    pub unit_id: Option<String>,
    pub created_by_user_id: String,
}

impl VoucherDraft {
    pub fn new(
        kind: VoucherKind,
        safe_id: &str,
        amount: f64,
        voucher_date: NaiveDate,
        created_by_user_id: &str,
    ) -> Self {
        Self {
            kind,
            safe_id: safe_id.to_string(),
            amount,
            voucher_date,
            description: None,
            party_name: None,
            contract_id: None,
            installment_id: None,
            broker_due_id: None,
            unit_id: None,
            created_by_user_id: created_by_user_id.to_string(),
        }
    }

    fn into_record(self) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("kind".to_string(), Value::String(self.kind.as_str().to_string()));
        record.insert("safe_id".to_string(), Value::String(self.safe_id));
        record.insert("amount".to_string(), serde_json::json!(round2(self.amount)));
        record.insert(
            "voucher_date".to_string(),
            Value::String(self.voucher_date.to_string()),
        );
        record.insert(
            "created_by_user_id".to_string(),
            Value::String(self.created_by_user_id),
        );
        for (key, value) in [
            ("description", self.description),
            ("party_name", self.party_name),
            ("contract_id", self.contract_id),
            ("installment_id", self.installment_id),
            ("broker_due_id", self.broker_due_id),
            ("unit_id", self.unit_id),
        ] {
            if let Some(value) = value.filter(|text| !text.trim().is_empty()) {
                record.insert(key.to_string(), Value::String(value));
            }
        }
        record
    }
}

#[derive(Debug, Clone)]
pub struct TransferDraft {
    pub from_safe_id: String,
    pub to_safe_id: String,
    pub amount: f64,
    pub transfer_date: NaiveDate,
    pub notes: Option<String>,
    pub created_by_user_id: String,
}

/// Balance after applying `delta`, refusing to overdraw.
pub fn next_balance(current: f64, delta: f64) -> Option<f64> {
    let next = round2(current + delta);
    (next >= 0.0).then_some(next)
}

pub fn validate_amount(amount: f64) -> AppResult<f64> {
    let rounded = round2(amount);
    if !amount.is_finite() || rounded <= 0.0 {
        return Err(AppError::BadRequest(
            "amount must be greater than zero.".to_string(),
        ));
    }
    Ok(rounded)
}

/// Lock the safe, apply `delta` to its balance and return the updated row.
pub async fn apply_safe_movement(
    conn: &mut PgConnection,
    safe_id: &str,
    delta: f64,
) -> AppResult<Value> {
    let safe = lock_live_row(&mut *conn, "safes", safe_id).await?;
    if safe.get("is_active").and_then(Value::as_bool) == Some(false) {
        return Err(AppError::Conflict(format!(
            "Safe '{}' is inactive.",
            value_str(&safe, "name")
        )));
    }

    let current = value_number(&safe, "balance");
    let Some(balance) = next_balance(current, delta) else {
        return Err(AppError::Conflict(format!(
            "Insufficient balance in safe '{}': available {:.2}, requested {:.2}.",
            value_str(&safe, "name"),
            current,
            delta.abs()
        )));
    };

    let mut patch = Map::new();
    patch.insert("balance".to_string(), serde_json::json!(balance));
    let updated = update_row(&mut *conn, "safes", safe_id, &patch).await?;

    tracing::debug!(safe_id, delta, balance, "Applied safe movement");
    Ok(updated)
}

/// Insert a voucher and apply its effect to the safe.
pub async fn record_voucher(conn: &mut PgConnection, draft: VoucherDraft) -> AppResult<Value> {
    let amount = validate_amount(draft.amount)?;
    apply_safe_movement(&mut *conn, &draft.safe_id, draft.kind.balance_delta(amount)).await?;
    create_row(&mut *conn, "vouchers", &draft.into_record()).await
}

/// Undo a voucher's effect on its safe. The caller soft-deletes the voucher.
pub async fn reverse_voucher(conn: &mut PgConnection, voucher: &Value) -> AppResult<Value> {
    let kind = VoucherKind::parse(&value_str(voucher, "kind")).ok_or_else(|| {
        AppError::Internal("Voucher has an unknown kind.".to_string())
    })?;
    let amount = value_number(voucher, "amount");
    let safe_id = value_str(voucher, "safe_id");
    apply_safe_movement(&mut *conn, &safe_id, -kind.balance_delta(amount)).await
}

/// Move money between two safes. Rows are locked in id order so concurrent
/// transfers in opposite directions cannot deadlock.
pub async fn transfer_between_safes(
    conn: &mut PgConnection,
    draft: TransferDraft,
) -> AppResult<Value> {
    if draft.from_safe_id.trim() == draft.to_safe_id.trim() {
        return Err(AppError::BadRequest(
            "Source and destination safes must differ.".to_string(),
        ));
    }
    let amount = validate_amount(draft.amount)?;

    let (first, second) = lock_order(&draft.from_safe_id, &draft.to_safe_id);
    lock_live_row(&mut *conn, "safes", first).await?;
    lock_live_row(&mut *conn, "safes", second).await?;

    apply_safe_movement(&mut *conn, &draft.from_safe_id, -amount).await?;
    apply_safe_movement(&mut *conn, &draft.to_safe_id, amount).await?;

    let mut record = Map::new();
    record.insert("from_safe_id".to_string(), Value::String(draft.from_safe_id));
    record.insert("to_safe_id".to_string(), Value::String(draft.to_safe_id));
    record.insert("amount".to_string(), serde_json::json!(amount));
    record.insert(
        "transfer_date".to_string(),
        Value::String(draft.transfer_date.to_string()),
    );
    record.insert(
        "created_by_user_id".to_string(),
        Value::String(draft.created_by_user_id),
    );
    if let Some(notes) = draft.notes.filter(|text| !text.trim().is_empty()) {
        record.insert("notes".to_string(), Value::String(notes));
    }
    create_row(&mut *conn, "safe_transfers", &record).await
}

fn lock_order<'a>(left: &'a str, right: &'a str) -> (&'a str, &'a str) {
    if left <= right {
        (left, right)
    } else {
        (right, left)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::{json, Value};

    use super::{lock_order, next_balance, validate_amount, VoucherDraft, VoucherKind};

    #[test]
    fn voucher_kinds_move_balance_in_opposite_directions() {
        assert_eq!(VoucherKind::Receipt.balance_delta(150.0), 150.0);
        assert_eq!(VoucherKind::Payment.balance_delta(150.0), -150.0);
        assert_eq!(VoucherKind::parse("payment"), Some(VoucherKind::Payment));
        assert_eq!(VoucherKind::parse("refund"), None);
    }

    #[test]
    fn refuses_to_overdraw() {
        assert_eq!(next_balance(100.0, -40.5), Some(59.5));
        assert_eq!(next_balance(100.0, -100.0), Some(0.0));
        assert_eq!(next_balance(100.0, -100.01), None);
        assert_eq!(next_balance(0.1 + 0.2, -0.3), Some(0.0));
    }

    #[test]
    fn validates_positive_amounts() {
        assert_eq!(validate_amount(10.004).ok(), Some(10.0));
        assert!(validate_amount(0.0).is_err());
        assert!(validate_amount(-5.0).is_err());
        assert!(validate_amount(0.001).is_err());
        assert!(validate_amount(f64::NAN).is_err());
    }

    #[test]
    fn locks_safes_in_stable_order() {
        assert_eq!(lock_order("b", "a"), ("a", "b"));
        assert_eq!(lock_order("a", "b"), ("a", "b"));
    }

    #[test]
    fn voucher_record_skips_blank_links() {
        let mut draft = VoucherDraft::new(
            VoucherKind::Receipt,
            "safe-1",
            1250.456,
            NaiveDate::from_ymd_opt(2026, 5, 1).expect("date"),
            "user-1",
        );
        draft.contract_id = Some("contract-1".to_string());
        draft.party_name = Some("  ".to_string());

        let record = Value::Object(draft.into_record());
        assert_eq!(record["kind"], json!("receipt"));
        assert_eq!(record["amount"], json!(1250.46));
        assert_eq!(record["voucher_date"], json!("2026-05-01"));
        assert_eq!(record["contract_id"], json!("contract-1"));
        assert!(record.get("party_name").is_none());
        assert!(record.get("installment_id").is_none());
    }
}
