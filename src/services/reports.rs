//! Aggregate queries behind the `/reports` endpoints and the customer statement.
//!
//! Every query excludes soft-deleted rows. Sums are cast to `float8` so they
//! decode straight into `f64`.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::{
    error::{AppError, AppResult},
    repository::table_service::map_db_error,
    values::{round2, round4},
};

/// Widest range a report accepts, roughly ten years.
pub const MAX_RANGE_DAYS: i64 = 3660;
const TOP_OVERDUE_LIMIT: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn as_json(&self) -> Value {
        json!({ "from_date": self.from.to_string(), "to_date": self.to.to_string() })
    }
}

pub fn validate_range(from: NaiveDate, to: NaiveDate) -> AppResult<DateRange> {
    if from > to {
        return Err(AppError::BadRequest(
            "from_date must be on or before to_date.".to_string(),
        ));
    }
    if (to - from).num_days() > MAX_RANGE_DAYS {
        return Err(AppError::BadRequest(format!(
            "Date range cannot exceed {MAX_RANGE_DAYS} days."
        )));
    }
    Ok(DateRange { from, to })
}

/// Missing bounds default to the calendar year of `to_date` (or today).
pub fn resolve_range(
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    today: NaiveDate,
) -> AppResult<DateRange> {
    let to = to.unwrap_or(today);
    let from = from
        .or_else(|| NaiveDate::from_ymd_opt(to.year(), 1, 1))
        .unwrap_or(to);
    validate_range(from, to)
}

pub fn collection_rate(paid: f64, due: f64) -> f64 {
    if due <= 0.0 {
        return 0.0;
    }
    round4(paid / due)
}

pub fn month_label(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// Every `YYYY-MM` label touched by the range, in order.
pub fn month_labels(range: &DateRange) -> Vec<String> {
    let mut labels = Vec::new();
    let mut year = range.from.year();
    let mut month = range.from.month();
    while (year, month) <= (range.to.year(), range.to.month()) {
        labels.push(format!("{year:04}-{month:02}"));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    labels
}

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct StatusCountRow {
    status: String,
    total: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DashboardTotalsRow {
    customers: i64,
    active_contracts: i64,
    active_contract_value: f64,
    installments_total: f64,
    installments_paid: f64,
    overdue_count: i64,
    overdue_amount: f64,
    safes_balance: f64,
    broker_dues_pending_count: i64,
    broker_dues_pending_amount: f64,
}

pub async fn dashboard(pool: &PgPool, today: NaiveDate) -> AppResult<Value> {
    let unit_rows = sqlx::query_as::<_, StatusCountRow>(
        "SELECT status::text AS status, COUNT(*)::bigint AS total
         FROM units
         WHERE deleted_at IS NULL
         GROUP BY status
         ORDER BY status",
    )
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let totals = sqlx::query_as::<_, DashboardTotalsRow>(
        "SELECT
            (SELECT COUNT(*) FROM customers WHERE deleted_at IS NULL)::bigint AS customers,
            (SELECT COUNT(*) FROM contracts
              WHERE deleted_at IS NULL AND status = 'active')::bigint AS active_contracts,
            (SELECT COALESCE(SUM(total_price - discount_amount), 0) FROM contracts
              WHERE deleted_at IS NULL AND status = 'active')::float8 AS active_contract_value,
            COALESCE(SUM(i.amount), 0)::float8 AS installments_total,
            COALESCE(SUM(i.paid_amount), 0)::float8 AS installments_paid,
            (COUNT(*) FILTER (WHERE i.status <> 'paid' AND i.due_date < $1))::bigint AS overdue_count,
            COALESCE(SUM(i.amount - i.paid_amount)
              FILTER (WHERE i.status <> 'paid' AND i.due_date < $1), 0)::float8 AS overdue_amount,
            (SELECT COALESCE(SUM(balance), 0) FROM safes WHERE deleted_at IS NULL)::float8 AS safes_balance,
            (SELECT COUNT(*) FROM broker_dues WHERE status = 'pending')::bigint AS broker_dues_pending_count,
            (SELECT COALESCE(SUM(amount), 0) FROM broker_dues
              WHERE status = 'pending')::float8 AS broker_dues_pending_amount
         FROM installments i
         JOIN contracts c ON c.id = i.contract_id
         WHERE c.deleted_at IS NULL AND c.status = 'active'",
    )
    .bind(today)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    let mut units_by_status = serde_json::Map::new();
    for status in ["available", "reserved", "sold"] {
        units_by_status.insert(status.to_string(), json!(0));
    }
    let mut unit_total = 0_i64;
    for row in &unit_rows {
        unit_total += row.total;
        units_by_status.insert(row.status.clone(), json!(row.total));
    }

    Ok(json!({
        "as_of": today.to_string(),
        "units": { "total": unit_total, "by_status": units_by_status },
        "customers": totals.customers,
        "contracts": {
            "active": totals.active_contracts,
            "net_value": round2(totals.active_contract_value),
        },
        "installments": {
            "total": round2(totals.installments_total),
            "paid": round2(totals.installments_paid),
            "remaining": round2(totals.installments_total - totals.installments_paid),
            "collection_rate": collection_rate(totals.installments_paid, totals.installments_total),
            "overdue_count": totals.overdue_count,
            "overdue_amount": round2(totals.overdue_amount),
        },
        "safes_balance": round2(totals.safes_balance),
        "broker_dues_pending": {
            "count": totals.broker_dues_pending_count,
            "amount": round2(totals.broker_dues_pending_amount),
        },
    }))
}

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct SalesSummaryRow {
    contracts: i64,
    net_value: f64,
    average_net_price: f64,
    down_payments: f64,
    discounts: f64,
    cancelled: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct SalesBucketRow {
    bucket: String,
    contracts: i64,
    net_value: f64,
    down_payments: f64,
}

pub async fn sales_report(pool: &PgPool, range: &DateRange) -> AppResult<Value> {
    let summary = sqlx::query_as::<_, SalesSummaryRow>(
        "SELECT
            (COUNT(*) FILTER (WHERE status = 'active'))::bigint AS contracts,
            COALESCE(SUM(total_price - discount_amount) FILTER (WHERE status = 'active'), 0)::float8 AS net_value,
            COALESCE(AVG(total_price - discount_amount) FILTER (WHERE status = 'active'), 0)::float8 AS average_net_price,
            COALESCE(SUM(down_payment) FILTER (WHERE status = 'active'), 0)::float8 AS down_payments,
            COALESCE(SUM(discount_amount) FILTER (WHERE status = 'active'), 0)::float8 AS discounts,
            (COUNT(*) FILTER (WHERE status = 'cancelled'))::bigint AS cancelled
         FROM contracts
         WHERE deleted_at IS NULL
           AND contract_date BETWEEN $1 AND $2",
    )
    .bind(range.from)
    .bind(range.to)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    let monthly = sqlx::query_as::<_, SalesBucketRow>(
        "SELECT to_char(contract_date, 'YYYY-MM') AS bucket,
                COUNT(*)::bigint AS contracts,
                COALESCE(SUM(total_price - discount_amount), 0)::float8 AS net_value,
                COALESCE(SUM(down_payment), 0)::float8 AS down_payments
         FROM contracts
         WHERE deleted_at IS NULL AND status = 'active'
           AND contract_date BETWEEN $1 AND $2
         GROUP BY 1
         ORDER BY 1",
    )
    .bind(range.from)
    .bind(range.to)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let by_unit_type = sqlx::query_as::<_, SalesBucketRow>(
        "SELECT COALESCE(NULLIF(u.unit_type, ''), 'unspecified') AS bucket,
                COUNT(*)::bigint AS contracts,
                COALESCE(SUM(c.total_price - c.discount_amount), 0)::float8 AS net_value,
                COALESCE(SUM(c.down_payment), 0)::float8 AS down_payments
         FROM contracts c
         JOIN units u ON u.id = c.unit_id
         WHERE c.deleted_at IS NULL AND c.status = 'active'
           AND c.contract_date BETWEEN $1 AND $2
         GROUP BY 1
         ORDER BY net_value DESC, bucket",
    )
    .bind(range.from)
    .bind(range.to)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let monthly = fill_monthly(range, monthly, |bucket| SalesBucketRow {
        bucket,
        contracts: 0,
        net_value: 0.0,
        down_payments: 0.0,
    });

    Ok(json!({
        "range": range.as_json(),
        "contracts": summary.contracts,
        "cancelled_contracts": summary.cancelled,
        "net_value": round2(summary.net_value),
        "average_net_price": round2(summary.average_net_price),
        "down_payments": round2(summary.down_payments),
        "discounts": round2(summary.discounts),
        "monthly": monthly.iter().map(sales_bucket_json).collect::<Vec<_>>(),
        "by_unit_type": by_unit_type.iter().map(sales_bucket_json).collect::<Vec<_>>(),
    }))
}

fn sales_bucket_json(row: &SalesBucketRow) -> Value {
    json!({
        "key": row.bucket,
        "contracts": row.contracts,
        "net_value": round2(row.net_value),
        "down_payments": round2(row.down_payments),
    })
}

trait MonthBucket {
    fn month(&self) -> &str;
}

impl MonthBucket for SalesBucketRow {
    fn month(&self) -> &str {
        &self.bucket
    }
}

/// Pad a sparse monthly series so every month of the range appears once.
fn fill_monthly<T: MonthBucket>(
    range: &DateRange,
    rows: Vec<T>,
    empty: impl Fn(String) -> T,
) -> Vec<T> {
    let mut by_month = rows
        .into_iter()
        .map(|row| (row.month().to_string(), row))
        .collect::<std::collections::HashMap<_, _>>();
    month_labels(range)
        .into_iter()
        .map(|label| by_month.remove(&label).unwrap_or_else(|| empty(label)))
        .collect()
}

// ---------------------------------------------------------------------------
// Installments
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct InstallmentStatusRow {
    status: String,
    total: i64,
    amount: f64,
    paid: f64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct OverdueInstallmentRow {
    installment_id: String,
    contract_id: String,
    contract_code: String,
    customer_name: String,
    unit_code: String,
    due_date: NaiveDate,
    amount: f64,
    paid_amount: f64,
    remaining: f64,
    days_overdue: i32,
}

pub async fn installments_report(
    pool: &PgPool,
    range: &DateRange,
    today: NaiveDate,
) -> AppResult<Value> {
    let rows = sqlx::query_as::<_, InstallmentStatusRow>(
        "SELECT i.status::text AS status,
                COUNT(*)::bigint AS total,
                COALESCE(SUM(i.amount), 0)::float8 AS amount,
                COALESCE(SUM(i.paid_amount), 0)::float8 AS paid
         FROM installments i
         JOIN contracts c ON c.id = i.contract_id
         WHERE c.deleted_at IS NULL AND c.status = 'active'
           AND i.due_date BETWEEN $1 AND $2
         GROUP BY i.status
         ORDER BY i.status",
    )
    .bind(range.from)
    .bind(range.to)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let top_overdue = sqlx::query_as::<_, OverdueInstallmentRow>(
        "SELECT i.id::text AS installment_id,
                c.id::text AS contract_id,
                c.code AS contract_code,
                cu.full_name AS customer_name,
                u.code AS unit_code,
                i.due_date,
                i.amount::float8 AS amount,
                i.paid_amount::float8 AS paid_amount,
                (i.amount - i.paid_amount)::float8 AS remaining,
                ($1::date - i.due_date)::int AS days_overdue
         FROM installments i
         JOIN contracts c ON c.id = i.contract_id
         JOIN customers cu ON cu.id = c.customer_id
         JOIN units u ON u.id = c.unit_id
         WHERE c.deleted_at IS NULL AND c.status = 'active'
           AND i.status <> 'paid'
           AND i.due_date < $1
         ORDER BY remaining DESC, i.due_date ASC
         LIMIT $2",
    )
    .bind(today)
    .bind(TOP_OVERDUE_LIMIT)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let mut due_total = 0.0;
    let mut paid_total = 0.0;
    let mut count_total = 0_i64;
    let mut by_status = serde_json::Map::new();
    for row in &rows {
        due_total += row.amount;
        paid_total += row.paid;
        count_total += row.total;
        by_status.insert(
            row.status.clone(),
            json!({
                "count": row.total,
                "amount": round2(row.amount),
                "paid": round2(row.paid),
                "remaining": round2(row.amount - row.paid),
            }),
        );
    }

    let top_overdue = top_overdue
        .into_iter()
        .map(|mut row| {
            row.amount = round2(row.amount);
            row.paid_amount = round2(row.paid_amount);
            row.remaining = round2(row.remaining);
            row
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "range": range.as_json(),
        "as_of": today.to_string(),
        "count": count_total,
        "due_amount": round2(due_total),
        "paid_amount": round2(paid_total),
        "remaining_amount": round2(due_total - paid_total),
        "collection_rate": collection_rate(paid_total, due_total),
        "by_status": by_status,
        "top_overdue": top_overdue,
    }))
}

// ---------------------------------------------------------------------------
// Safes and vouchers
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct SafeMovementRow {
    safe_id: String,
    name: String,
    is_active: bool,
    balance: f64,
    receipts: f64,
    payments: f64,
    transfers_in: f64,
    transfers_out: f64,
}

pub async fn safes_report(pool: &PgPool, range: &DateRange) -> AppResult<Value> {
    let rows = sqlx::query_as::<_, SafeMovementRow>(
        "SELECT s.id::text AS safe_id,
                s.name,
                s.is_active,
                s.balance::float8 AS balance,
                COALESCE((SELECT SUM(v.amount) FROM vouchers v
                  WHERE v.safe_id = s.id AND v.deleted_at IS NULL AND v.kind = 'receipt'
                    AND v.voucher_date BETWEEN $1 AND $2), 0)::float8 AS receipts,
                COALESCE((SELECT SUM(v.amount) FROM vouchers v
                  WHERE v.safe_id = s.id AND v.deleted_at IS NULL AND v.kind = 'payment'
                    AND v.voucher_date BETWEEN $1 AND $2), 0)::float8 AS payments,
                COALESCE((SELECT SUM(t.amount) FROM safe_transfers t
                  WHERE t.to_safe_id = s.id AND t.transfer_date BETWEEN $1 AND $2), 0)::float8 AS transfers_in,
                COALESCE((SELECT SUM(t.amount) FROM safe_transfers t
                  WHERE t.from_safe_id = s.id AND t.transfer_date BETWEEN $1 AND $2), 0)::float8 AS transfers_out
         FROM safes s
         WHERE s.deleted_at IS NULL
         ORDER BY s.name",
    )
    .bind(range.from)
    .bind(range.to)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let mut total_balance = 0.0;
    let mut total_net = 0.0;
    let safes = rows
        .iter()
        .map(|row| {
            let net = row.receipts - row.payments + row.transfers_in - row.transfers_out;
            total_balance += row.balance;
            total_net += net;
            json!({
                "safe_id": row.safe_id,
                "name": row.name,
                "is_active": row.is_active,
                "balance": round2(row.balance),
                "receipts": round2(row.receipts),
                "payments": round2(row.payments),
                "transfers_in": round2(row.transfers_in),
                "transfers_out": round2(row.transfers_out),
                "net_movement": round2(net),
            })
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "range": range.as_json(),
        "total_balance": round2(total_balance),
        "net_movement": round2(total_net),
        "data": safes,
    }))
}

#[derive(Debug, sqlx::FromRow)]
struct VoucherMonthRow {
    bucket: String,
    receipts: f64,
    payments: f64,
    receipt_count: i64,
    payment_count: i64,
}

impl MonthBucket for VoucherMonthRow {
    fn month(&self) -> &str {
        &self.bucket
    }
}

pub async fn vouchers_report(pool: &PgPool, range: &DateRange) -> AppResult<Value> {
    let rows = sqlx::query_as::<_, VoucherMonthRow>(
        "SELECT to_char(voucher_date, 'YYYY-MM') AS bucket,
                COALESCE(SUM(amount) FILTER (WHERE kind = 'receipt'), 0)::float8 AS receipts,
                COALESCE(SUM(amount) FILTER (WHERE kind = 'payment'), 0)::float8 AS payments,
                (COUNT(*) FILTER (WHERE kind = 'receipt'))::bigint AS receipt_count,
                (COUNT(*) FILTER (WHERE kind = 'payment'))::bigint AS payment_count
         FROM vouchers
         WHERE deleted_at IS NULL
           AND voucher_date BETWEEN $1 AND $2
         GROUP BY 1
         ORDER BY 1",
    )
    .bind(range.from)
    .bind(range.to)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let monthly = fill_monthly(range, rows, |bucket| VoucherMonthRow {
        bucket,
        receipts: 0.0,
        payments: 0.0,
        receipt_count: 0,
        payment_count: 0,
    });

    let receipts = monthly.iter().map(|row| row.receipts).sum::<f64>();
    let payments = monthly.iter().map(|row| row.payments).sum::<f64>();
    let months = monthly
        .iter()
        .map(|row| {
            json!({
                "month": row.bucket,
                "receipts": round2(row.receipts),
                "payments": round2(row.payments),
                "receipt_count": row.receipt_count,
                "payment_count": row.payment_count,
                "net": round2(row.receipts - row.payments),
            })
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "range": range.as_json(),
        "receipts": round2(receipts),
        "payments": round2(payments),
        "net": round2(receipts - payments),
        "monthly": months,
    }))
}

// ---------------------------------------------------------------------------
// Brokers and partners
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct BrokerPerformanceRow {
    broker_id: String,
    full_name: String,
    contracts: i64,
    sales_value: f64,
    dues_total: f64,
    dues_paid: f64,
    dues_pending: f64,
}

pub async fn brokers_report(pool: &PgPool, range: &DateRange) -> AppResult<Value> {
    let rows = sqlx::query_as::<_, BrokerPerformanceRow>(
        "SELECT b.id::text AS broker_id,
                b.full_name,
                COUNT(c.id)::bigint AS contracts,
                COALESCE(SUM(c.total_price - c.discount_amount), 0)::float8 AS sales_value,
                COALESCE(SUM(d.amount), 0)::float8 AS dues_total,
                COALESCE(SUM(d.amount) FILTER (WHERE d.status = 'paid'), 0)::float8 AS dues_paid,
                COALESCE(SUM(d.amount) FILTER (WHERE d.status = 'pending'), 0)::float8 AS dues_pending
         FROM brokers b
         LEFT JOIN contracts c
           ON c.broker_id = b.id
          AND c.deleted_at IS NULL
          AND c.status = 'active'
          AND c.contract_date BETWEEN $1 AND $2
         LEFT JOIN broker_dues d ON d.contract_id = c.id
         WHERE b.deleted_at IS NULL
         GROUP BY b.id, b.full_name
         ORDER BY sales_value DESC, b.full_name",
    )
    .bind(range.from)
    .bind(range.to)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let brokers = rows
        .iter()
        .map(|row| {
            json!({
                "broker_id": row.broker_id,
                "full_name": row.full_name,
                "contracts": row.contracts,
                "sales_value": round2(row.sales_value),
                "dues_total": round2(row.dues_total),
                "dues_paid": round2(row.dues_paid),
                "dues_pending": round2(row.dues_pending),
            })
        })
        .collect::<Vec<_>>();

    Ok(json!({ "range": range.as_json(), "data": brokers }))
}

#[derive(Debug, sqlx::FromRow)]
struct PartnerShareRow {
    partner_id: String,
    full_name: String,
    units: i64,
    sold_value: f64,
    collected: f64,
}

pub async fn partners_report(pool: &PgPool, range: &DateRange) -> AppResult<Value> {
    let rows = sqlx::query_as::<_, PartnerShareRow>(
        "SELECT p.id::text AS partner_id,
                p.full_name,
                COUNT(up.unit_id)::bigint AS units,
                COALESCE(SUM(up.share_percent / 100 * sold.net_value), 0)::float8 AS sold_value,
                COALESCE(SUM(up.share_percent / 100 * received.amount), 0)::float8 AS collected
         FROM partners p
         LEFT JOIN unit_partners up
           ON up.partner_id = p.id
          AND EXISTS (SELECT 1 FROM units u WHERE u.id = up.unit_id AND u.deleted_at IS NULL)
         LEFT JOIN LATERAL (
            SELECT COALESCE(SUM(c.total_price - c.discount_amount), 0) AS net_value
            FROM contracts c
            WHERE c.unit_id = up.unit_id AND c.deleted_at IS NULL AND c.status = 'active'
              AND c.contract_date BETWEEN $1 AND $2
         ) sold ON true
         LEFT JOIN LATERAL (
            SELECT COALESCE(SUM(v.amount), 0) AS amount
            FROM vouchers v
            WHERE v.unit_id = up.unit_id AND v.deleted_at IS NULL AND v.kind = 'receipt'
              AND v.voucher_date BETWEEN $1 AND $2
         ) received ON true
         WHERE p.deleted_at IS NULL
         GROUP BY p.id, p.full_name
         ORDER BY sold_value DESC, p.full_name",
    )
    .bind(range.from)
    .bind(range.to)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let partners = rows
        .iter()
        .map(|row| {
            json!({
                "partner_id": row.partner_id,
                "full_name": row.full_name,
                "units": row.units,
                "sold_value": round2(row.sold_value),
                "collected": round2(row.collected),
            })
        })
        .collect::<Vec<_>>();

    Ok(json!({ "range": range.as_json(), "data": partners }))
}

// ---------------------------------------------------------------------------
// Contract balances and safe ledger
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct ContractBalanceRow {
    contract_id: String,
    installments_total: f64,
    paid: f64,
    overdue: f64,
    installment_count: i64,
    paid_count: i64,
}

/// Installment totals for the given contracts keyed by contract id.
pub async fn contract_balances(
    pool: &PgPool,
    contract_ids: &[uuid::Uuid],
    today: NaiveDate,
) -> AppResult<std::collections::HashMap<String, Value>> {
    if contract_ids.is_empty() {
        return Ok(std::collections::HashMap::new());
    }

    let rows = sqlx::query_as::<_, ContractBalanceRow>(
        "SELECT contract_id::text AS contract_id,
                COALESCE(SUM(amount), 0)::float8 AS installments_total,
                COALESCE(SUM(paid_amount), 0)::float8 AS paid,
                COALESCE(SUM(amount - paid_amount)
                  FILTER (WHERE status <> 'paid' AND due_date < $2), 0)::float8 AS overdue,
                COUNT(*)::bigint AS installment_count,
                (COUNT(*) FILTER (WHERE status = 'paid'))::bigint AS paid_count
         FROM installments
         WHERE contract_id = ANY($1)
         GROUP BY contract_id",
    )
    .bind(contract_ids)
    .bind(today)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let totals = json!({
                "installments_total": round2(row.installments_total),
                "paid": round2(row.paid),
                "remaining": round2(row.installments_total - row.paid),
                "overdue": round2(row.overdue),
                "installment_count": row.installment_count,
                "paid_count": row.paid_count,
            });
            (row.contract_id, totals)
        })
        .collect())
}

pub fn empty_contract_balance() -> Value {
    json!({
        "installments_total": 0.0,
        "paid": 0.0,
        "remaining": 0.0,
        "overdue": 0.0,
        "installment_count": 0,
        "paid_count": 0,
    })
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LedgerMovement {
    pub movement_date: NaiveDate,
    pub movement_kind: String,
    pub reference_id: String,
    pub amount: f64,
    pub description: Option<String>,
    pub recorded_at: DateTime<Utc>,
    #[sqlx(skip)]
    pub balance_after: f64,
}

/// Stamp each movement with the running balance starting from `opening`.
/// Returns the closing balance.
pub fn apply_running_balance(opening: f64, movements: &mut [LedgerMovement]) -> f64 {
    let mut balance = opening;
    for movement in movements.iter_mut() {
        balance = round2(balance + movement.amount);
        movement.balance_after = balance;
    }
    balance
}

pub async fn safe_ledger(pool: &PgPool, safe: &Value, range: &DateRange) -> AppResult<Value> {
    let safe_id = crate::values::value_str(safe, "id");
    let current_balance = crate::values::value_number(safe, "balance");

    // Everything dated on or after `from` is unwound from the live balance.
    let (since_from,): (f64,) = sqlx::query_as(
        "SELECT (
            COALESCE((SELECT SUM(CASE WHEN kind = 'receipt' THEN amount ELSE -amount END)
              FROM vouchers WHERE safe_id = $1::uuid AND deleted_at IS NULL AND voucher_date >= $2), 0)
          + COALESCE((SELECT SUM(amount) FROM safe_transfers
              WHERE to_safe_id = $1::uuid AND transfer_date >= $2), 0)
          - COALESCE((SELECT SUM(amount) FROM safe_transfers
              WHERE from_safe_id = $1::uuid AND transfer_date >= $2), 0)
         )::float8",
    )
    .bind(&safe_id)
    .bind(range.from)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    let mut movements = sqlx::query_as::<_, LedgerMovement>(
        "SELECT v.voucher_date AS movement_date,
                v.kind::text AS movement_kind,
                v.id::text AS reference_id,
                (CASE WHEN v.kind = 'receipt' THEN v.amount ELSE -v.amount END)::float8 AS amount,
                v.description,
                v.created_at AS recorded_at
         FROM vouchers v
         WHERE v.safe_id = $1::uuid AND v.deleted_at IS NULL
           AND v.voucher_date BETWEEN $2 AND $3
         UNION ALL
         SELECT t.transfer_date, 'transfer_out', t.id::text, (-t.amount)::float8, t.notes, t.created_at
         FROM safe_transfers t
         WHERE t.from_safe_id = $1::uuid AND t.transfer_date BETWEEN $2 AND $3
         UNION ALL
         SELECT t.transfer_date, 'transfer_in', t.id::text, t.amount::float8, t.notes, t.created_at
         FROM safe_transfers t
         WHERE t.to_safe_id = $1::uuid AND t.transfer_date BETWEEN $2 AND $3
         ORDER BY movement_date, recorded_at",
    )
    .bind(&safe_id)
    .bind(range.from)
    .bind(range.to)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let opening = round2(current_balance - since_from);
    let closing = apply_running_balance(opening, &mut movements);
    let inflow = movements
        .iter()
        .filter(|item| item.amount > 0.0)
        .map(|item| item.amount)
        .sum::<f64>();
    let outflow = movements
        .iter()
        .filter(|item| item.amount < 0.0)
        .map(|item| -item.amount)
        .sum::<f64>();

    Ok(json!({
        "safe_id": safe_id,
        "name": crate::values::value_str(safe, "name"),
        "range": range.as_json(),
        "opening_balance": opening,
        "inflow": round2(inflow),
        "outflow": round2(outflow),
        "closing_balance": closing,
        "current_balance": round2(current_balance),
        "movements": movements,
    }))
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};

    use super::{
        apply_running_balance, collection_rate, fill_monthly, month_label, month_labels,
        resolve_range, validate_range, DateRange, LedgerMovement, SalesBucketRow,
    };

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    #[test]
    fn rejects_inverted_and_oversized_ranges() {
        assert!(validate_range(date("2026-02-01"), date("2026-01-31")).is_err());
        assert!(validate_range(date("2010-01-01"), date("2026-01-01")).is_err());
        let range = validate_range(date("2026-01-01"), date("2026-01-01")).expect("range");
        assert_eq!(range.from, range.to);
    }

    #[test]
    fn defaults_to_calendar_year_of_end_date() {
        let today = date("2026-10-14");
        let range = resolve_range(None, None, today).expect("range");
        assert_eq!(range.from, date("2026-01-01"));
        assert_eq!(range.to, today);

        let range = resolve_range(None, Some(date("2025-03-31")), today).expect("range");
        assert_eq!(range.from, date("2025-01-01"));
    }

    #[test]
    fn collection_rate_handles_zero_due() {
        assert_eq!(collection_rate(50.0, 0.0), 0.0);
        assert_eq!(collection_rate(1.0, 3.0), 0.3333);
        assert_eq!(collection_rate(300.0, 300.0), 1.0);
    }

    #[test]
    fn month_labels_span_year_boundary() {
        assert_eq!(month_label(date("2026-03-09")), "2026-03");
        let range = DateRange {
            from: date("2025-11-15"),
            to: date("2026-02-01"),
        };
        assert_eq!(
            month_labels(&range),
            vec!["2025-11", "2025-12", "2026-01", "2026-02"]
        );
    }

    #[test]
    fn pads_missing_months() {
        let range = DateRange {
            from: date("2026-01-01"),
            to: date("2026-03-31"),
        };
        let rows = vec![SalesBucketRow {
            bucket: "2026-02".to_string(),
            contracts: 2,
            net_value: 900_000.0,
            down_payments: 90_000.0,
        }];
        let filled = fill_monthly(&range, rows, |bucket| SalesBucketRow {
            bucket,
            contracts: 0,
            net_value: 0.0,
            down_payments: 0.0,
        });
        let summary = filled
            .iter()
            .map(|row| (row.bucket.as_str(), row.contracts))
            .collect::<Vec<_>>();
        assert_eq!(summary, vec![("2026-01", 0), ("2026-02", 2), ("2026-03", 0)]);
    }

    #[test]
    fn running_balance_follows_movements() {
        let movement = |amount: f64| LedgerMovement {
            movement_date: date("2026-04-01"),
            movement_kind: "receipt".to_string(),
            reference_id: "ref".to_string(),
            amount,
            description: None,
            recorded_at: Utc::now(),
            balance_after: 0.0,
        };
        let mut movements = vec![movement(500.0), movement(-120.25), movement(-79.75)];
        let closing = apply_running_balance(1000.0, &mut movements);
        assert_eq!(closing, 1300.0);
        assert_eq!(movements[0].balance_after, 1500.0);
        assert_eq!(movements[1].balance_after, 1379.75);
    }
}
