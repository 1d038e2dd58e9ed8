use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, Executor, Postgres, QueryBuilder, Row};

use crate::error::AppError;

const ALLOWED_TABLES: &[&str] = &[
    "app_users",
    "audit_logs",
    "broker_dues",
    "brokers",
    "contracts",
    "customers",
    "installments",
    "partners",
    "safe_transfers",
    "safes",
    "unit_partners",
    "units",
    "vouchers",
];

/// Tables whose rows are hidden by `deleted_at` instead of being removed.
const SOFT_DELETE_TABLES: &[&str] = &[
    "brokers",
    "contracts",
    "customers",
    "partners",
    "safes",
    "units",
    "vouchers",
];

pub const MAX_LIST_LIMIT: i64 = 1000;

pub async fn list_rows<'e, E>(
    executor: E,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let mut query = build_select(table, filters, order_by, ascending)?;
    query
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, MAX_LIST_LIMIT))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query
        .build()
        .fetch_all(executor)
        .await
        .map_err(map_db_error)?;
    Ok(read_rows(rows))
}

/// Fetch a row by id, including soft-deleted rows.
pub async fn get_row<'e, E>(executor: E, table: &str, row_id: &str) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    fetch_by_id(executor, table, row_id, false, false).await
}

/// Fetch a row by id, treating soft-deleted rows as missing.
pub async fn get_live_row<'e, E>(executor: E, table: &str, row_id: &str) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    fetch_by_id(executor, table, row_id, true, false).await
}

/// Fetch a live row and hold a row lock until the surrounding transaction ends.
pub async fn lock_live_row<'e, E>(executor: E, table: &str, row_id: &str) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    fetch_by_id(executor, table, row_id, true, true).await
}

pub async fn create_row<'e, E>(
    executor: E,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let table_name = validate_table(table)?;
    let mut query = build_insert(table_name, payload)?;

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    read_row(row).ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

/// Insert several rows sharing the same columns in one statement.
pub async fn create_rows<'e, E>(
    executor: E,
    table: &str,
    records: &[Map<String, Value>],
) -> Result<Vec<Value>, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    if records.is_empty() {
        return Ok(Vec::new());
    }
    let table_name = validate_table(table)?;
    let mut query = build_bulk_insert(table_name, records)?;

    let rows = query
        .build()
        .fetch_all(executor)
        .await
        .map_err(map_db_error)?;
    Ok(read_rows(rows))
}

pub async fn update_row<'e, E>(
    executor: E,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let table_name = validate_table(table)?;
    let mut query = build_update(table_name, row_id, payload)?;

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    read_row(row).ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

/// Hard delete. Returns the removed row.
pub async fn delete_row<'e, E>(executor: E, table: &str, row_id: &str) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE ");
    push_id_filter(&mut query, row_id);
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    read_row(row).ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

/// Stamp `deleted_at` on a live row. Returns the updated row.
pub async fn soft_delete_row<'e, E>(
    executor: E,
    table: &str,
    row_id: &str,
) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let table_name = validate_soft_delete_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query
        .push(table_name)
        .push(" t SET deleted_at = now() WHERE ");
    push_id_filter(&mut query, row_id);
    query.push(" AND t.deleted_at IS NULL RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    read_row(row).ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn count_rows<'e, E>(
    executor: E,
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<i64, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    let row = query
        .build()
        .fetch_one(executor)
        .await
        .map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

/// Filter map with the soft-delete guard already applied.
pub fn live_filters() -> Map<String, Value> {
    let mut filters = Map::new();
    filters.insert("deleted_at__is_null".to_string(), Value::Bool(true));
    filters
}

async fn fetch_by_id<'e, E>(
    executor: E,
    table: &str,
    row_id: &str,
    live_only: bool,
    for_update: bool,
) -> Result<Value, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_id_filter(&mut query, row_id);
    if live_only && SOFT_DELETE_TABLES.contains(&table_name) {
        query.push(" AND t.deleted_at IS NULL");
    }
    query.push(" LIMIT 1");
    if for_update {
        query.push(" FOR UPDATE");
    }

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    read_row(row).ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

fn build_select<'a>(
    table: &str,
    filters: Option<&Map<String, Value>>,
    order_by: &str,
    ascending: bool,
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    query.push(" ORDER BY t.").push(order_name);
    query.push(if ascending { " ASC" } else { " DESC" });
    if order_name != "id" {
        query.push(", t.id ASC");
    }
    Ok(query)
}

// jsonb_populate_record lets PostgreSQL resolve column types (uuid, enum,
// numeric, date) from the table definition.
fn build_insert<'a>(
    table_name: &'a str,
    payload: &Map<String, Value>,
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }
    let keys = sorted_keys(payload, true)?;

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.as_str());
        }
    }
    query.push(") SELECT ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push("r.");
            separated.push_unseparated(key.as_str());
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");
    Ok(query)
}

fn build_bulk_insert<'a>(
    table_name: &'a str,
    records: &[Map<String, Value>],
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    let Some(first) = records.first() else {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} records."
        )));
    };
    let keys = sorted_keys(first, true)?;
    let ragged = records.iter().any(|record| {
        record.len() != first.len() || !keys.iter().all(|key| record.contains_key(key))
    });
    if ragged {
        return Err(AppError::Internal(format!(
            "Bulk {table_name} records must share the same columns."
        )));
    }

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.as_str());
        }
    }
    query.push(") SELECT ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push("r.");
            separated.push_unseparated(key.as_str());
        }
    }
    query
        .push(" FROM jsonb_populate_recordset(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Array(
        records.iter().cloned().map(Value::Object).collect(),
    ));
    query
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");
    Ok(query)
}

fn build_update<'a>(
    table_name: &'a str,
    row_id: &str,
    payload: &Map<String, Value>,
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }
    let keys = sorted_keys(payload, false)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.as_str());
            separated.push_unseparated(" = r.");
            separated.push_unseparated(key.as_str());
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r WHERE ");
    push_id_filter(&mut query, row_id);
    query.push(" RETURNING row_to_json(t) AS row");
    Ok(query)
}

/// Inserts may carry an explicit `id`; updates never rewrite it.
fn sorted_keys(payload: &Map<String, Value>, include_id: bool) -> Result<Vec<String>, AppError> {
    let mut keys = Vec::with_capacity(payload.len());
    for key in payload.keys() {
        if key == "id" && !include_id {
            continue;
        }
        keys.push(validate_identifier(key)?.to_string());
    }
    if keys.is_empty() {
        return Err(AppError::BadRequest("No writable fields.".to_string()));
    }
    keys.sort_unstable();
    Ok(keys)
}

fn push_id_filter(query: &mut QueryBuilder<Postgres>, row_id: &str) {
    push_scalar_filter(
        query,
        "id",
        FilterOperator::Eq,
        &infer_scalar_filter("id", &Value::String(row_id.to_string())),
    );
}

fn read_row(row: Option<PgRow>) -> Option<Value> {
    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_soft_delete_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_table(table)?;
    if SOFT_DELETE_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::BadRequest(format!(
        "Table '{normalized}' does not support soft delete."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    let valid_chars = trimmed.chars().all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    });
    let starts_with_digit = trimmed
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_digit());
    if !valid_chars || starts_with_digit {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ScalarFilter {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    I64(i64),
    F64(f64),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

#[derive(Debug, Clone, PartialEq)]
enum ArrayFilter {
    Text(Vec<String>),
    Uuid(Vec<uuid::Uuid>),
    I64(Vec<i64>),
}

impl ArrayFilter {
    fn is_empty(&self) -> bool {
        match self {
            Self::Text(values) => values.is_empty(),
            Self::Uuid(values) => values.is_empty(),
            Self::I64(values) => values.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    ILike,
    IsNull,
}

impl FilterOperator {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => " = ",
            Self::Neq => " <> ",
            Self::Gt => " > ",
            Self::Gte => " >= ",
            Self::Lt => " < ",
            Self::Lte => " <= ",
            Self::Like => " LIKE ",
            Self::ILike => " ILIKE ",
            Self::IsNull => " IS NULL",
        }
    }
}

fn parse_filter_key(filter_key: &str) -> Result<(&str, FilterOperator), AppError> {
    let Some((column, suffix)) = filter_key.rsplit_once("__") else {
        return Ok((validate_identifier(filter_key)?, FilterOperator::Eq));
    };
    let operator = match suffix {
        "in" | "eq" => FilterOperator::Eq,
        "neq" => FilterOperator::Neq,
        "gt" => FilterOperator::Gt,
        "gte" => FilterOperator::Gte,
        "lt" => FilterOperator::Lt,
        "lte" => FilterOperator::Lte,
        "like" => FilterOperator::Like,
        "ilike" => FilterOperator::ILike,
        "is_null" => FilterOperator::IsNull,
        _ => {
            return Err(AppError::BadRequest(format!(
                "Unsupported filter operator '{suffix}'."
            )))
        }
    };
    Ok((validate_identifier(column)?, operator))
}

fn parse_bool_filter_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|parsed| parsed != 0.0),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "t" | "1" | "yes" | "y"
        ),
        _ => false,
    }
}

fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, operator) = parse_filter_key(filter_key)?;

    if operator == FilterOperator::IsNull {
        query.push(" AND t.").push(column);
        if parse_bool_filter_value(value) {
            query.push(" IS NULL");
        } else {
            query.push(" IS NOT NULL");
        }
        return Ok(());
    }

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if !matches!(operator, FilterOperator::Eq | FilterOperator::Neq) {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            let filter = infer_array_filter(column, items);
            if filter.is_empty() {
                // `x IN ()` matches nothing; `x NOT IN ()` matches everything.
                if operator == FilterOperator::Eq {
                    query.push(" AND FALSE");
                }
                return Ok(());
            }
            query.push(" AND ");
            push_array_filter(query, column, operator, &filter);
            Ok(())
        }
        _ => {
            query.push(" AND ");
            let filter = infer_scalar_filter(column, value);
            push_scalar_filter(query, column, operator, &filter);
            Ok(())
        }
    }
}

fn push_scalar_filter(
    query: &mut QueryBuilder<Postgres>,
    column: &str,
    operator: FilterOperator,
    value: &ScalarFilter,
) {
    query.push("t.").push(column);
    if matches!(operator, FilterOperator::Like | FilterOperator::ILike) {
        let pattern = match value {
            ScalarFilter::Text(text) => text.clone(),
            other => scalar_to_text(other),
        };
        query.push("::text").push(operator.sql()).push_bind(pattern);
        return;
    }

    let sql_operator = operator.sql();
    match value {
        ScalarFilter::Text(text) => {
            query.push("::text").push(sql_operator).push_bind(text.clone());
        }
        ScalarFilter::Uuid(id) => {
            query.push(sql_operator).push_bind(*id);
        }
        ScalarFilter::Bool(flag) => {
            query.push(sql_operator).push_bind(*flag);
        }
        ScalarFilter::I64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        ScalarFilter::F64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        ScalarFilter::Date(date) => {
            query.push(sql_operator).push_bind(*date);
        }
        ScalarFilter::Timestamp(timestamp) => {
            query.push(sql_operator).push_bind(*timestamp);
        }
    }
}

fn push_array_filter(
    query: &mut QueryBuilder<Postgres>,
    column: &str,
    operator: FilterOperator,
    value: &ArrayFilter,
) {
    if operator == FilterOperator::Neq {
        query.push("NOT ");
    }
    query.push("t.").push(column);
    match value {
        ArrayFilter::Text(values) => {
            query
                .push("::text = ANY(")
                .push_bind(values.clone())
                .push(")");
        }
        ArrayFilter::Uuid(values) => {
            query.push(" = ANY(").push_bind(values.clone()).push(")");
        }
        ArrayFilter::I64(values) => {
            query.push(" = ANY(").push_bind(values.clone()).push(")");
        }
    }
}

fn scalar_to_text(value: &ScalarFilter) -> String {
    match value {
        ScalarFilter::Text(text) => text.clone(),
        ScalarFilter::Uuid(id) => id.to_string(),
        ScalarFilter::Bool(flag) => flag.to_string(),
        ScalarFilter::I64(number) => number.to_string(),
        ScalarFilter::F64(number) => number.to_string(),
        ScalarFilter::Date(value) => value.to_string(),
        ScalarFilter::Timestamp(value) => value.to_rfc3339(),
    }
}

fn infer_scalar_filter(column: &str, value: &Value) -> ScalarFilter {
    match value {
        Value::Bool(flag) => ScalarFilter::Bool(*flag),
        Value::Number(number) => number
            .as_i64()
            .map(ScalarFilter::I64)
            .or_else(|| number.as_f64().map(ScalarFilter::F64))
            .unwrap_or_else(|| ScalarFilter::Text(number.to_string())),
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_identifier(column) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return ScalarFilter::Uuid(parsed);
                }
            }
            if is_timestamp_identifier(column) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return ScalarFilter::Timestamp(parsed);
                }
            }
            if is_date_identifier(column) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return ScalarFilter::Date(parsed);
                }
            }
            ScalarFilter::Text(text.clone())
        }
        _ => ScalarFilter::Text(render_scalar(value)),
    }
}

fn infer_array_filter(column: &str, values: &[Value]) -> ArrayFilter {
    if values.is_empty() {
        return ArrayFilter::Text(Vec::new());
    }

    if is_uuid_identifier(column) {
        let parsed = values
            .iter()
            .map(|value| {
                value
                    .as_str()
                    .and_then(|text| uuid::Uuid::parse_str(text.trim()).ok())
            })
            .collect::<Option<Vec<_>>>();
        if let Some(ids) = parsed {
            return ArrayFilter::Uuid(ids);
        }
    }

    if values.iter().all(|value| value.as_i64().is_some()) {
        return ArrayFilter::I64(values.iter().filter_map(Value::as_i64).collect());
    }

    ArrayFilter::Text(values.iter().map(render_scalar).collect())
}

// `audit_logs.entity_id` is free text, not a foreign key.
const TEXT_ID_COLUMNS: &[&str] = &["entity_id"];

fn is_uuid_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    if TEXT_ID_COLUMNS.contains(&normalized) {
        return false;
    }
    normalized == "id" || normalized.ends_with("_id")
}

fn is_date_identifier(identifier: &str) -> bool {
    identifier.trim().ends_with("_date")
}

fn is_timestamp_identifier(identifier: &str) -> bool {
    identifier.trim().ends_with("_at")
}

pub fn map_db_error(error: sqlx::Error) -> AppError {
    if matches!(error, sqlx::Error::RowNotFound) {
        return AppError::NotFound("Record not found.".to_string());
    }

    let code = error
        .as_database_error()
        .and_then(|db_error| db_error.code())
        .map(|code| code.into_owned());
    tracing::error!(db_error = %error, code = code.as_deref().unwrap_or(""), "Database query failed");
    map_sqlstate(code.as_deref())
}

fn map_sqlstate(code: Option<&str>) -> AppError {
    match code {
        Some("23505") => {
            AppError::Conflict("Duplicate value violates a unique constraint.".to_string())
        }
        Some("23503") => AppError::Conflict(
            "Referenced record does not exist or is still in use.".to_string(),
        ),
        Some("23514") | Some("23502") => {
            AppError::BadRequest("Value violates a table constraint.".to_string())
        }
        Some("22P02") | Some("22007") | Some("22008") => {
            AppError::BadRequest("Invalid value format.".to_string())
        }
        Some("22003") => AppError::BadRequest("Numeric value is out of range.".to_string()),
        _ => AppError::Dependency("Database operation failed.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};
    use sqlx::{Postgres, QueryBuilder};

    use super::{
        build_bulk_insert, build_insert, build_select, build_update, infer_array_filter,
        infer_scalar_filter, map_sqlstate, parse_filter_key, push_filter_clause,
        validate_identifier, validate_soft_delete_table, validate_table, ArrayFilter,
        FilterOperator, ScalarFilter,
    };
    use crate::error::AppError;

    const UNIT_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn payload(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn parses_filter_suffixes() {
        assert_eq!(
            parse_filter_key("due_date__lte").expect("valid"),
            ("due_date", FilterOperator::Lte)
        );
        assert_eq!(
            parse_filter_key("status__in").expect("valid"),
            ("status", FilterOperator::Eq)
        );
        assert_eq!(
            parse_filter_key("deleted_at__is_null").expect("valid"),
            ("deleted_at", FilterOperator::IsNull)
        );
        assert_eq!(
            parse_filter_key("unit_id").expect("valid"),
            ("unit_id", FilterOperator::Eq)
        );
        assert_eq!(
            parse_filter_key("code__like").expect("valid"),
            ("code", FilterOperator::Like)
        );
        assert!(matches!(
            parse_filter_key("amount__between"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn maps_sqlstates_to_client_errors() {
        assert!(matches!(map_sqlstate(Some("22003")), AppError::BadRequest(_)));
        assert!(matches!(map_sqlstate(Some("22P02")), AppError::BadRequest(_)));
        assert!(matches!(map_sqlstate(Some("23505")), AppError::Conflict(_)));
        assert!(matches!(map_sqlstate(Some("57P01")), AppError::Dependency(_)));
        assert!(matches!(map_sqlstate(None), AppError::Dependency(_)));
    }

    #[test]
    fn rejects_unsafe_identifiers_and_tables() {
        assert!(validate_identifier("full_name").is_ok());
        assert!(validate_identifier("1col").is_err());
        assert!(validate_identifier("name; drop table").is_err());
        assert!(matches!(
            validate_table("pg_authid"),
            Err(AppError::Forbidden(_))
        ));
        assert!(validate_soft_delete_table("customers").is_ok());
        assert!(validate_soft_delete_table("installments").is_err());
    }

    #[test]
    fn infers_filter_types_from_column_names() {
        assert_eq!(
            infer_scalar_filter("unit_id", &json!(UNIT_ID)),
            ScalarFilter::Uuid(uuid::Uuid::parse_str(UNIT_ID).expect("uuid"))
        );
        assert!(matches!(
            infer_scalar_filter("due_date", &json!("2026-03-01")),
            ScalarFilter::Date(_)
        ));
        assert!(matches!(
            infer_scalar_filter("paid_at", &json!("2026-03-01T10:00:00+02:00")),
            ScalarFilter::Timestamp(_)
        ));
        assert_eq!(
            infer_scalar_filter("status", &json!("paid")),
            ScalarFilter::Text("paid".to_string())
        );
        assert_eq!(infer_scalar_filter("sequence", &json!(3)), ScalarFilter::I64(3));
        assert_eq!(
            infer_scalar_filter("entity_id", &json!(UNIT_ID)),
            ScalarFilter::Text(UNIT_ID.to_string())
        );
    }

    #[test]
    fn array_filters_fall_back_to_text() {
        assert!(matches!(
            infer_array_filter("unit_id", &[json!(UNIT_ID)]),
            ArrayFilter::Uuid(_)
        ));
        assert!(matches!(
            infer_array_filter("unit_id", &[json!(UNIT_ID), json!("nope")]),
            ArrayFilter::Text(_)
        ));
        assert_eq!(
            infer_array_filter("status", &[json!("pending"), json!("overdue")]),
            ArrayFilter::Text(vec!["pending".to_string(), "overdue".to_string()])
        );
    }

    #[test]
    fn empty_in_filter_matches_nothing() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM units t WHERE 1=1");
        push_filter_clause(&mut query, "status__in", &json!([])).expect("filter");
        assert!(query.sql().ends_with(" AND FALSE"));
    }

    #[test]
    fn select_sql_applies_filters_and_tiebreak_order() {
        let filters = payload(&[
            ("deleted_at__is_null", json!(true)),
            ("status", json!("available")),
        ]);
        let query = build_select("units", Some(&filters), "code", true).expect("select");
        let sql = query.sql();
        assert!(sql.contains("t.deleted_at IS NULL"), "got: {sql}");
        assert!(sql.contains("t.status::text = $1"), "got: {sql}");
        assert!(sql.ends_with("ORDER BY t.code ASC, t.id ASC"), "got: {sql}");
    }

    #[test]
    fn insert_sql_uses_jsonb_populate_record() {
        let record = payload(&[
            ("full_name", json!("Mona Adel")),
            ("phone", json!("+201000000000")),
            ("id", json!(UNIT_ID)),
        ]);
        let query = build_insert("customers", &record).expect("insert");
        let sql = query.sql();
        assert!(
            sql.contains(
                "INSERT INTO customers (full_name, id, phone) SELECT r.full_name, r.id, r.phone"
            ),
            "got: {sql}"
        );
        assert!(
            sql.contains("jsonb_populate_record(NULL::customers"),
            "got: {sql}"
        );
    }

    #[test]
    fn bulk_insert_requires_matching_columns() {
        let first = payload(&[("contract_id", json!(UNIT_ID)), ("sequence", json!(1))]);
        let second = payload(&[("contract_id", json!(UNIT_ID)), ("sequence", json!(2))]);
        let query = build_bulk_insert("installments", &[first.clone(), second]).expect("insert");
        assert!(
            query.sql().contains("jsonb_populate_recordset(NULL::installments"),
            "got: {}",
            query.sql()
        );

        let ragged = payload(&[("contract_id", json!(UNIT_ID))]);
        assert!(build_bulk_insert("installments", &[first, ragged]).is_err());
    }

    #[test]
    fn update_sql_sets_columns_from_record() {
        let patch = payload(&[("notes", json!("corner unit")), ("status", json!("reserved"))]);
        let query = build_update("units", UNIT_ID, &patch).expect("update");
        let sql = query.sql();
        assert!(
            sql.contains("SET notes = r.notes, status = r.status"),
            "got: {sql}"
        );
        assert!(sql.contains("WHERE t.id = $2"), "got: {sql}");
    }

    #[test]
    fn empty_payloads_are_rejected() {
        assert!(matches!(
            build_update("units", UNIT_ID, &Map::new()),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            build_insert("units", &Map::new()),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            build_update("units", UNIT_ID, &payload(&[("id", json!(UNIT_ID))])),
            Err(AppError::BadRequest(_))
        ));
    }
}
