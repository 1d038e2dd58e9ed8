//! Small accessors for JSON rows returned by the table service.

use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};

pub fn value_str(row: &Value, key: &str) -> String {
    value_opt_str(row, key).unwrap_or_default()
}

pub fn value_opt_str(row: &Value, key: &str) -> Option<String> {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

/// Numeric columns arrive as JSON numbers from `row_to_json`, but tolerate strings.
pub fn number_from_value(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => text.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub fn value_number(row: &Value, key: &str) -> f64 {
    number_from_value(row.get(key))
}

pub fn value_date(row: &Value, key: &str) -> Option<NaiveDate> {
    value_opt_str(row, key).and_then(|text| {
        let date_part = text.get(..10).unwrap_or(&text);
        NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
    })
}

pub fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}

pub fn json_map(entries: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert((*key).to_string(), value.clone());
    }
    map
}

pub fn parse_date(value: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(format!("Invalid ISO date '{}'.", value.trim())))
}

/// Resolve an optional `paid_at` input (ISO date or RFC 3339 timestamp) into
/// the business date it falls on and the timestamp stored on the row.
pub fn payment_moment(
    raw: Option<&str>,
    today: NaiveDate,
    timezone: chrono_tz::Tz,
) -> AppResult<(NaiveDate, String)> {
    let Some(raw) = non_empty_opt(raw) else {
        return Ok((today, chrono::Utc::now().to_rfc3339()));
    };
    if let Ok(timestamp) = chrono::DateTime::parse_from_rfc3339(&raw) {
        let business_day = timestamp.with_timezone(&timezone).date_naive();
        return Ok((business_day, timestamp.to_rfc3339()));
    }
    let date = parse_date(&raw)?;
    if date == today {
        return Ok((date, chrono::Utc::now().to_rfc3339()));
    }
    let noon = date
        .and_hms_opt(12, 0, 0)
        .map(|value| value.and_utc().to_rfc3339())
        .unwrap_or_else(|| format!("{date}T12:00:00+00:00"));
    Ok((date, noon))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn round4(value: f64) -> f64 {
    (value * 10000.0).round() / 10000.0
}

/// Money comparisons tolerate half a cent of float drift.
pub fn money_eq(left: f64, right: f64) -> bool {
    (left - right).abs() < 0.005
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        money_eq, number_from_value, parse_date, payment_moment, round2, value_date, value_str,
    };

    #[test]
    fn reads_trimmed_strings() {
        let row = json!({"name": "  Tower A ", "blank": "  "});
        assert_eq!(value_str(&row, "name"), "Tower A");
        assert_eq!(value_str(&row, "blank"), "");
        assert_eq!(value_str(&row, "missing"), "");
    }

    #[test]
    fn reads_numbers_and_numeric_strings() {
        assert_eq!(number_from_value(Some(&json!(12.5))), 12.5);
        assert_eq!(number_from_value(Some(&json!("99.10"))), 99.1);
        assert_eq!(number_from_value(Some(&json!(null))), 0.0);
    }

    #[test]
    fn reads_dates_from_date_and_timestamp_columns() {
        let row = json!({"due_date": "2026-02-28", "paid_at": "2026-03-01T09:30:00+02:00"});
        assert_eq!(value_date(&row, "due_date"), parse_date("2026-02-28").ok());
        assert_eq!(value_date(&row, "paid_at"), parse_date("2026-03-01").ok());
        assert!(parse_date("01/03/2026").is_err());
    }

    #[test]
    fn rounds_money() {
        assert_eq!(round2(10.005_1), 10.01);
        assert!(money_eq(0.1 + 0.2, 0.3));
        assert!(!money_eq(100.0, 100.01));
    }

    #[test]
    fn resolves_payment_dates() {
        let today = parse_date("2026-06-10").expect("date");
        let tz = chrono_tz::Africa::Cairo;
        let (date, _) = payment_moment(None, today, tz).expect("default");
        assert_eq!(date, today);

        let (date, stamp) = payment_moment(Some("2026-06-01"), today, tz).expect("date");
        assert_eq!(date, parse_date("2026-06-01").expect("date"));
        assert_eq!(stamp, "2026-06-01T12:00:00+00:00");

        let (date, _) = payment_moment(Some("2026-06-02T20:30:00+03:00"), today, tz).expect("ts");
        assert_eq!(date, parse_date("2026-06-02").expect("date"));

        assert!(payment_moment(Some("yesterday"), today, tz).is_err());
    }

    #[test]
    fn timestamps_fall_on_the_business_day() {
        let today = parse_date("2026-06-10").expect("date");
        // 23:30 UTC is already the next day in Cairo.
        let (date, stamp) =
            payment_moment(Some("2026-06-02T23:30:00Z"), today, chrono_tz::Africa::Cairo)
                .expect("ts");
        assert_eq!(date, parse_date("2026-06-03").expect("date"));
        assert_eq!(stamp, "2026-06-02T23:30:00+00:00");

        let (date, _) =
            payment_moment(Some("2026-06-02T23:30:00Z"), today, chrono_tz::Tz::UTC).expect("ts");
        assert_eq!(date, parse_date("2026-06-02").expect("date"));
    }
}
