//! Literal coercion for typed columns
//!
//! Condition literals are converted to the column's canonical form before
//! they reach a backend. Two rules here are load-bearing and covered by
//! tests:
//!
//! - Date columns accept RFC 3339 strings or epoch milliseconds and
//!   canonicalize to an RFC 3339 UTC string.
//! - Integer/number columns clamp out-of-range and NaN literals to the
//!   type's sentinel extremes instead of erroring, so a nonsense comparison
//!   matches no rows rather than crashing the query.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::error::OrmResult;

use super::column::{ColumnSchema, ColumnType};

/// Coerce a condition or record literal to the column's canonical value.
///
/// Null passes through untouched for every type. Values that cannot be
/// interpreted at all also pass through; the backend comparison will then
/// simply not match, which is the documented outcome.
pub fn coerce_value(column: &ColumnSchema, value: &JsonValue) -> OrmResult<JsonValue> {
    if value.is_null() {
        return Ok(JsonValue::Null);
    }
    let coerced = match &column.column_type {
        ColumnType::Integer => clamp_integer(value, i32::MIN as i64, i32::MAX as i64),
        ColumnType::BigInteger | ColumnType::RecordId => {
            clamp_integer(value, i64::MIN, i64::MAX)
        }
        ColumnType::Number => clamp_number(value),
        ColumnType::Date => coerce_date(value),
        ColumnType::Boolean => value.as_bool().map(JsonValue::Bool),
        ColumnType::String(_) | ColumnType::Text => match value {
            JsonValue::String(_) => Some(value.clone()),
            other => Some(JsonValue::String(other.to_string())),
        },
        ColumnType::Object | ColumnType::GeoPoint | ColumnType::Blob => Some(value.clone()),
    };
    Ok(coerced.unwrap_or_else(|| value.clone()))
}

/// Coerce every element of an array literal (`$in` values)
pub fn coerce_array(column: &ColumnSchema, values: &[JsonValue]) -> OrmResult<Vec<JsonValue>> {
    values.iter().map(|v| coerce_value(column, v)).collect()
}

fn clamp_integer(value: &JsonValue, min: i64, max: i64) -> Option<JsonValue> {
    // Exact integer input never takes the f64 path, which loses precision
    // above 2^53
    let n = match value {
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(json!(i.clamp(min, max)));
            }
            if n.as_u64().is_some() {
                // u64 beyond i64::MAX
                return Some(json!(max));
            }
            n.as_f64()?
        }
        JsonValue::String(s) => {
            if let Ok(i) = s.parse::<i64>() {
                return Some(json!(i.clamp(min, max)));
            }
            s.parse::<f64>().unwrap_or(f64::NAN)
        }
        _ => return None,
    };
    // NaN clamps low so `> NaN` matches nothing, out-of-range clamps to the
    // nearer extreme
    let clamped = if n.is_nan() {
        min
    } else if n >= max as f64 {
        max
    } else if n <= min as f64 {
        min
    } else {
        n as i64
    };
    Some(json!(clamped))
}

fn clamp_number(value: &JsonValue) -> Option<JsonValue> {
    let n = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.parse::<f64>().unwrap_or(f64::NAN),
        _ => return None,
    };
    let clamped = if n.is_nan() || n == f64::NEG_INFINITY {
        f64::MIN
    } else if n == f64::INFINITY {
        f64::MAX
    } else {
        n
    };
    Some(json!(clamped))
}

fn coerce_date(value: &JsonValue) -> Option<JsonValue> {
    let datetime: DateTime<Utc> = match value {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok()?,
        JsonValue::Number(n) => {
            let millis = n.as_i64()?;
            Utc.timestamp_millis_opt(millis).single()?
        }
        _ => return None,
    };
    Some(JsonValue::String(
        datetime.to_rfc3339_opts(SecondsFormat::Millis, true),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(column_type: ColumnType) -> ColumnSchema {
        ColumnSchema::new("value", column_type)
    }

    #[test]
    fn integer_in_range_passes_through() {
        let c = column(ColumnType::Integer);
        assert_eq!(coerce_value(&c, &json!(42)).unwrap(), json!(42));
        assert_eq!(coerce_value(&c, &json!(-7)).unwrap(), json!(-7));
    }

    #[test]
    fn integer_out_of_range_clamps_to_extremes() {
        let c = column(ColumnType::Integer);
        assert_eq!(
            coerce_value(&c, &json!(9_999_999_999i64)).unwrap(),
            json!(i32::MAX as i64)
        );
        assert_eq!(
            coerce_value(&c, &json!(-9_999_999_999i64)).unwrap(),
            json!(i32::MIN as i64)
        );
    }

    #[test]
    fn big_integer_in_range_keeps_exact_value() {
        let c = column(ColumnType::BigInteger);
        let big = 9_007_199_254_740_993i64; // 2^53 + 1, not representable as f64
        assert_eq!(coerce_value(&c, &json!(big)).unwrap(), json!(big));
        assert_eq!(
            coerce_value(&c, &json!(big.to_string())).unwrap(),
            json!(big)
        );
        assert_eq!(
            coerce_value(&c, &json!(u64::MAX)).unwrap(),
            json!(i64::MAX)
        );
    }

    #[test]
    fn integer_nan_clamps_low() {
        let c = column(ColumnType::Integer);
        assert_eq!(
            coerce_value(&c, &json!("not-a-number")).unwrap(),
            json!(i32::MIN as i64)
        );
    }

    #[test]
    fn number_infinity_clamps() {
        let c = column(ColumnType::Number);
        assert_eq!(coerce_value(&c, &json!(1.5)).unwrap(), json!(1.5));
        assert_eq!(
            coerce_value(&c, &json!("inf")).unwrap(),
            json!(f64::MAX)
        );
    }

    #[test]
    fn date_from_epoch_millis_canonicalizes() {
        let c = column(ColumnType::Date);
        let coerced = coerce_value(&c, &json!(0)).unwrap();
        assert_eq!(coerced, json!("1970-01-01T00:00:00.000Z"));
    }

    #[test]
    fn date_from_rfc3339_canonicalizes_to_utc() {
        let c = column(ColumnType::Date);
        let coerced = coerce_value(&c, &json!("2024-03-01T12:00:00+02:00")).unwrap();
        assert_eq!(coerced, json!("2024-03-01T10:00:00.000Z"));
    }

    #[test]
    fn null_passes_through_every_type() {
        for t in [ColumnType::Integer, ColumnType::Date, ColumnType::Text] {
            assert_eq!(coerce_value(&column(t), &JsonValue::Null).unwrap(), JsonValue::Null);
        }
    }
}
