//! In-process evaluation of compiled filter documents
//!
//! The document and key-value backends have no query engine of their own;
//! they compile conditions to the document form and evaluate it here,
//! client-side. Group aggregation and ordering for those backends also
//! live here.

use std::cmp::Ordering;
use std::collections::HashMap;

use regex::RegexBuilder;
use serde_json::{json, Map, Value as JsonValue};

use crate::conditions::OrderSpec;

use super::group::{Aggregate, AggregateSource, GroupSpec};

/// Look up a possibly dotted path inside a record
pub fn get_path<'a>(record: &'a JsonValue, path: &str) -> &'a JsonValue {
    let mut current = record;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return &JsonValue::Null,
        }
    }
    current
}

/// Evaluate a compiled filter document against one record
pub fn matches(filter: &JsonValue, record: &JsonValue) -> bool {
    let map = match filter {
        JsonValue::Object(map) => map,
        _ => return false,
    };
    map.iter().all(|(key, value)| match key.as_str() {
        "$and" => value
            .as_array()
            .map(|cs| cs.iter().all(|c| matches(c, record)))
            .unwrap_or(false),
        "$or" => value
            .as_array()
            .map(|cs| cs.iter().any(|c| matches(c, record)))
            .unwrap_or(false),
        "$expr" => matches_expr(value, record),
        field => matches_field(get_path(record, field), value),
    })
}

fn matches_expr(expr: &JsonValue, record: &JsonValue) -> bool {
    let Some(map) = expr.as_object() else {
        return false;
    };
    let Some((op, operands)) = map.iter().next() else {
        return false;
    };
    let Some(pair) = operands.as_array().filter(|a| a.len() == 2) else {
        return false;
    };
    let resolve = |v: &JsonValue| -> JsonValue {
        match v.as_str().and_then(|s| s.strip_prefix('$')) {
            Some(path) => get_path(record, path).clone(),
            None => v.clone(),
        }
    };
    let left = resolve(&pair[0]);
    let right = resolve(&pair[1]);
    let Some(ordering) = compare(&left, &right) else {
        return false;
    };
    match op.as_str() {
        "$eq" => ordering == Ordering::Equal,
        "$ne" => ordering != Ordering::Equal,
        "$gt" => ordering == Ordering::Greater,
        "$gte" => ordering != Ordering::Less,
        "$lt" => ordering == Ordering::Less,
        "$lte" => ordering != Ordering::Greater,
        _ => false,
    }
}

fn matches_field(actual: &JsonValue, expected: &JsonValue) -> bool {
    match expected {
        JsonValue::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            ops.iter().all(|(op, operand)| match op.as_str() {
                "$gt" => compare(actual, operand) == Some(Ordering::Greater),
                "$gte" => matches!(compare(actual, operand), Some(Ordering::Greater | Ordering::Equal)),
                "$lt" => compare(actual, operand) == Some(Ordering::Less),
                "$lte" => matches!(compare(actual, operand), Some(Ordering::Less | Ordering::Equal)),
                "$in" => operand
                    .as_array()
                    .map(|vs| vs.iter().any(|v| values_equal(actual, v)))
                    .unwrap_or(false),
                "$nin" => operand
                    .as_array()
                    .map(|vs| !vs.iter().any(|v| values_equal(actual, v)))
                    .unwrap_or(false),
                "$ne" => !values_equal(actual, operand),
                "$regex" => matches_regex(actual, operand),
                // Proximity is a sort, not a predicate; every candidate
                // passes and the caller orders by distance
                "$near" => true,
                _ => false,
            })
        }
        literal => values_equal(actual, literal),
    }
}

fn matches_regex(actual: &JsonValue, operand: &JsonValue) -> bool {
    let Some(text) = actual.as_str() else {
        return false;
    };
    let (pattern, case_insensitive) = match operand {
        JsonValue::Object(spec) => (
            spec.get("pattern").and_then(|p| p.as_str()).unwrap_or(""),
            spec.get("options")
                .and_then(|o| o.as_str())
                .map(|o| o.contains('i'))
                .unwrap_or(false),
        ),
        JsonValue::String(pattern) => (pattern.as_str(), false),
        _ => return false,
    };
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

/// Total-ish ordering over JSON scalars: numbers by value, strings
/// lexicographically, booleans false < true. Mixed types are incomparable.
pub fn compare(left: &JsonValue, right: &JsonValue) -> Option<Ordering> {
    match (left, right) {
        (JsonValue::Number(l), JsonValue::Number(r)) => {
            l.as_f64()?.partial_cmp(&r.as_f64()?)
        }
        (JsonValue::String(l), JsonValue::String(r)) => Some(l.cmp(r)),
        (JsonValue::Bool(l), JsonValue::Bool(r)) => Some(l.cmp(r)),
        (JsonValue::Null, JsonValue::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn values_equal(left: &JsonValue, right: &JsonValue) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l == r;
    }
    left == right
}

/// Split a compiled filter into its `$near` component (field, [x, y]) and
/// the remaining predicate
pub fn extract_near(filter: &JsonValue) -> (Option<(String, [f64; 2])>, JsonValue) {
    let JsonValue::Object(map) = filter else {
        return (None, filter.clone());
    };
    let mut near = None;
    let mut rest = Map::new();
    for (key, value) in map {
        let near_point = value
            .as_object()
            .and_then(|ops| ops.get("$near"))
            .and_then(parse_point);
        match near_point {
            Some(point) if !key.starts_with('$') => {
                near = Some((key.clone(), point));
                // Keep any sibling operators on the same field
                let remaining: Map<String, JsonValue> = value
                    .as_object()
                    .map(|ops| {
                        ops.iter()
                            .filter(|(op, _)| op.as_str() != "$near")
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                if !remaining.is_empty() {
                    rest.insert(key.clone(), JsonValue::Object(remaining));
                }
            }
            _ => {
                rest.insert(key.clone(), value.clone());
            }
        }
    }
    (near, JsonValue::Object(rest))
}

fn parse_point(value: &JsonValue) -> Option<[f64; 2]> {
    let array = value.as_array()?;
    if array.len() != 2 {
        return None;
    }
    Some([array[0].as_f64()?, array[1].as_f64()?])
}

/// Planar distance used for `$near` ordering
pub fn distance(point: &JsonValue, target: [f64; 2]) -> f64 {
    match parse_point(point) {
        Some([x, y]) => ((x - target[0]).powi(2) + (y - target[1]).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

/// Sort records in place by an order list
pub fn apply_order(records: &mut [JsonValue], orders: &[OrderSpec]) {
    records.sort_by(|a, b| {
        for order in orders {
            let ordering = compare(get_path(a, &order.column), get_path(b, &order.column))
                .unwrap_or(Ordering::Equal);
            let ordering = if order.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Execute a group specification over filtered records
pub fn execute_group(records: &[JsonValue], spec: &GroupSpec) -> Vec<JsonValue> {
    let mut groups: Vec<(Vec<JsonValue>, Vec<&JsonValue>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        let key_values: Vec<JsonValue> = spec
            .by
            .iter()
            .map(|(_, storage)| get_path(record, storage).clone())
            .collect();
        let key = serde_json::to_string(&key_values).unwrap_or_default();
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push((key_values, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(record);
    }

    // No group-by columns still yields the single implicit group
    if spec.by.is_empty() && groups.is_empty() {
        groups.push((Vec::new(), Vec::new()));
    }

    groups
        .into_iter()
        .map(|(keys, members)| {
            let mut row = Map::new();
            for ((logical, _), key) in spec.by.iter().zip(keys) {
                row.insert(logical.clone(), key);
            }
            for field in &spec.fields {
                row.insert(field.name.clone(), aggregate(&members, &field.aggregate));
            }
            JsonValue::Object(row)
        })
        .collect()
}

fn aggregate(members: &[&JsonValue], aggregate: &Aggregate) -> JsonValue {
    if aggregate.is_count() {
        return json!(members.len());
    }
    let values: Vec<f64> = members
        .iter()
        .filter_map(|record| match aggregate.source() {
            AggregateSource::Column(storage) => get_path(record, storage).as_f64(),
            AggregateSource::Literal(n) => Some(*n),
        })
        .collect();
    match aggregate {
        Aggregate::Sum(_) => json!(values.iter().sum::<f64>()),
        Aggregate::Min(_) => values
            .iter()
            .cloned()
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.min(v))))
            .map(|v| json!(v))
            .unwrap_or(JsonValue::Null),
        Aggregate::Max(_) => values
            .iter()
            .cloned()
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))))
            .map(|v| json!(v))
            .unwrap_or(JsonValue::Null),
        Aggregate::Avg(_) => {
            if values.is_empty() {
                JsonValue::Null
            } else {
                json!(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        Aggregate::Any(_) => match aggregate.source() {
            AggregateSource::Column(storage) => members
                .first()
                .map(|r| get_path(r, storage).clone())
                .unwrap_or(JsonValue::Null),
            AggregateSource::Literal(n) => json!(n),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::group::parse_group;
    use crate::schema::{ColumnType, SchemaBuilder};

    #[test]
    fn field_comparisons_evaluate() {
        let record = json!({"age": 25, "name": "Ada"});
        assert!(matches(&json!({"age": {"$gt": 10}}), &record));
        assert!(!matches(&json!({"age": {"$gt": 30}}), &record));
        assert!(matches(&json!({"age": {"$in": [24, 25]}}), &record));
        assert!(!matches(&json!({"age": {"$in": []}}), &record));
        assert!(matches(&json!({"name": "Ada"}), &record));
    }

    #[test]
    fn regex_honours_case_insensitive_option() {
        let record = json!({"name": "Ada Lovelace"});
        let filter = json!({"name": {"$regex": {"pattern": "lovelace", "options": "i"}}});
        assert!(matches(&filter, &record));
        let sensitive = json!({"name": {"$regex": "lovelace"}});
        assert!(!matches(&sensitive, &record));
    }

    #[test]
    fn expr_compares_columns() {
        let record = json!({"a": 3, "b": 7});
        assert!(matches(&json!({"$expr": {"$lt": ["$a", "$b"]}}), &record));
        assert!(!matches(&json!({"$expr": {"$eq": ["$a", "$b"]}}), &record));
    }

    #[test]
    fn nested_paths_resolve() {
        let record = json!({"address": {"city": "Paris"}});
        assert!(matches(&json!({"address.city": "Paris"}), &record));
        assert!(matches(&json!({"address.country": null}), &record));
    }

    #[test]
    fn near_extraction_preserves_rest() {
        let filter = json!({"location": {"$near": [1.0, 2.0]}, "age": {"$gt": 5}});
        let (near, rest) = extract_near(&filter);
        assert_eq!(near, Some(("location".to_string(), [1.0, 2.0])));
        assert_eq!(rest, json!({"age": {"$gt": 5}}));
    }

    #[test]
    fn order_sorts_with_direction() {
        let mut records = vec![json!({"age": 3}), json!({"age": 1}), json!({"age": 2})];
        apply_order(
            &mut records,
            &[OrderSpec {
                column: "age".to_string(),
                descending: true,
            }],
        );
        let ages: Vec<i64> = records.iter().map(|r| r["age"].as_i64().unwrap()).collect();
        assert_eq!(ages, vec![3, 2, 1]);
    }

    #[test]
    fn implicit_group_counts_and_sums() {
        let mut builder = SchemaBuilder::new("Order", "orders");
        builder.column("price", ColumnType::Number);
        let schema = builder.freeze(Vec::new());
        let spec = parse_group(
            &schema,
            None,
            &json!({"count": {"$sum": 1}, "total": {"$sum": "$price"}}),
        )
        .unwrap();
        let records = vec![json!({"price": 10}), json!({"price": 20}), json!({"price": 5})];
        let rows = execute_group(&records, &spec);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["count"], json!(3));
        assert_eq!(rows[0]["total"], json!(35.0));
    }

    #[test]
    fn grouped_aggregation_splits_by_key() {
        let mut builder = SchemaBuilder::new("Order", "orders");
        builder.column("customer", ColumnType::String(None));
        builder.column("price", ColumnType::Number);
        let schema = builder.freeze(Vec::new());
        let spec = parse_group(
            &schema,
            Some(&json!("customer")),
            &json!({"max": {"$max": "$price"}}),
        )
        .unwrap();
        let records = vec![
            json!({"customer": "a", "price": 10}),
            json!({"customer": "b", "price": 30}),
            json!({"customer": "a", "price": 20}),
        ];
        let mut rows = execute_group(&records, &spec);
        rows.sort_by_key(|r| r["customer"].as_str().unwrap_or("").to_string());
        assert_eq!(rows[0]["max"], json!(20.0));
        assert_eq!(rows[1]["max"], json!(30.0));
    }
}
