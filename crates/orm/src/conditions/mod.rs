//! Shared condition-tree helpers used by every compiler
//!
//! The condition tree itself is a plain `serde_json::Value`: a leaf maps a
//! column to a literal or to a single/multi `$op` object; `$and`/`$or` keys
//! combine subtrees; multi-key maps AND implicitly.

use serde_json::Value as JsonValue;

use crate::error::{OrmError, OrmResult};
use crate::schema::ModelSchema;

/// Comparison operators that take a literal right-hand side
pub const COMPARE_OPERATORS: &[&str] = &["$gt", "$gte", "$lt", "$lte"];

/// Column-to-column comparison operators; the right-hand side names a column
pub const COLUMN_OPERATORS: &[&str] = &["$ceq", "$cne", "$cgt", "$cgte", "$clt", "$clte"];

/// String pattern operators
pub const STRING_OPERATORS: &[&str] = &["$contains", "$startswith", "$endswith"];

/// True when a key is an operator dispatch point rather than a column name
pub fn is_operator_key(key: &str) -> bool {
    key.starts_with('$')
}

/// Escape SQL LIKE metacharacters (`%`, `_`, `\`) in a literal fragment
pub fn escape_like(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// One entry of an order specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSpec {
    /// Storage name of the sorted column
    pub column: String,
    pub descending: bool,
}

/// Parse an order entry (`"age"` ascending, `"-age"` descending) against the
/// schema, resolving the logical name to the storage name.
pub fn parse_order(schema: &ModelSchema, spec: &str) -> OrmResult<OrderSpec> {
    let (descending, name) = match spec.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, spec),
    };
    let column = schema.storage_name(name)?.to_string();
    Ok(OrderSpec { column, descending })
}

/// Parse a full order list
pub fn parse_orders(schema: &ModelSchema, specs: &[String]) -> OrmResult<Vec<OrderSpec>> {
    specs.iter().map(|s| parse_order(schema, s)).collect()
}

/// Validate a select projection against the schema, returning storage names
pub fn resolve_select(schema: &ModelSchema, columns: &[String]) -> OrmResult<Vec<String>> {
    columns
        .iter()
        .map(|c| schema.storage_name(c).map(str::to_string))
        .collect()
}

/// Merge two condition trees with an implicit AND
pub fn merge_and(left: Option<JsonValue>, right: JsonValue) -> JsonValue {
    match left {
        None => right,
        Some(left) => serde_json::json!({ "$and": [left, right] }),
    }
}

/// Fail with [`OrmError::UnknownOperator`] for an unrecognized key
pub fn unknown_operator(key: &str) -> OrmError {
    OrmError::UnknownOperator(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, SchemaBuilder};

    fn schema() -> ModelSchema {
        let mut builder = SchemaBuilder::new("User", "users");
        builder.column("age", ColumnType::Integer);
        builder.column_schema(
            crate::schema::ColumnSchema::new("name", ColumnType::String(None)).stored_as("full_name"),
        );
        builder.freeze(Vec::new())
    }

    #[test]
    fn like_escaping_covers_metacharacters() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn order_prefix_parses_direction_and_storage_name() {
        let s = schema();
        let asc = parse_order(&s, "name").unwrap();
        assert_eq!(asc.column, "full_name");
        assert!(!asc.descending);
        let desc = parse_order(&s, "-age").unwrap();
        assert_eq!(desc.column, "age");
        assert!(desc.descending);
    }

    #[test]
    fn order_on_unknown_column_fails() {
        let err = parse_order(&schema(), "-height").unwrap_err();
        assert!(matches!(err, OrmError::UnknownColumn(c) if c == "height"));
    }

    #[test]
    fn merge_and_wraps_existing_conditions() {
        let merged = merge_and(
            Some(serde_json::json!({"age": 1})),
            serde_json::json!({"name": "a"}),
        );
        assert_eq!(
            merged,
            serde_json::json!({"$and": [{"age": 1}, {"name": "a"}]})
        );
    }
}
