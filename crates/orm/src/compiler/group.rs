//! Group/aggregation specification parsing
//!
//! A group specification is a group-by column list (possibly empty, meaning
//! one implicit group) and a map of output name to aggregate expression.
//! `{$sum: 1}` is the conventional count spelling.

use serde_json::Value as JsonValue;

use crate::error::{OrmError, OrmResult};
use crate::schema::ModelSchema;

/// Operand of an aggregate expression
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateSource {
    /// `"$column"` reference, resolved to the storage name
    Column(String),
    /// Numeric literal; `$sum` over literal 1 counts rows
    Literal(f64),
}

/// One aggregate expression
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    Sum(AggregateSource),
    Min(AggregateSource),
    Max(AggregateSource),
    Avg(AggregateSource),
    /// Any one value from the group
    Any(AggregateSource),
}

impl Aggregate {
    pub fn source(&self) -> &AggregateSource {
        match self {
            Aggregate::Sum(s)
            | Aggregate::Min(s)
            | Aggregate::Max(s)
            | Aggregate::Avg(s)
            | Aggregate::Any(s) => s,
        }
    }

    /// `$sum` over the literal 1, i.e. a row count
    pub fn is_count(&self) -> bool {
        matches!(self, Aggregate::Sum(AggregateSource::Literal(n)) if *n == 1.0)
    }
}

/// One output field of a group query
#[derive(Debug, Clone, PartialEq)]
pub struct GroupField {
    pub name: String,
    pub aggregate: Aggregate,
}

/// Parsed group specification
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupSpec {
    /// (logical name, storage name) pairs of the group-by columns
    pub by: Vec<(String, String)>,
    pub fields: Vec<GroupField>,
}

/// Parse a group-by input (`null`, a column name, or a list of column names)
/// plus a field map into a [`GroupSpec`], resolving every column reference
/// against the schema.
pub fn parse_group(
    schema: &ModelSchema,
    group_by: Option<&JsonValue>,
    fields: &JsonValue,
) -> OrmResult<GroupSpec> {
    let mut spec = GroupSpec::default();

    match group_by {
        None | Some(JsonValue::Null) => {}
        Some(JsonValue::String(name)) => {
            spec.by
                .push((name.clone(), schema.storage_name(name)?.to_string()));
        }
        Some(JsonValue::Array(names)) => {
            for name in names {
                let name = name
                    .as_str()
                    .ok_or_else(|| OrmError::UnknownColumn(name.to_string()))?;
                spec.by
                    .push((name.to_string(), schema.storage_name(name)?.to_string()));
            }
        }
        Some(other) => return Err(OrmError::UnknownColumn(other.to_string())),
    }

    let field_map = fields
        .as_object()
        .ok_or_else(|| OrmError::UnknownAggregate(fields.to_string()))?;
    for (name, expr) in field_map {
        spec.fields.push(GroupField {
            name: name.clone(),
            aggregate: parse_aggregate(schema, expr)?,
        });
    }
    Ok(spec)
}

fn parse_aggregate(schema: &ModelSchema, expr: &JsonValue) -> OrmResult<Aggregate> {
    let map = expr
        .as_object()
        .ok_or_else(|| OrmError::UnknownAggregate(expr.to_string()))?;
    if map.len() != 1 {
        return Err(OrmError::UnknownAggregate(expr.to_string()));
    }
    let (key, operand) = map
        .iter()
        .next()
        .ok_or_else(|| OrmError::UnknownAggregate(expr.to_string()))?;
    let source = parse_source(schema, operand)?;
    match key.as_str() {
        "$sum" => Ok(Aggregate::Sum(source)),
        "$min" => Ok(Aggregate::Min(source)),
        "$max" => Ok(Aggregate::Max(source)),
        "$avg" => Ok(Aggregate::Avg(source)),
        "$any" => Ok(Aggregate::Any(source)),
        other => Err(OrmError::UnknownAggregate(other.to_string())),
    }
}

fn parse_source(schema: &ModelSchema, operand: &JsonValue) -> OrmResult<AggregateSource> {
    match operand {
        JsonValue::Number(n) => Ok(AggregateSource::Literal(n.as_f64().unwrap_or(0.0))),
        JsonValue::String(s) => {
            let name = s
                .strip_prefix('$')
                .ok_or_else(|| OrmError::UnknownAggregate(s.clone()))?;
            Ok(AggregateSource::Column(
                schema.storage_name(name)?.to_string(),
            ))
        }
        other => Err(OrmError::UnknownAggregate(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, SchemaBuilder};
    use serde_json::json;

    fn schema() -> ModelSchema {
        let mut builder = SchemaBuilder::new("Order", "orders");
        builder.column("price", ColumnType::Number);
        builder.column("customer", ColumnType::String(None));
        builder.freeze(Vec::new())
    }

    #[test]
    fn count_and_total_parse() {
        let spec = parse_group(
            &schema(),
            None,
            &json!({"count": {"$sum": 1}, "total": {"$sum": "$price"}}),
        )
        .unwrap();
        assert!(spec.by.is_empty());
        let count = spec.fields.iter().find(|f| f.name == "count").unwrap();
        assert!(count.aggregate.is_count());
        let total = spec.fields.iter().find(|f| f.name == "total").unwrap();
        assert_eq!(
            total.aggregate,
            Aggregate::Sum(AggregateSource::Column("price".to_string()))
        );
    }

    #[test]
    fn group_by_column_resolves_storage_names() {
        let spec = parse_group(&schema(), Some(&json!("customer")), &json!({})).unwrap();
        assert_eq!(spec.by, vec![("customer".to_string(), "customer".to_string())]);
    }

    #[test]
    fn unknown_aggregate_key_fails() {
        let err = parse_group(&schema(), None, &json!({"x": {"$median": "$price"}})).unwrap_err();
        assert!(matches!(err, OrmError::UnknownAggregate(k) if k == "$median"));
    }

    #[test]
    fn aggregate_over_unknown_column_fails() {
        let err = parse_group(&schema(), None, &json!({"x": {"$sum": "$weight"}})).unwrap_err();
        assert!(matches!(err, OrmError::UnknownColumn(c) if c == "weight"));
    }
}
