//! Condition compiler for the document backend
//!
//! Produces a native filter document: leaves become `{field: value}` or
//! `{field: {$op: operand}}`, combinators become `$and`/`$or` arrays and
//! column-to-column comparisons become `$expr` nodes. String operators
//! compile to explicitly case-insensitive anchored regexes.
//!
//! `$near` cannot legally appear inside an `$and` conjunction, so a
//! single-condition tree is emitted without the wrapper and mixed trees
//! hoist the proximity clause to the top level next to the `$and`.

use regex::escape as escape_regex;
use serde_json::{json, Map, Value as JsonValue};

use crate::conditions::is_operator_key;
use crate::error::{OrmError, OrmResult};
use crate::schema::{coerce_array, coerce_value, ColumnSchema, ModelSchema};

/// Compiles condition trees into filter documents
#[derive(Debug, Clone, Default)]
pub struct DocumentCompiler;

impl DocumentCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Compile a condition tree into a filter document
    pub fn compile(&self, schema: &ModelSchema, tree: &JsonValue) -> OrmResult<JsonValue> {
        let compiled = self.compile_node(schema, tree)?;
        Ok(hoist_near(compiled))
    }

    fn compile_node(&self, schema: &ModelSchema, node: &JsonValue) -> OrmResult<JsonValue> {
        let map = match node {
            JsonValue::Object(map) => map,
            other => return Err(OrmError::UnknownOperator(other.to_string())),
        };
        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            match key.as_str() {
                "$and" | "$or" => {
                    let children = value
                        .as_array()
                        .ok_or_else(|| OrmError::UnknownOperator(value.to_string()))?;
                    let compiled: OrmResult<Vec<JsonValue>> = children
                        .iter()
                        .map(|c| self.compile_node(schema, c))
                        .collect();
                    clauses.push(json!({ key.as_str(): compiled? }));
                }
                key if is_operator_key(key) => {
                    return Err(OrmError::UnknownOperator(key.to_string()))
                }
                column => clauses.push(self.compile_leaf(schema, column, value)?),
            }
        }
        Ok(match clauses.len() {
            0 => json!({}),
            1 => clauses.remove(0),
            _ => json!({ "$and": clauses }),
        })
    }

    fn compile_leaf(
        &self,
        schema: &ModelSchema,
        column_name: &str,
        value: &JsonValue,
    ) -> OrmResult<JsonValue> {
        let column = schema.require_column(column_name)?;
        let field = column.storage_name.clone();

        if let JsonValue::Object(ops) = value {
            if !ops.is_empty() && ops.keys().all(|k| is_operator_key(k)) {
                let mut field_ops = Map::new();
                let mut exprs = Vec::new();
                for (op, operand) in ops {
                    match self.compile_operator(schema, column, op, operand)? {
                        CompiledOp::Field(key, value) => {
                            field_ops.insert(key, value);
                        }
                        // $expr lives at the document level, not under the field
                        CompiledOp::Expr(expr) => exprs.push(expr),
                    }
                }
                let mut clauses = exprs;
                if !field_ops.is_empty() {
                    clauses.insert(
                        0,
                        JsonValue::Object(
                            [(field, JsonValue::Object(field_ops))].into_iter().collect(),
                        ),
                    );
                }
                if clauses.len() == 1 {
                    return Ok(clauses.remove(0));
                }
                return Ok(json!({ "$and": clauses }));
            }
        }

        // Plain equality; array literals behave as $in
        let compiled = match value {
            JsonValue::Array(values) => json!({ "$in": coerce_array(column, values)? }),
            other => coerce_value(column, other)?,
        };
        Ok(JsonValue::Object(
            [(field, compiled)].into_iter().collect(),
        ))
    }

    fn compile_operator(
        &self,
        schema: &ModelSchema,
        column: &ColumnSchema,
        op: &str,
        operand: &JsonValue,
    ) -> OrmResult<CompiledOp> {
        match op {
            "$gt" | "$gte" | "$lt" | "$lte" => Ok(CompiledOp::Field(
                op.to_string(),
                coerce_value(column, operand)?,
            )),
            "$in" => {
                let values = match operand {
                    JsonValue::Array(values) => coerce_array(column, values)?,
                    other => vec![coerce_value(column, other)?],
                };
                Ok(CompiledOp::Field("$in".to_string(), json!(values)))
            }
            "$not" => match operand {
                JsonValue::Array(values) => Ok(CompiledOp::Field(
                    "$nin".to_string(),
                    json!(coerce_array(column, values)?),
                )),
                other => Ok(CompiledOp::Field(
                    "$ne".to_string(),
                    coerce_value(column, other)?,
                )),
            },
            "$contains" => Ok(pattern_op(operand, "", "")),
            "$startswith" => Ok(pattern_op(operand, "^", "")),
            "$endswith" => Ok(pattern_op(operand, "", "$")),
            "$near" => Ok(CompiledOp::Field("$near".to_string(), operand.clone())),
            "$ceq" | "$cne" | "$cgt" | "$cgte" | "$clt" | "$clte" => {
                let other_name = operand
                    .as_str()
                    .ok_or_else(|| OrmError::UnknownColumn(operand.to_string()))?;
                let other = schema.storage_name(other_name)?;
                let expr_op = match op {
                    "$ceq" => "$eq",
                    "$cne" => "$ne",
                    "$cgt" => "$gt",
                    "$cgte" => "$gte",
                    "$clt" => "$lt",
                    _ => "$lte",
                };
                Ok(CompiledOp::Expr(json!({
                    "$expr": { expr_op: [format!("${}", column.storage_name), format!("${other}")] }
                })))
            }
            other => Err(OrmError::UnknownOperator(other.to_string())),
        }
    }
}

enum CompiledOp {
    /// Operator nested under the field document
    Field(String, JsonValue),
    /// Document-level expression node
    Expr(JsonValue),
}

fn pattern_op(operand: &JsonValue, prefix: &str, suffix: &str) -> CompiledOp {
    let text = match operand {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    // Case-insensitive on this backend regardless of collation
    CompiledOp::Field(
        "$regex".to_string(),
        json!({ "pattern": format!("{prefix}{}{suffix}", escape_regex(&text)), "options": "i" }),
    )
}

/// Move `$near` clauses out of an `$and` wrapper: the proximity operator is
/// only legal at the top level of a filter document.
fn hoist_near(filter: JsonValue) -> JsonValue {
    let JsonValue::Object(map) = filter else {
        return filter;
    };
    let Some(JsonValue::Array(children)) = map.get("$and").cloned() else {
        return JsonValue::Object(map);
    };
    if map.len() != 1 {
        return JsonValue::Object(map);
    }
    let (near, mut rest): (Vec<JsonValue>, Vec<JsonValue>) =
        children.into_iter().partition(contains_near);
    if near.is_empty() {
        let mut out = Map::new();
        out.insert("$and".to_string(), json!(rest));
        return JsonValue::Object(out);
    }
    let mut out = Map::new();
    for clause in near {
        if let JsonValue::Object(fields) = clause {
            for (k, v) in fields {
                out.insert(k, v);
            }
        }
    }
    match rest.len() {
        0 => {}
        1 => {
            if let JsonValue::Object(fields) = rest.remove(0) {
                for (k, v) in fields {
                    out.entry(k).or_insert(v);
                }
            }
        }
        _ => {
            out.insert("$and".to_string(), json!(rest));
        }
    }
    JsonValue::Object(out)
}

fn contains_near(clause: &JsonValue) -> bool {
    match clause {
        JsonValue::Object(map) => map.values().any(|v| {
            matches!(v, JsonValue::Object(ops) if ops.contains_key("$near"))
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, SchemaBuilder};

    fn schema() -> ModelSchema {
        let mut builder = SchemaBuilder::new("Place", "places");
        builder.column("name", ColumnType::String(None));
        builder.column("age", ColumnType::Integer);
        builder.column("score", ColumnType::Number);
        builder.column("location", ColumnType::GeoPoint);
        builder.freeze(Vec::new())
    }

    #[test]
    fn equality_compiles_to_field_document() {
        let filter = DocumentCompiler::new()
            .compile(&schema(), &json!({"name": "ada"}))
            .unwrap();
        assert_eq!(filter, json!({"name": "ada"}));
    }

    #[test]
    fn comparison_nests_under_field() {
        let filter = DocumentCompiler::new()
            .compile(&schema(), &json!({"age": {"$gt": 10}}))
            .unwrap();
        assert_eq!(filter, json!({"age": {"$gt": 10}}));
    }

    #[test]
    fn contains_forces_case_insensitive_regex() {
        let filter = DocumentCompiler::new()
            .compile(&schema(), &json!({"name": {"$contains": "a.d"}}))
            .unwrap();
        assert_eq!(
            filter,
            json!({"name": {"$regex": {"pattern": "a\\.d", "options": "i"}}})
        );
    }

    #[test]
    fn column_compare_becomes_expr() {
        let filter = DocumentCompiler::new()
            .compile(&schema(), &json!({"age": {"$clt": "score"}}))
            .unwrap();
        assert_eq!(filter, json!({"$expr": {"$lt": ["$age", "$score"]}}));
    }

    #[test]
    fn single_near_condition_has_no_and_wrapper() {
        let filter = DocumentCompiler::new()
            .compile(&schema(), &json!({"location": {"$near": [10.0, 20.0]}}))
            .unwrap();
        assert_eq!(filter, json!({"location": {"$near": [10.0, 20.0]}}));
    }

    #[test]
    fn near_mixed_with_other_conditions_is_hoisted() {
        let filter = DocumentCompiler::new()
            .compile(
                &schema(),
                &json!({"location": {"$near": [10.0, 20.0]}, "age": {"$gt": 10}}),
            )
            .unwrap();
        let map = filter.as_object().unwrap();
        assert!(map.contains_key("location"), "near stays top-level: {filter}");
        assert!(map.contains_key("age"));
        assert!(!map.contains_key("$and"));
    }

    #[test]
    fn unknown_keys_fail() {
        let err = DocumentCompiler::new()
            .compile(&schema(), &json!({"height": 2}))
            .unwrap_err();
        assert!(matches!(err, OrmError::UnknownColumn(_)));
        let err = DocumentCompiler::new()
            .compile(&schema(), &json!({"age": {"$almost": 2}}))
            .unwrap_err();
        assert!(matches!(err, OrmError::UnknownOperator(_)));
    }
}
