//! Condition compiler for the SQL dialects
//!
//! Produces parameter-bound predicate fragments plus a positional parameter
//! list. Placeholder style and pattern-match casing are dialect decisions;
//! everything else is shared across PostgreSQL, MySQL and SQLite.

use serde_json::Value as JsonValue;

use crate::backends::SqlDialect;
use crate::conditions::{escape_like, is_operator_key, parse_orders, resolve_select};
use crate::error::{OrmError, OrmResult};
use crate::schema::{coerce_array, coerce_value, ColumnSchema, ModelSchema};

use super::group::{Aggregate, AggregateSource, GroupSpec};

/// A compiled predicate: SQL text plus its positional parameters
#[derive(Debug, Clone, Default)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<JsonValue>,
}

/// Compiles condition trees, order/select/group specs into dialect SQL
#[derive(Debug, Clone)]
pub struct SqlCompiler {
    pub dialect: SqlDialect,
}

impl SqlCompiler {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    /// Compile a condition tree into a WHERE-clause body
    pub fn compile(&self, schema: &ModelSchema, tree: &JsonValue) -> OrmResult<SqlFragment> {
        let mut params = Vec::new();
        let sql = self.compile_node(schema, tree, &mut params)?;
        Ok(SqlFragment { sql, params })
    }

    /// Compile an order list into an ORDER BY body
    pub fn compile_order(&self, schema: &ModelSchema, specs: &[String]) -> OrmResult<String> {
        let orders = parse_orders(schema, specs)?;
        Ok(orders
            .iter()
            .map(|o| {
                format!(
                    "{} {}",
                    self.quote(&o.column),
                    if o.descending { "DESC" } else { "ASC" }
                )
            })
            .collect::<Vec<_>>()
            .join(", "))
    }

    /// Compile a select projection into a column list
    pub fn compile_select(&self, schema: &ModelSchema, columns: &[String]) -> OrmResult<String> {
        let resolved = resolve_select(schema, columns)?;
        Ok(resolved
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", "))
    }

    /// Compile a group spec into (select list, GROUP BY body). The GROUP BY
    /// body is empty for the single implicit group.
    pub fn compile_group(
        &self,
        _schema: &ModelSchema,
        spec: &GroupSpec,
    ) -> OrmResult<(String, String)> {
        let mut select = Vec::new();
        for (logical, storage) in &spec.by {
            if logical == storage {
                select.push(self.quote(storage));
            } else {
                select.push(format!("{} AS {}", self.quote(storage), self.quote(logical)));
            }
        }
        for field in &spec.fields {
            let expr = self.aggregate_sql(&field.aggregate);
            select.push(format!("{} AS {}", expr, self.quote(&field.name)));
        }
        let group_by = spec
            .by
            .iter()
            .map(|(_, storage)| self.quote(storage))
            .collect::<Vec<_>>()
            .join(", ");
        Ok((select.join(", "), group_by))
    }

    fn aggregate_sql(&self, aggregate: &Aggregate) -> String {
        if aggregate.is_count() {
            return "COUNT(*)".to_string();
        }
        let operand = match aggregate.source() {
            AggregateSource::Column(storage) => self.quote(storage),
            AggregateSource::Literal(n) => n.to_string(),
        };
        match aggregate {
            Aggregate::Sum(_) => format!("SUM({})", operand),
            Aggregate::Min(_) => format!("MIN({})", operand),
            Aggregate::Max(_) => format!("MAX({})", operand),
            Aggregate::Avg(_) => format!("AVG({})", operand),
            // No SQL spelling for "any value of the group"; MIN is a
            // deterministic stand-in
            Aggregate::Any(_) => format!("MIN({})", operand),
        }
    }

    fn quote(&self, identifier: &str) -> String {
        let q = self.dialect.identifier_quote();
        format!("{q}{identifier}{q}")
    }

    fn placeholder(&self, params: &[JsonValue]) -> String {
        self.dialect.parameter_placeholder(params.len())
    }

    fn compile_node(
        &self,
        schema: &ModelSchema,
        node: &JsonValue,
        params: &mut Vec<JsonValue>,
    ) -> OrmResult<String> {
        let map = match node {
            JsonValue::Object(map) => map,
            other => return Err(OrmError::UnknownOperator(other.to_string())),
        };
        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            match key.as_str() {
                "$and" => clauses.push(self.compile_combinator(schema, value, " AND ", params)?),
                "$or" => clauses.push(self.compile_combinator(schema, value, " OR ", params)?),
                key if is_operator_key(key) => {
                    return Err(OrmError::UnknownOperator(key.to_string()))
                }
                column => clauses.push(self.compile_leaf(schema, column, value, params)?),
            }
        }
        if clauses.is_empty() {
            return Ok("1 = 1".to_string());
        }
        if clauses.len() == 1 {
            return Ok(clauses.remove(0));
        }
        Ok(format!("({})", clauses.join(" AND ")))
    }

    fn compile_combinator(
        &self,
        schema: &ModelSchema,
        children: &JsonValue,
        joiner: &str,
        params: &mut Vec<JsonValue>,
    ) -> OrmResult<String> {
        let children = match children {
            JsonValue::Array(children) => children,
            other => return Err(OrmError::UnknownOperator(other.to_string())),
        };
        if children.is_empty() {
            // AND of nothing is vacuously true, OR of nothing matches nothing
            return Ok(if joiner.contains("AND") { "1 = 1" } else { "1 = 0" }.to_string());
        }
        let compiled: OrmResult<Vec<String>> = children
            .iter()
            .map(|c| self.compile_node(schema, c, params))
            .collect();
        Ok(format!("({})", compiled?.join(joiner)))
    }

    fn compile_leaf(
        &self,
        schema: &ModelSchema,
        column_name: &str,
        value: &JsonValue,
        params: &mut Vec<JsonValue>,
    ) -> OrmResult<String> {
        let column = schema.require_column(column_name)?;
        let quoted = self.quote(&column.storage_name);

        if let JsonValue::Object(ops) = value {
            if !ops.is_empty() && ops.keys().all(|k| is_operator_key(k)) {
                let mut clauses = Vec::with_capacity(ops.len());
                for (op, operand) in ops {
                    clauses.push(self.compile_operator(
                        schema, column, &quoted, op, operand, params,
                    )?);
                }
                if clauses.len() == 1 {
                    return Ok(clauses.remove(0));
                }
                return Ok(format!("({})", clauses.join(" AND ")));
            }
        }
        self.compile_equality(column, &quoted, value, params)
    }

    fn compile_equality(
        &self,
        column: &ColumnSchema,
        quoted: &str,
        value: &JsonValue,
        params: &mut Vec<JsonValue>,
    ) -> OrmResult<String> {
        match value {
            JsonValue::Null => Ok(format!("{quoted} IS NULL")),
            JsonValue::Array(values) => self.compile_in(column, quoted, values, params),
            other => {
                let placeholder = self.placeholder(params);
                params.push(coerce_value(column, other)?);
                Ok(format!("{quoted} = {placeholder}"))
            }
        }
    }

    fn compile_in(
        &self,
        column: &ColumnSchema,
        quoted: &str,
        values: &[JsonValue],
        params: &mut Vec<JsonValue>,
    ) -> OrmResult<String> {
        // Empty IN list is an unconditionally false predicate, not an error
        if values.is_empty() {
            return Ok("1 = 0".to_string());
        }
        let mut placeholders = Vec::with_capacity(values.len());
        for value in coerce_array(column, values)? {
            placeholders.push(self.placeholder(params));
            params.push(value);
        }
        Ok(format!("{quoted} IN ({})", placeholders.join(", ")))
    }

    fn compile_operator(
        &self,
        schema: &ModelSchema,
        column: &ColumnSchema,
        quoted: &str,
        op: &str,
        operand: &JsonValue,
        params: &mut Vec<JsonValue>,
    ) -> OrmResult<String> {
        match op {
            "$gt" | "$gte" | "$lt" | "$lte" => {
                let sql_op = match op {
                    "$gt" => ">",
                    "$gte" => ">=",
                    "$lt" => "<",
                    _ => "<=",
                };
                let placeholder = self.placeholder(params);
                params.push(coerce_value(column, operand)?);
                Ok(format!("{quoted} {sql_op} {placeholder}"))
            }
            "$in" => {
                let values = match operand {
                    JsonValue::Array(values) => values.clone(),
                    other => vec![other.clone()],
                };
                self.compile_in(column, quoted, &values, params)
            }
            "$not" => self.compile_not(column, quoted, operand, params),
            "$contains" => self.compile_pattern(quoted, operand, params, "%", "%"),
            "$startswith" => self.compile_pattern(quoted, operand, params, "", "%"),
            "$endswith" => self.compile_pattern(quoted, operand, params, "%", ""),
            "$ceq" | "$cne" | "$cgt" | "$cgte" | "$clt" | "$clte" => {
                let other_name = operand
                    .as_str()
                    .ok_or_else(|| OrmError::UnknownColumn(operand.to_string()))?;
                let other = self.quote(schema.storage_name(other_name)?);
                let sql_op = match op {
                    "$ceq" => "=",
                    "$cne" => "<>",
                    "$cgt" => ">",
                    "$cgte" => ">=",
                    "$clt" => "<",
                    _ => "<=",
                };
                Ok(format!("{quoted} {sql_op} {other}"))
            }
            // No native proximity operator in these dialects; the document
            // backend owns $near
            other => Err(OrmError::UnknownOperator(other.to_string())),
        }
    }

    fn compile_not(
        &self,
        column: &ColumnSchema,
        quoted: &str,
        operand: &JsonValue,
        params: &mut Vec<JsonValue>,
    ) -> OrmResult<String> {
        match operand {
            JsonValue::Null => Ok(format!("{quoted} IS NOT NULL")),
            JsonValue::Array(values) => {
                if values.is_empty() {
                    return Ok("1 = 1".to_string());
                }
                let mut placeholders = Vec::with_capacity(values.len());
                for value in coerce_array(column, values)? {
                    placeholders.push(self.placeholder(params));
                    params.push(value);
                }
                Ok(format!(
                    "({quoted} NOT IN ({}) OR {quoted} IS NULL)",
                    placeholders.join(", ")
                ))
            }
            other => {
                let placeholder = self.placeholder(params);
                params.push(coerce_value(column, other)?);
                Ok(format!("({quoted} <> {placeholder} OR {quoted} IS NULL)"))
            }
        }
    }

    fn compile_pattern(
        &self,
        quoted: &str,
        operand: &JsonValue,
        params: &mut Vec<JsonValue>,
        prefix: &str,
        suffix: &str,
    ) -> OrmResult<String> {
        let like = self.dialect.pattern_operator();
        // SQLite's LIKE has no default escape character; PostgreSQL and
        // MySQL already treat backslash as the escape
        let escape = match self.dialect {
            SqlDialect::Sqlite => " ESCAPE '\\'",
            _ => "",
        };
        let one = |literal: &JsonValue, params: &mut Vec<JsonValue>| -> OrmResult<String> {
            let text = match literal {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            let placeholder = self.placeholder(params);
            params.push(JsonValue::String(format!(
                "{prefix}{}{suffix}",
                escape_like(&text)
            )));
            Ok(format!("{quoted} {like} {placeholder}{escape}"))
        };
        match operand {
            JsonValue::Array(values) => {
                if values.is_empty() {
                    return Ok("1 = 0".to_string());
                }
                let clauses: OrmResult<Vec<String>> =
                    values.iter().map(|v| one(v, params)).collect();
                Ok(format!("({})", clauses?.join(" OR ")))
            }
            other => one(other, params),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::schema::{ColumnType, SchemaBuilder};

    fn schema() -> ModelSchema {
        let mut builder = SchemaBuilder::new("User", "users");
        builder.column("age", ColumnType::Integer);
        builder.column("score", ColumnType::Number);
        builder.column("name", ColumnType::String(None));
        builder.freeze(Vec::new())
    }

    fn postgres() -> SqlCompiler {
        SqlCompiler::new(SqlDialect::PostgreSql)
    }

    #[test]
    fn simple_comparison_binds_placeholder() {
        let frag = postgres().compile(&schema(), &json!({"age": {"$gt": 10}})).unwrap();
        assert_eq!(frag.sql, "\"age\" > $1");
        assert_eq!(frag.params, vec![json!(10)]);
    }

    #[test]
    fn multi_key_map_is_implicit_and() {
        let frag = postgres()
            .compile(&schema(), &json!({"age": {"$gte": 18}, "name": "ada"}))
            .unwrap();
        assert_eq!(frag.sql, "(\"age\" >= $1 AND \"name\" = $2)");
        assert_eq!(frag.params, vec![json!(18), json!("ada")]);
    }

    #[test]
    fn empty_in_is_constant_false_not_error() {
        let frag = postgres().compile(&schema(), &json!({"age": {"$in": []}})).unwrap();
        assert_eq!(frag.sql, "1 = 0");
        assert!(frag.params.is_empty());
        let eq = postgres().compile(&schema(), &json!({"age": []})).unwrap();
        assert_eq!(eq.sql, "1 = 0");
    }

    #[test]
    fn or_combinator_recurses() {
        let frag = postgres()
            .compile(
                &schema(),
                &json!({"$or": [{"age": {"$lt": 5}}, {"age": {"$gt": 90}}]}),
            )
            .unwrap();
        assert_eq!(frag.sql, "(\"age\" < $1 OR \"age\" > $2)");
    }

    #[test]
    fn contains_escapes_like_metacharacters() {
        let frag = postgres()
            .compile(&schema(), &json!({"name": {"$contains": "50%_off"}}))
            .unwrap();
        assert_eq!(frag.sql, "\"name\" ILIKE $1");
        assert_eq!(frag.params, vec![json!("%50\\%\\_off%")]);
    }

    #[test]
    fn sqlite_patterns_carry_an_escape_clause() {
        let frag = SqlCompiler::new(SqlDialect::Sqlite)
            .compile(&schema(), &json!({"name": {"$contains": "50%_off"}}))
            .unwrap();
        assert_eq!(frag.sql, "\"name\" LIKE ? ESCAPE '\\'");
        assert_eq!(frag.params, vec![json!("%50\\%\\_off%")]);
    }

    #[test]
    fn mysql_uses_question_placeholders_and_like() {
        let frag = SqlCompiler::new(SqlDialect::MySql)
            .compile(&schema(), &json!({"name": {"$startswith": "ad"}}))
            .unwrap();
        assert_eq!(frag.sql, "`name` LIKE ?");
        assert_eq!(frag.params, vec![json!("ad%")]);
    }

    #[test]
    fn column_compare_resolves_both_sides() {
        let frag = postgres()
            .compile(&schema(), &json!({"age": {"$cgt": "score"}}))
            .unwrap();
        assert_eq!(frag.sql, "\"age\" > \"score\"");
        assert!(frag.params.is_empty());
    }

    #[test]
    fn unknown_column_and_operator_fail() {
        let err = postgres().compile(&schema(), &json!({"height": 1})).unwrap_err();
        assert!(matches!(err, OrmError::UnknownColumn(c) if c == "height"));
        let err = postgres()
            .compile(&schema(), &json!({"age": {"$within": 2}}))
            .unwrap_err();
        assert!(matches!(err, OrmError::UnknownOperator(o) if o == "$within"));
        let err = postgres().compile(&schema(), &json!({"$nor": []})).unwrap_err();
        assert!(matches!(err, OrmError::UnknownOperator(o) if o == "$nor"));
    }

    #[test]
    fn near_is_unknown_to_sql_dialects() {
        let err = postgres()
            .compile(&schema(), &json!({"name": {"$near": [0.0, 0.0]}}))
            .unwrap_err();
        assert!(matches!(err, OrmError::UnknownOperator(o) if o == "$near"));
    }

    #[test]
    fn out_of_range_integer_clamps_in_params() {
        let frag = postgres()
            .compile(&schema(), &json!({"age": {"$gt": 9_999_999_999i64}}))
            .unwrap();
        assert_eq!(frag.params, vec![json!(i32::MAX as i64)]);
    }

    #[test]
    fn order_and_select_compile() {
        let compiler = postgres();
        let order = compiler
            .compile_order(&schema(), &["-age".to_string(), "name".to_string()])
            .unwrap();
        assert_eq!(order, "\"age\" DESC, \"name\" ASC");
        let select = compiler
            .compile_select(&schema(), &["name".to_string(), "age".to_string()])
            .unwrap();
        assert_eq!(select, "\"name\", \"age\"");
    }

    #[test]
    fn group_select_renders_count_and_sum() {
        let spec = super::super::group::parse_group(
            &schema(),
            Some(&json!("name")),
            &json!({"count": {"$sum": 1}, "total": {"$sum": "$score"}}),
        )
        .unwrap();
        let (select, group_by) = postgres().compile_group(&schema(), &spec).unwrap();
        assert!(select.contains("\"name\""));
        assert!(select.contains("COUNT(*) AS \"count\""));
        assert!(select.contains("SUM(\"score\") AS \"total\""));
        assert_eq!(group_by, "\"name\"");
    }
}
