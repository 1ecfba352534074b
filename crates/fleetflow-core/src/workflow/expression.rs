//! JEXL evaluation for `If` and `WhileLoopStart` conditions.
//!
//! Expressions see run variables as top-level identifiers
//! (`count < 3`, `user.name|lower == 'ada'`). Values are always passed as
//! context, never spliced into the expression text.

use serde_json::{json, Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("empty expression")]
    Empty,
}

/// JEXL evaluator with the standard transforms registered.
///
/// `jexl_eval::Evaluator` holds boxed transforms that are not `Sync`, so build
/// one where it is used rather than sharing it across tasks.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(first_str(args).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(first_str(args).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(first_str(args).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(Value::as_str).unwrap_or(",");
                let parts: Vec<&str> = first_str(args).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
            })
            .with_transform("contains", |args: &[Value]| {
                let needle = args.get(1).cloned().unwrap_or(Value::Null);
                let found = match args.first() {
                    Some(Value::Array(items)) => items.contains(&needle),
                    Some(Value::Object(map)) => needle.as_str().is_some_and(|k| map.contains_key(k)),
                    Some(Value::String(s)) => needle.as_str().is_some_and(|n| s.contains(n)),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let prefix = args.get(1).and_then(Value::as_str).unwrap_or("");
                Ok(json!(first_str(args).starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let suffix = args.get(1).and_then(Value::as_str).unwrap_or("");
                Ok(json!(first_str(args).ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate against `variables`, coercing the result by truthiness.
    pub fn evaluate_bool(
        &self,
        expression: &str,
        variables: &Map<String, Value>,
    ) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, variables).map(|v| truthy(&v))
    }

    pub fn evaluate_value(
        &self,
        expression: &str,
        variables: &Map<String, Value>,
    ) -> Result<Value, ExpressionError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(ExpressionError::Empty);
        }
        let context = Value::Object(variables.clone());
        self.evaluator
            .eval_in_context(expression, &context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn first_str(args: &[Value]) -> &str {
    args.first().and_then(Value::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn comparisons_against_variables() {
        let eval = ConditionEvaluator::new();
        let v = vars(json!({"count": 2, "status": "ok"}));
        assert!(eval.evaluate_bool("count < 3", &v).unwrap());
        assert!(!eval.evaluate_bool("count >= 3", &v).unwrap());
        assert!(eval.evaluate_bool("status == 'ok' && count > 1", &v).unwrap());
    }

    #[test]
    fn transforms() {
        let eval = ConditionEvaluator::new();
        let v = vars(json!({"name": "Ada", "items": [1, 2, 3], "tags": ["x"]}));
        assert!(eval.evaluate_bool("name|lower == 'ada'", &v).unwrap());
        assert!(eval.evaluate_bool("name|upper == 'ADA'", &v).unwrap());
        assert!(eval.evaluate_bool("items|length > 2", &v).unwrap());
        assert!(eval.evaluate_bool("tags|contains('x')", &v).unwrap());
        assert!(eval.evaluate_bool("name|startsWith('A')", &v).unwrap());
    }

    #[test]
    fn truthiness_of_non_boolean_results() {
        let eval = ConditionEvaluator::new();
        let v = vars(json!({"empty": "", "list": [], "zero": 0}));
        assert!(!eval.evaluate_bool("empty", &v).unwrap());
        assert!(eval.evaluate_bool("list", &v).unwrap());
        assert!(!eval.evaluate_bool("zero", &v).unwrap());
    }

    #[test]
    fn empty_expression_is_an_error() {
        let eval = ConditionEvaluator::new();
        assert!(matches!(eval.evaluate_bool("  ", &Map::new()), Err(ExpressionError::Empty)));
    }
}
