//! Built-in actions available in every registry.
//!
//! These cover variable manipulation and a few utility steps. Domain actions
//! (browser, desktop, HTTP...) live outside the engine and are registered by
//! the embedding process.

use std::time::Duration;

use fleetflow_types::workflow::DataType;
use serde_json::{json, Value};

use super::{ActionError, ActionHandler, ActionInput, ActionOutput, ActionPorts, ActionRegistry};

pub fn register_all(registry: &mut ActionRegistry) {
    registry
        .register("SetVariable", SetVariable)
        .register("GetVariable", GetVariable)
        .register("Log", Log)
        .register("Wait", Wait)
        .register("Fail", Fail)
        .register("Increment", Increment)
        .register("Append", Append);
}

/// `{name, value}` -> binds `value` (or the `value` data input) to `name`.
pub struct SetVariable;

impl ActionHandler for SetVariable {
    fn ports(&self) -> ActionPorts {
        ActionPorts::flow()
            .with_input("value", DataType::Any)
            .with_output("value", DataType::Any)
    }

    async fn execute(&self, input: ActionInput) -> Result<ActionOutput, ActionError> {
        let name = input.require_str("name")?;
        let value = input.param("value").cloned().unwrap_or(Value::Null);
        Ok(ActionOutput::empty()
            .with_variable(name, value.clone())
            .with_output("value", value))
    }
}

/// Pure data node exposing a variable (or `default`) on its `value` output.
pub struct GetVariable;

impl ActionHandler for GetVariable {
    fn ports(&self) -> ActionPorts {
        ActionPorts::pure().with_output("value", DataType::Any)
    }

    async fn execute(&self, input: ActionInput) -> Result<ActionOutput, ActionError> {
        let name = input.require_str("name")?;
        let value = input
            .variables
            .get(name)
            .or_else(|| input.config.get("default"))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(ActionOutput::empty().with_output("value", value))
    }
}

/// Emits `message` through tracing at `level` (debug/info/warn/error).
pub struct Log;

impl ActionHandler for Log {
    fn ports(&self) -> ActionPorts {
        ActionPorts::flow().with_input("message", DataType::Any)
    }

    async fn execute(&self, input: ActionInput) -> Result<ActionOutput, ActionError> {
        let message = match input.param("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let level = input.param_str("level").unwrap_or("info");
        match level {
            "debug" => tracing::debug!(run_id = %input.run_id, node_id = %input.node_id, "{message}"),
            "warn" | "warning" => {
                tracing::warn!(run_id = %input.run_id, node_id = %input.node_id, "{message}")
            }
            "error" => tracing::error!(run_id = %input.run_id, node_id = %input.node_id, "{message}"),
            _ => tracing::info!(run_id = %input.run_id, node_id = %input.node_id, "{message}"),
        }
        Ok(ActionOutput::empty())
    }
}

/// Sleeps `duration_ms`, returning early (as an error) on cancellation.
pub struct Wait;

impl ActionHandler for Wait {
    fn ports(&self) -> ActionPorts {
        ActionPorts::flow()
    }

    async fn execute(&self, input: ActionInput) -> Result<ActionOutput, ActionError> {
        let ms = input
            .param("duration_ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| ActionError::invalid_config("missing integer 'duration_ms'"))?;
        tokio::select! {
            _ = input.cancel.cancelled() => Err(ActionError::cancelled()),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(ActionOutput::empty()),
        }
    }
}

/// Always fails with `message` / `error_type`; `retryable` defaults to false.
pub struct Fail;

impl ActionHandler for Fail {
    fn ports(&self) -> ActionPorts {
        ActionPorts::flow()
    }

    async fn execute(&self, input: ActionInput) -> Result<ActionOutput, ActionError> {
        let message = input.param_str("message").unwrap_or("failed on purpose");
        let error_type = input
            .param_str("error_type")
            .unwrap_or(super::NODE_EXECUTION_ERROR);
        let retryable = input
            .param("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let err = ActionError::typed(error_type, message);
        Err(if retryable { err } else { err.permanent() })
    }
}

/// `{name, by}` -> `name += by` (numbers; missing variable counts as 0).
pub struct Increment;

impl ActionHandler for Increment {
    fn ports(&self) -> ActionPorts {
        ActionPorts::flow().with_output("value", DataType::Any)
    }

    async fn execute(&self, input: ActionInput) -> Result<ActionOutput, ActionError> {
        let name = input.require_str("name")?;
        let by = input.param("by").cloned().unwrap_or(json!(1));
        let current = input.variables.get(name).cloned().unwrap_or(json!(0));
        let next = match (current.as_i64(), by.as_i64()) {
            (Some(a), Some(b)) => json!(a + b),
            _ => match (current.as_f64(), by.as_f64()) {
                (Some(a), Some(b)) => json!(a + b),
                _ => {
                    return Err(ActionError::invalid_config(format!(
                        "cannot increment '{name}' ({current}) by {by}"
                    )));
                }
            },
        };
        Ok(ActionOutput::empty()
            .with_variable(name, next.clone())
            .with_output("value", next))
    }
}

/// `{name, value}` -> pushes `value` onto the list variable `name`.
pub struct Append;

impl ActionHandler for Append {
    fn ports(&self) -> ActionPorts {
        ActionPorts::flow()
            .with_input("value", DataType::Any)
            .with_output("value", DataType::List)
    }

    async fn execute(&self, input: ActionInput) -> Result<ActionOutput, ActionError> {
        let name = input.require_str("name")?;
        let item = input.param("value").cloned().unwrap_or(Value::Null);
        let mut list = match input.variables.get(name) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(ActionError::invalid_config(format!(
                    "variable '{name}' is not a list: {other}"
                )));
            }
        };
        list.push(item);
        let value = Value::Array(list);
        Ok(ActionOutput::empty()
            .with_variable(name, value.clone())
            .with_output("value", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn input(config: Value, variables: Value) -> ActionInput {
        ActionInput {
            run_id: Uuid::now_v7(),
            node_id: "n".into(),
            node_type: "T".into(),
            config: config.as_object().cloned().unwrap_or_default(),
            inputs: Map::new(),
            variables: variables.as_object().cloned().unwrap_or_default(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn set_variable_binds_value() {
        let out = SetVariable
            .execute(input(json!({"name": "x", "value": 42}), json!({})))
            .await
            .unwrap();
        assert_eq!(out.variables["x"], json!(42));
        assert_eq!(out.outputs["value"], json!(42));
    }

    #[tokio::test]
    async fn get_variable_falls_back_to_default() {
        let out = GetVariable
            .execute(input(json!({"name": "x", "default": "d"}), json!({})))
            .await
            .unwrap();
        assert_eq!(out.outputs["value"], json!("d"));
        assert!(GetVariable.execute(input(json!({}), json!({}))).await.is_err());
    }

    #[tokio::test]
    async fn increment_handles_ints_and_floats() {
        let out = Increment
            .execute(input(json!({"name": "n", "by": 2}), json!({"n": 3})))
            .await
            .unwrap();
        assert_eq!(out.variables["n"], json!(5));

        let out = Increment
            .execute(input(json!({"name": "n", "by": 0.5}), json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(out.variables["n"], json!(1.5));

        let out = Increment.execute(input(json!({"name": "fresh"}), json!({}))).await.unwrap();
        assert_eq!(out.variables["fresh"], json!(1));
    }

    #[tokio::test]
    async fn append_builds_list() {
        let out = Append
            .execute(input(json!({"name": "seen", "value": "b"}), json!({"seen": ["a"]})))
            .await
            .unwrap();
        assert_eq!(out.variables["seen"], json!(["a", "b"]));
        assert!(
            Append
                .execute(input(json!({"name": "s", "value": 1}), json!({"s": 3})))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn fail_is_permanent_by_default() {
        let err = Fail
            .execute(input(json!({"message": "bad", "error_type": "ValueError"}), json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.error_type, "ValueError");
        assert!(!err.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps() {
        let started = tokio::time::Instant::now();
        Wait.execute(input(json!({"duration_ms": 250}), json!({}))).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
