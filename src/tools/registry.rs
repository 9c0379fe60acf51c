//! Allowlisted tool registry with schema enforcement.
//!
//! The registry is the single dispatch point for evidence tools: unknown
//! names are rejected, params are validated before execution, execution is
//! bounded by a timeout, and results are validated before they reach a
//! caller. A non-conforming result is a registry-level fault, never silently
//! accepted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jsonschema::JSONSchema;
use serde_json::Value;
use tracing::debug;

use crate::error::ToolError;
use crate::tools::tool::{EVIDENCE_BUNDLE_SCHEMA, EvidenceTool};

struct RegisteredTool {
    tool: Arc<dyn EvidenceTool>,
    params_schema: JSONSchema,
}

pub struct ToolRegistry {
    tools: HashMap<&'static str, RegisteredTool>,
    result_schema: JSONSchema,
}

impl ToolRegistry {
    pub fn new() -> Result<Self, ToolError> {
        let result_schema = JSONSchema::compile(&EVIDENCE_BUNDLE_SCHEMA).map_err(|e| {
            ToolError::SchemaViolation {
                name: "evidence_bundle".to_string(),
                stage: "result",
                detail: e.to_string(),
            }
        })?;
        Ok(Self {
            tools: HashMap::new(),
            result_schema,
        })
    }

    /// Add a tool to the allowlist. Fails if its params schema does not
    /// compile; registration happens once at startup so this surfaces
    /// immediately.
    pub fn register(&mut self, tool: Arc<dyn EvidenceTool>) -> Result<(), ToolError> {
        let name = tool.name();
        let schema_value = tool.params_schema();
        let params_schema =
            JSONSchema::compile(&schema_value).map_err(|e| ToolError::SchemaViolation {
                name: name.to_string(),
                stage: "params",
                detail: e.to_string(),
            })?;
        self.tools.insert(
            name,
            RegisteredTool {
                tool,
                params_schema,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.tools.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Dispatch one tool invocation: allowlist check, params validation,
    /// bounded execution, result validation.
    pub async fn run_tool(
        &self,
        name: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        let entry = self.tools.get(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_string(),
        })?;

        if let Some(detail) = validation_detail(&entry.params_schema, params) {
            return Err(ToolError::SchemaViolation {
                name: name.to_string(),
                stage: "params",
                detail,
            });
        }

        debug!(tool = %name, "running tool");
        let result = tokio::time::timeout(timeout, entry.tool.run(params))
            .await
            .map_err(|_| ToolError::Timeout {
                name: name.to_string(),
                timeout,
            })??;

        if let Some(detail) = validation_detail(&self.result_schema, &result) {
            return Err(ToolError::SchemaViolation {
                name: name.to_string(),
                stage: "result",
                detail,
            });
        }
        Ok(result)
    }
}

fn validation_detail(schema: &JSONSchema, instance: &Value) -> Option<String> {
    match schema.validate(instance) {
        Ok(()) => None,
        Err(errors) => Some(
            errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct WellBehavedTool;

    #[async_trait]
    impl EvidenceTool for WellBehavedTool {
        fn name(&self) -> &'static str {
            "well_behaved"
        }

        fn params_schema(&self) -> Value {
            json!({
                "type": "object",
                "required": ["tenant"],
                "properties": {"tenant": {"type": "string"}},
                "additionalProperties": false
            })
        }

        async fn run(&self, params: &Value) -> Result<Value, ToolError> {
            Ok(json!({
                "source": "app_events",
                "time_window": {"start": "2025-05-01T00:00:00Z", "end": "2025-05-01T01:00:00Z"},
                "tenant": params["tenant"],
                "summary_counts": {"sent": 0, "bounced": 0, "deferred": 0, "delivered": 0},
                "events": []
            }))
        }
    }

    struct MalformedResultTool;

    #[async_trait]
    impl EvidenceTool for MalformedResultTool {
        fn name(&self) -> &'static str {
            "malformed"
        }

        fn params_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn run(&self, _params: &Value) -> Result<Value, ToolError> {
            Ok(json!({"source": "app_events"}))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new().unwrap();
        registry.register(Arc::new(WellBehavedTool)).unwrap();
        registry.register(Arc::new(MalformedResultTool)).unwrap();
        registry
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let registry = registry();
        let err = registry
            .run_tool("nope", &json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool { .. }));
    }

    #[tokio::test]
    async fn invalid_params_fail_before_execution() {
        let registry = registry();
        let err = registry
            .run_tool("well_behaved", &json!({"tenant": 42}), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ToolError::SchemaViolation { stage, .. } => assert_eq!(stage, "params"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn valid_invocation_round_trips() {
        let registry = registry();
        let result = registry
            .run_tool(
                "well_behaved",
                &json!({"tenant": "acme"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(result["tenant"], "acme");
    }

    #[tokio::test]
    async fn nonconforming_result_is_a_registry_fault() {
        let registry = registry();
        let err = registry
            .run_tool("malformed", &json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ToolError::SchemaViolation { stage, .. } => assert_eq!(stage, "result"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
