pub mod collections;
mod llm;
mod schema;
mod system;

pub use collections::{DataBackend, InMemoryDataBackend};
pub use schema::ArgumentSchema;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::core::agent::ToolSpec;
use crate::core::error::{EngineError, EngineResult, ToolError};
use crate::core::llm::{ChatCompleter, ToolSpecification};

/// Per-invocation context handed to every tool.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub session_id: String,
    /// The running agent's model, for tools that delegate to it.
    pub completer: Arc<dyn ChatCompleter>,
}

/// A host-side operation the model may invoke by name.
///
/// Operational failures are returned as `Ok` with an `{"status":"error"}`
/// payload so the model sees them. `Err` is reserved for failures that must
/// abort the run.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<String, ToolError>;
}

/// Immutable table of implementations keyed by implementation key.
#[derive(Clone, Default)]
pub struct ToolTable {
    impls: Arc<HashMap<String, Arc<dyn Tool>>>,
}

pub struct ToolTableBuilder {
    impls: HashMap<String, Arc<dyn Tool>>,
}

impl ToolTableBuilder {
    pub fn register(mut self, key: &str, tool: Arc<dyn Tool>) -> Self {
        self.impls.insert(key.to_string(), tool);
        self
    }

    pub fn build(self) -> ToolTable {
        info!("Tool table ready with {} implementations", self.impls.len());
        ToolTable {
            impls: Arc::new(self.impls),
        }
    }
}

impl ToolTable {
    pub fn builder() -> ToolTableBuilder {
        ToolTableBuilder {
            impls: HashMap::new(),
        }
    }

    /// The built-in `system.*`, `collections.*` and `llm.*` implementations.
    pub fn builtins(data: Arc<dyn DataBackend>) -> ToolTableBuilder {
        let builder = Self::builder().register("system.log", Arc::new(system::SystemLog));
        let builder = collections::register(builder, data);
        llm::register(builder)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Tool>> {
        self.impls.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.impls.keys().cloned().collect();
        keys.sort();
        keys
    }
}

pub struct RegisteredTool {
    pub implementation_key: String,
    schema: ArgumentSchema,
    implementation: Arc<dyn Tool>,
}

impl RegisteredTool {
    /// Normalizes string-encoded arguments and checks them against the declared
    /// schema before calling the implementation. Shape problems are in-band.
    pub async fn invoke(&self, ctx: &ToolContext, args: Value) -> Result<String, ToolError> {
        let args = match normalize_args(args) {
            Ok(args) => args,
            Err(msg) => return Ok(error_result(msg)),
        };
        if let Err(msg) = self.schema.check(&args) {
            return Ok(error_result(format!("invalid arguments: {}", msg)));
        }
        self.implementation.call(ctx, args).await
    }
}

/// The tools available to one run, resolved from an agent's function list.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    specs: Vec<ToolSpecification>,
}

impl ToolRegistry {
    /// Fails on the first implementation key missing from `table` or the first
    /// parameter schema that does not compile.
    pub fn build(functions: &[ToolSpec], table: &ToolTable) -> EngineResult<Self> {
        let mut tools = HashMap::with_capacity(functions.len());
        let mut specs = Vec::with_capacity(functions.len());

        for func in functions {
            let implementation = table.get(&func.implementation_key).ok_or_else(|| {
                EngineError::Setup(format!(
                    "function '{}' references unknown implementation key '{}'",
                    func.name, func.implementation_key
                ))
            })?;
            let parameters = match &func.parameters {
                Value::String(raw) => serde_json::from_str(raw).map_err(|e| {
                    EngineError::Setup(format!(
                        "function '{}' has invalid parameters: {}",
                        func.name, e
                    ))
                })?,
                other => other.clone(),
            };
            let schema = ArgumentSchema::compile(&parameters).map_err(|e| {
                EngineError::Setup(format!("function '{}' has {}", func.name, e))
            })?;

            specs.push(ToolSpecification {
                name: func.name.clone(),
                description: func.description.clone(),
                parameters: parameters.clone(),
            });
            tools.insert(
                func.name.clone(),
                RegisteredTool {
                    implementation_key: func.implementation_key.clone(),
                    schema,
                    implementation,
                },
            );
        }

        Ok(Self { tools, specs })
    }

    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
            specs: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// Exactly the registered tools, in declaration order.
    pub fn specs(&self) -> &[ToolSpecification] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Arguments may arrive as an object or as a JSON-encoded object string.
pub fn normalize_args(args: Value) -> Result<Value, String> {
    match args {
        Value::String(raw) if raw.trim().is_empty() => Ok(Value::Object(Map::new())),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(Value::Object(map)),
            Ok(_) => Err("invalid arguments format: expected a JSON object".to_string()),
            Err(e) => Err(format!("invalid JSON format in arguments: {}", e)),
        },
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(map) => Ok(Value::Object(map)),
        _ => Err("invalid arguments format: expected a JSON object".to_string()),
    }
}

pub fn error_result(message: impl Into<String>) -> String {
    serde_json::json!({ "status": "error", "message": message.into() }).to_string()
}

/// Adds `"status": "success"` to an object payload, or wraps anything else.
pub fn success_result(payload: Value) -> String {
    match payload {
        Value::Object(mut map) => {
            map.insert("status".to_string(), Value::String("success".to_string()));
            Value::Object(map).to_string()
        }
        other => serde_json::json!({ "status": "success", "result": other }).to_string(),
    }
}

pub(crate) fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Echoes its arguments back as a success payload.
    pub(crate) struct Echo;

    #[async_trait]
    impl Tool for Echo {
        async fn call(&self, _ctx: &ToolContext, args: Value) -> Result<String, ToolError> {
            Ok(success_result(serde_json::json!({ "echo": args })))
        }
    }

    /// Always reports an in-band failure.
    pub(crate) struct SoftFail;

    #[async_trait]
    impl Tool for SoftFail {
        async fn call(&self, _ctx: &ToolContext, _args: Value) -> Result<String, ToolError> {
            Ok(error_result("item not found"))
        }
    }

    /// Fails at the engine level.
    pub(crate) struct HardFail;

    #[async_trait]
    impl Tool for HardFail {
        async fn call(&self, _ctx: &ToolContext, _args: Value) -> Result<String, ToolError> {
            Err(ToolError::Execution("disk on fire".to_string()))
        }
    }

    /// Never finishes on its own.
    pub(crate) struct Stall;

    #[async_trait]
    impl Tool for Stall {
        async fn call(&self, _ctx: &ToolContext, _args: Value) -> Result<String, ToolError> {
            std::future::pending::<()>().await;
            Ok(String::new())
        }
    }

    pub(crate) fn spec(name: &str, key: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: format!("{} tool", name),
            parameters: serde_json::json!({"type": "object"}),
            implementation_key: key.to_string(),
        }
    }

    pub(crate) fn test_table() -> ToolTable {
        ToolTable::builtins(Arc::new(InMemoryDataBackend::new()))
            .register("test.echo", Arc::new(Echo))
            .register("test.soft_fail", Arc::new(SoftFail))
            .register("test.hard_fail", Arc::new(HardFail))
            .register("test.stall", Arc::new(Stall))
            .build()
    }

    pub(crate) fn test_context() -> ToolContext {
        use crate::core::llm::testing::ScriptedCompleter;
        ToolContext {
            agent_id: "agent".to_string(),
            session_id: "agent".to_string(),
            completer: Arc::new(ScriptedCompleter::new(Vec::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn unresolved_key_fails_construction() {
        let table = test_table();
        let err = ToolRegistry::build(&[spec("ghost", "nowhere.ghost")], &table)
            .err()
            .unwrap();
        assert!(err.to_string().contains("nowhere.ghost"));
    }

    #[test]
    fn uncompilable_schema_fails_construction() {
        let table = test_table();
        let mut broken = spec("echo", "test.echo");
        broken.parameters = json!({"type": 12});
        let err = ToolRegistry::build(&[broken], &table).err().unwrap();
        assert!(matches!(err, EngineError::Setup(_)));
        assert!(err.to_string().contains("invalid JSON schema"));
    }

    #[test]
    fn specs_mirror_registered_functions() {
        let table = test_table();
        let registry = ToolRegistry::build(
            &[spec("echo", "test.echo"), spec("log", "system.log")],
            &table,
        )
        .unwrap();
        let names: Vec<&str> = registry.specs().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "log"]);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("collections.list").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn string_arguments_are_decoded() {
        let table = test_table();
        let registry = ToolRegistry::build(&[spec("echo", "test.echo")], &table).unwrap();
        let out = registry
            .get("echo")
            .unwrap()
            .invoke(&test_context(), json!("{\"msg\":\"hi\"}"))
            .await
            .unwrap();
        let out: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(out["status"], "success");
        assert_eq!(out["echo"]["msg"], "hi");
    }

    #[tokio::test]
    async fn malformed_arguments_are_in_band_errors() {
        let table = test_table();
        let mut strict = spec("echo", "test.echo");
        strict.parameters = json!({
            "type": "object",
            "properties": {"msg": {"type": "string"}},
            "required": ["msg"]
        });
        let registry = ToolRegistry::build(&[strict], &table).unwrap();
        let tool = registry.get("echo").unwrap();

        let out = tool.invoke(&test_context(), json!("not json")).await.unwrap();
        assert!(out.contains("\"status\":\"error\""));

        let out = tool.invoke(&test_context(), json!({})).await.unwrap();
        let out: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(out["status"], "error");
        assert!(out["message"].as_str().unwrap().contains("msg"));
    }

    #[tokio::test]
    async fn nested_violations_never_reach_the_tool() {
        let table = test_table();
        let mut strict = spec("echo", "test.echo");
        strict.parameters = json!({
            "type": "object",
            "properties": {
                "level": {"type": "string", "enum": ["info", "warn"]},
                "data": {
                    "type": "object",
                    "properties": {"n": {"type": "integer"}},
                    "required": ["n"]
                }
            }
        });
        let registry = ToolRegistry::build(&[strict], &table).unwrap();
        let tool = registry.get("echo").unwrap();

        for args in [json!({"level": "bogus"}), json!({"data": {"n": "nope"}})] {
            let out: Value =
                serde_json::from_str(&tool.invoke(&test_context(), args).await.unwrap()).unwrap();
            assert_eq!(out["status"], "error");
            assert!(out["message"].as_str().unwrap().starts_with("invalid arguments"));
            assert!(out.get("echo").is_none());
        }

        let out: Value = serde_json::from_str(
            &tool
                .invoke(&test_context(), json!({"level": "info", "data": {"n": 1}}))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(out["status"], "success");
    }

    #[test]
    fn result_helpers() {
        let ok: Value = serde_json::from_str(&success_result(json!({"n": 1}))).unwrap();
        assert_eq!(ok, json!({"n": 1, "status": "success"}));
        let wrapped: Value = serde_json::from_str(&success_result(json!([1, 2]))).unwrap();
        assert_eq!(wrapped["result"], json!([1, 2]));
        let err: Value = serde_json::from_str(&error_result("nope")).unwrap();
        assert_eq!(err, json!({"status": "error", "message": "nope"}));
    }
}
