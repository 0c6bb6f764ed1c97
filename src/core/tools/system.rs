use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::{Tool, ToolContext, error_result, str_arg, success_result};
use crate::core::error::ToolError;

/// `system.log`: writes the model's message into the engine log.
pub struct SystemLog;

#[async_trait]
impl Tool for SystemLog {
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<String, ToolError> {
        let Some(message) = str_arg(&args, "message") else {
            return Ok(error_result("missing required parameter: message"));
        };
        let data = args.get("data").cloned().unwrap_or(Value::Null);
        let agent = ctx.agent_id.as_str();

        match str_arg(&args, "level").unwrap_or("info") {
            "debug" => debug!(agent_id = %agent, data = %data, "[system.log] {}", message),
            "warn" | "warning" => warn!(agent_id = %agent, data = %data, "[system.log] {}", message),
            "error" => error!(agent_id = %agent, data = %data, "[system.log] {}", message),
            _ => info!(agent_id = %agent, data = %data, "[system.log] {}", message),
        }

        Ok(success_result(json!({
            "message": "Message was logged successfully."
        })))
    }
}
