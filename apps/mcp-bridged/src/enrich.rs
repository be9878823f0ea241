//! Synthetic usage-guide tool injected into `tools/list` responses.
//!
//! The guide is surfaced to the LLM as a tool whose description carries the
//! configured text; invoking it is short-circuited in the dispatcher and
//! never reaches the subprocess.

use bridge_mcp::{CallToolResult, ContentBlock, Tool};
use serde_json::Value;

pub const USAGE_TOOL_NAME: &str = "📖_usage_instructions";

fn usage_tool(guide: &str) -> Tool {
    Tool {
        name: USAGE_TOOL_NAME.to_string(),
        title: None,
        description: Some(guide.to_string()),
        input_schema: serde_json::json!({"type": "object", "properties": {}}),
    }
}

/// Append the synthetic tool to a `tools/list` result. Responses without a
/// `tools` array pass through untouched.
pub fn append_usage_tool(result: &mut Value, guide: &str) {
    let Some(tools) = result.get_mut("tools").and_then(Value::as_array_mut) else {
        return;
    };
    if let Ok(tool) = serde_json::to_value(usage_tool(guide)) {
        tools.push(tool);
    }
}

/// The local response for an invocation of the synthetic tool.
pub fn usage_tool_result(guide: &str) -> Value {
    let result = CallToolResult {
        content: vec![ContentBlock::Text {
            text: guide.to_string(),
        }],
        structured_content: None,
        is_error: Some(false),
    };
    serde_json::to_value(result).unwrap_or(Value::Null)
}
