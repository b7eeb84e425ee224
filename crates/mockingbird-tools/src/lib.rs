//! Tool execution for streamed tool calls.
//!
//! The agent hands each completed tool call to a [`ToolExecutor`]. The
//! default executor is a [`ToolRegistry`] of [`Tool`] implementations.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mockingbird_core::error::{MockingbirdError, Result};
use mockingbird_core::types::ToolCallResult;

pub mod clock;
pub mod echo;

/// Default per-call execution timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    /// Attach the output to the call that produced it.
    pub fn into_result(self, tool_call_id: impl Into<String>) -> ToolCallResult {
        ToolCallResult {
            tool_call_id: tool_call_id.into(),
            result: self.content,
            is_error: self.is_error,
        }
    }
}

/// The core tool trait. Every built-in tool implements this.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as used in instruction markup (e.g., "echo", "clock").
    fn name(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Execute the tool with the given parameters.
    async fn execute(&self, params: serde_json::Value) -> anyhow::Result<ToolOutput>;
}

/// Executes tool calls by name.
///
/// Failures are reported in-band as error-flagged output, never as `Err`, so
/// every call produces exactly one result.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, args_json: &str) -> ToolOutput;
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtin_tools(&mut registry);
        registry
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a tool. Names are unique; a second tool with a taken name is refused.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<()> {
        if self.get(tool.name()).is_some() {
            return Err(MockingbirdError::Tool(format!(
                "tool '{}' is already registered",
                tool.name()
            )));
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tool definitions, e.g. for `status` output.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.parameters_schema(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, args_json: &str) -> ToolOutput {
        let Some(tool) = self.get(name) else {
            warn!(tool = name, "Unknown tool");
            return ToolOutput::error(format!("Unknown tool: {name}"));
        };

        let params: serde_json::Value = if args_json.trim().is_empty() {
            serde_json::json!({})
        } else {
            match serde_json::from_str(args_json) {
                Ok(v) => v,
                Err(e) => return ToolOutput::error(format!("Invalid arguments for {name}: {e}")),
            }
        };

        debug!(tool = name, "Executing tool");
        match tokio::time::timeout(self.timeout, tool.execute(params)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => ToolOutput::error(format!("Tool error: {e}")),
            Err(_) => {
                warn!(tool = name, timeout_ms = self.timeout.as_millis() as u64, "Tool timed out");
                ToolOutput::error(format!(
                    "Tool {name} timed out after {}ms",
                    self.timeout.as_millis()
                ))
            }
        }
    }
}

/// Register all built-in tools. Tools already registered under a built-in's
/// name are kept.
pub fn register_builtin_tools(registry: &mut ToolRegistry) {
    let builtins: [Box<dyn Tool>; 2] = [Box::new(echo::EchoTool), Box::new(clock::ClockTool)];
    for tool in builtins {
        if let Err(e) = registry.register(tool) {
            debug!(%e, "Keeping existing tool");
        }
    }
}
