//! Echo tool: returns its input, optionally after a delay.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::{Tool, ToolOutput};

pub struct EchoTool;

#[derive(Deserialize)]
struct EchoParams {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    delay_ms: u64,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the given text. Without text, returns the arguments as JSON."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "Text to echo back"
                },
                "delay_ms": {
                    "type": "integer",
                    "description": "Wait this long before answering"
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value) -> anyhow::Result<ToolOutput> {
        let p: EchoParams = serde_json::from_value(params.clone())?;
        debug!(delay_ms = p.delay_ms, "echo");

        if p.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(p.delay_ms)).await;
        }

        Ok(ToolOutput::ok(match p.text {
            Some(text) => text,
            None => params.to_string(),
        }))
    }
}
