//! Clock tool.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;

use crate::{Tool, ToolOutput};

pub struct ClockTool;

#[derive(Deserialize)]
struct ClockParams {
    /// strftime format; RFC 3339 when absent.
    #[serde(default)]
    format: Option<String>,
}

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Return the current UTC time."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "description": "strftime format string (default: RFC 3339)"
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value) -> anyhow::Result<ToolOutput> {
        let p: ClockParams = serde_json::from_value(params)?;
        let now = Utc::now();

        let content = match p.format {
            Some(format) => {
                let items: Vec<_> = chrono::format::StrftimeItems::new(&format).collect();
                if items.contains(&chrono::format::Item::Error) {
                    return Ok(ToolOutput::error(format!("Invalid format: {format}")));
                }
                now.format_with_items(items.into_iter()).to_string()
            }
            None => now.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        Ok(ToolOutput::ok(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_default_is_rfc3339() {
        let output = ClockTool.execute(json!({})).await.unwrap();
        assert!(!output.is_error);
        assert!(chrono::DateTime::parse_from_rfc3339(&output.content).is_ok());
    }

    #[tokio::test]
    async fn test_custom_format() {
        let output = ClockTool.execute(json!({"format": "%Y"})).await.unwrap();
        assert_eq!(output.content.len(), 4);
    }

    #[tokio::test]
    async fn test_invalid_format_is_error_output() {
        let output = ClockTool.execute(json!({"format": "%Q%"})).await.unwrap();
        assert!(output.is_error);
    }
}
