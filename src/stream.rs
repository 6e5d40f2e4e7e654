//! Parsing of the headless agent's stream-json stdout.
//!
//! The agent emits one JSON object per line. Each line is rendered into a
//! short human-readable summary for the run log; lines that are not valid
//! JSON are passed through verbatim, so a misconfigured agent still produces
//! a readable log.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AgentMessage },

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System { subtype: String },

    #[serde(rename = "user")]
    User {},
}

#[derive(Debug, Deserialize)]
pub struct AgentMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },
}

/// Render one stdout line into log messages. A single assistant event can
/// carry several content blocks, hence the Vec.
pub fn render_line(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(event) = serde_json::from_str::<AgentEvent>(trimmed) else {
        return vec![trimmed.to_string()];
    };
    match event {
        AgentEvent::Assistant { message } => message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { name, input } => Some(summarize_tool(name, input)),
                ContentBlock::Text { text } => {
                    let text = text.trim();
                    if text.is_empty() {
                        None
                    } else {
                        Some(truncate(text, 200))
                    }
                }
            })
            .collect(),
        AgentEvent::Result {
            subtype,
            result,
            is_error,
        } => {
            let summary = result
                .as_deref()
                .map(|r| truncate(r, 200))
                .unwrap_or_else(|| subtype.clone());
            if is_error {
                vec![format!("agent finished with error: {}", summary)]
            } else {
                vec![format!("agent finished: {}", summary)]
            }
        }
        // Init/compaction chatter and tool results; nothing worth logging.
        AgentEvent::System { .. } | AgentEvent::User {} => Vec::new(),
    }
}

/// One-line description of a tool invocation.
fn summarize_tool(name: &str, input: &Value) -> String {
    let path = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("reading {}", path("file_path")),
        "Write" => format!("writing {}", path("file_path")),
        "Edit" => format!("editing {}", path("file_path")),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate(s, 60))
                .unwrap_or_else(|| "command".to_string());
            format!("running {}", cmd)
        }
        "Glob" | "Grep" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("*");
            format!("searching {}", truncate(pattern, 40))
        }
        other => format!("tool {}", other),
    }
}

/// Last two path components, enough to identify a file in a log line.
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i <= max_len.saturating_sub(3))
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        format!("{}...", &s[..cut])
    }
}
