//! Claude CLI `stream-json` decoding.
//!
//! Backends configured with `output = "stream_json"` emit one JSON event per
//! line. `StreamAccumulator` folds those lines into the transcript the report
//! parser sees, plus the reported cost.

use serde::Deserialize;
use serde_json::Value;

/// Events from the `--output-format stream-json` protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },

    #[serde(rename = "system")]
    System {},
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
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

    #[serde(other)]
    Other,
}

/// What one line contributed, for progress display.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamActivity {
    Tool(String),
    Text,
    Finished { is_error: bool },
    Ignored,
}

/// Folds stream-json lines into a transcript.
///
/// The final `result` event's text is preferred over accumulated assistant
/// text, matching what the CLI prints in text mode. Lines that are not JSON
/// are kept verbatim.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    result: Option<String>,
    cost_usd: Option<f64>,
    is_error: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) -> StreamActivity {
        if line.trim().is_empty() {
            return StreamActivity::Ignored;
        }
        let event = match serde_json::from_str::<StreamEvent>(line) {
            Ok(event) => event,
            Err(_) if is_typed_event(line) => return StreamActivity::Ignored,
            Err(_) => {
                self.text.push_str(line);
                self.text.push('\n');
                return StreamActivity::Text;
            }
        };
        match event {
            StreamEvent::Assistant { message } => {
                let mut activity = StreamActivity::Ignored;
                for block in message.content {
                    match block {
                        ContentBlock::ToolUse { name, input } => {
                            activity = StreamActivity::Tool(describe_tool_use(&name, &input));
                        }
                        ContentBlock::Text { text } => {
                            self.text.push_str(&text);
                            self.text.push('\n');
                            if activity == StreamActivity::Ignored {
                                activity = StreamActivity::Text;
                            }
                        }
                        ContentBlock::Other => {}
                    }
                }
                activity
            }
            StreamEvent::Result {
                result,
                is_error,
                total_cost_usd,
            } => {
                self.result = result;
                self.is_error = is_error;
                self.cost_usd = total_cost_usd;
                StreamActivity::Finished { is_error }
            }
            StreamEvent::User {} | StreamEvent::System {} => StreamActivity::Ignored,
        }
    }

    pub fn cost_usd(&self) -> Option<f64> {
        self.cost_usd
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    /// The transcript: the final result text when present, otherwise all assistant text.
    pub fn finish(self) -> String {
        match self.result {
            Some(result) if !result.trim().is_empty() => result,
            _ => self.text,
        }
    }
}

/// A JSON object with a `type` tag this decoder does not know.
fn is_typed_event(line: &str) -> bool {
    serde_json::from_str::<Value>(line)
        .map(|v| v.get("type").is_some_and(|t| t.is_string()))
        .unwrap_or(false)
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match name {
        "Read" => format!("Reading: {}", field("file_path").map(shorten_path).unwrap_or_default()),
        "Write" => format!("Creating: {}", field("file_path").map(shorten_path).unwrap_or_default()),
        "Edit" | "MultiEdit" => {
            format!("Editing: {}", field("file_path").map(shorten_path).unwrap_or_default())
        }
        "Bash" => format!(
            "Running: {}",
            field("command")
                .map(|s| crate::util::truncate_chars(s, 40))
                .unwrap_or_default()
        ),
        "Glob" | "Grep" => format!("Searching: {}", field("pattern").unwrap_or("*")),
        "Task" => format!("Agent: {}", field("description").unwrap_or("subagent")),
        _ => name.to_string(),
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}
