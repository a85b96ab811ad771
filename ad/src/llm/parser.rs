//! LLM output parsing
//!
//! The model returns free-form text that must contain, somewhere, a JSON
//! object with any of `actions[]`, `messages[]`, `stateUpdates{}`, `summary`.
//! The parser pulls the first balanced JSON object out of the text (fenced
//! code blocks are just text to the scanner) and treats missing fields as
//! empty. State-machine tasks additionally require a `STATE_OUTPUT` block.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::domain::{Action, MessageType, Priority};

/// Parse failures the loop branches on
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("No JSON object found in LLM output")]
    NoJson,

    #[error("No STATE_OUTPUT block found in LLM output")]
    MissingStateOutput,

    #[error("STATE_OUTPUT missing required field '{0}'")]
    MissingField(String),

    #[error("STATE_OUTPUT reported an error: {0}")]
    StateMachineError(String),
}

/// An outbound message the LLM declared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
}

fn default_kind() -> MessageType {
    MessageType::Broadcast
}

/// Everything a loop applies after a successful LLM call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopOutput {
    pub actions: Vec<Action>,
    pub messages: Vec<OutboundMessage>,
    pub state_updates: Map<String, Value>,
    pub summary: Option<String>,
}

impl LoopOutput {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
            && self.messages.is_empty()
            && self.state_updates.is_empty()
            && self.summary.is_none()
    }
}

/// Scan for the first balanced JSON object in `text` and parse it.
/// String literals and escapes are honoured; candidates that do not parse
/// are skipped and the scan continues at the next brace.
pub fn extract_json(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(open) = text[start..].find('{').map(|i| i + start) {
        if let Some(end) = balanced_end(bytes, open) {
            if let Ok(value) = serde_json::from_str::<Value>(&text[open..=end]) {
                if value.is_object() {
                    return Some(value);
                }
            }
        }
        start = open + 1;
    }
    None
}

/// Find the index of the brace closing the object opened at `open`
fn balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the structured loop output out of free-form text
pub fn parse_loop_output(text: &str) -> Result<LoopOutput, ParseError> {
    let value = extract_json(text).ok_or(ParseError::NoJson)?;

    let actions = value
        .get("actions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<Action>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let messages = value
        .get("messages")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<OutboundMessage>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let state_updates = value
        .get("stateUpdates")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let summary = value
        .get("summary")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(LoopOutput {
        actions,
        messages,
        state_updates,
        summary,
    })
}

/// Canonical text rendition of a parsed output; `parse_loop_output` of this
/// string returns an equal [`LoopOutput`]
pub fn canonical_text(output: &LoopOutput) -> String {
    let value = json!({
        "actions": output.actions,
        "messages": output.messages,
        "stateUpdates": Value::Object(output.state_updates.clone()),
        "summary": output.summary,
    });
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
}

/// Extract and validate the `STATE_OUTPUT` block a state-machine task
/// requires. The block is the first balanced JSON object after the marker.
pub fn parse_state_output(text: &str, required_fields: &[String]) -> Result<Value, ParseError> {
    let marker = text.find("STATE_OUTPUT").ok_or(ParseError::MissingStateOutput)?;
    let value = extract_json(&text[marker..]).ok_or(ParseError::MissingStateOutput)?;

    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(ParseError::StateMachineError(error.to_string()));
    }
    for field in required_fields {
        if value.get(field).is_none() {
            return Err(ParseError::MissingField(field.clone()));
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_skips_prose_braces() {
        let text = "thinking {not json} ok here: {\"summary\": \"done\"} trailing";
        let value = extract_json(text).unwrap();
        assert_eq!(value["summary"], "done");
    }

    #[test]
    fn test_extract_json_inside_fenced_block() {
        let text = "Result:\n```json\n{\"summary\": \"fenced\"}\n```\n";
        let value = extract_json(text).unwrap();
        assert_eq!(value["summary"], "fenced");
    }

    #[test]
    fn test_extract_json_handles_nested_and_strings() {
        let text = r#"{"a": {"b": "brace } in string"}, "c": 1}"#;
        let value = extract_json(text).unwrap();
        assert_eq!(value["c"], 1);
        assert_eq!(value["a"]["b"], "brace } in string");
    }

    #[test]
    fn test_parse_missing_fields_are_empty() {
        let output = parse_loop_output(r#"{"summary": "just a summary"}"#).unwrap();
        assert!(output.actions.is_empty());
        assert!(output.messages.is_empty());
        assert!(output.state_updates.is_empty());
        assert_eq!(output.summary.as_deref(), Some("just a summary"));
    }

    #[test]
    fn test_parse_full_output() {
        let text = r#"
I'll create a task and update my focus.

```json
{
  "actions": [{"type": "create_task", "data": {"to": "cto", "title": "Fix", "description": "d", "priority": "high"}}],
  "messages": [{"to": "broadcast", "type": "broadcast", "payload": {"note": "hi"}}],
  "stateUpdates": {"current_focus": "infra"},
  "summary": "queued a fix"
}
```
"#;
        let output = parse_loop_output(text).unwrap();
        assert_eq!(output.actions.len(), 1);
        assert_eq!(output.messages.len(), 1);
        assert_eq!(output.state_updates["current_focus"], "infra");
        assert_eq!(output.summary.as_deref(), Some("queued a fix"));
    }

    #[test]
    fn test_parse_no_json_is_an_error() {
        assert!(matches!(parse_loop_output("I could not decide."), Err(ParseError::NoJson)));
    }

    #[test]
    fn test_parser_idempotent_on_canonical_text() {
        let text = r#"{"actions": [{"type": "claim_issue", "data": {"number": 4}}], "summary": "s"}"#;
        let first = parse_loop_output(text).unwrap();
        let second = parse_loop_output(&canonical_text(&first)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_state_output_happy_path() {
        let text = "work done\nSTATE_OUTPUT\n{\"verdict\": \"pass\", \"confidence\": 0.9}";
        let value = parse_state_output(text, &["verdict".into(), "confidence".into()]).unwrap();
        assert_eq!(value["verdict"], "pass");
    }

    #[test]
    fn test_state_output_missing_marker() {
        let text = "{\"verdict\": \"pass\"}";
        assert!(matches!(
            parse_state_output(text, &[]),
            Err(ParseError::MissingStateOutput)
        ));
    }

    #[test]
    fn test_state_output_missing_field() {
        let text = "STATE_OUTPUT {\"verdict\": \"pass\"}";
        assert!(matches!(
            parse_state_output(text, &["confidence".to_string()]),
            Err(ParseError::MissingField(f)) if f == "confidence"
        ));
    }

    #[test]
    fn test_state_output_error_field_fails() {
        let text = "STATE_OUTPUT {\"error\": \"tool unavailable\"}";
        assert!(matches!(
            parse_state_output(text, &[]),
            Err(ParseError::StateMachineError(e)) if e == "tool unavailable"
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// parse . canonical . parse == parse, for outputs built from
            /// arbitrary summaries and state keys
            #[test]
            fn parse_is_idempotent(summary in "[a-zA-Z0-9 .,!]{0,40}", key in "[a-z_]{1,12}", value in "[a-zA-Z0-9]{0,20}") {
                let text = format!(
                    r#"prefix {{"summary": {}, "stateUpdates": {{{}: {}}}}} suffix"#,
                    serde_json::to_string(&summary).unwrap(),
                    serde_json::to_string(&key).unwrap(),
                    serde_json::to_string(&value).unwrap(),
                );
                let first = parse_loop_output(&text).unwrap();
                let second = parse_loop_output(&canonical_text(&first)).unwrap();
                prop_assert_eq!(first, second);
            }
        }
    }
}
