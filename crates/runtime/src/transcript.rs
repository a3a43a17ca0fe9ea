//! Conversation transcript.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use storage::Role;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Correlates the request with the tool turn that answers it.
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// One entry in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Present only on assistant turns that request tools.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Present only on tool turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Turn {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// An assistant turn that asks for tools, with optional accompanying text.
    pub fn tool_request(content: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    /// The answer to the tool call with id `call_id`.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    pub fn requests_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Ordered, append-only sequence of turns. The first turn is always the
/// system prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::system(system_prompt)],
        }
    }

    pub(crate) fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Whether every tool turn answers an outstanding request from an
    /// earlier assistant turn, exactly once, and no request is left open.
    pub fn is_balanced(&self) -> bool {
        let mut pending: HashSet<&str> = HashSet::new();
        for turn in &self.turns {
            match turn.role {
                Role::Assistant => {
                    for call in &turn.tool_calls {
                        if !pending.insert(call.id.as_str()) {
                            return false;
                        }
                    }
                }
                Role::Tool => {
                    let Some(id) = turn.tool_call_id.as_deref() else {
                        return false;
                    };
                    if !pending.remove(id) {
                        return false;
                    }
                }
                Role::System | Role::User => {
                    if !pending.is_empty() {
                        return false;
                    }
                }
            }
        }
        pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn starts_with_system_prompt() {
        let transcript = Transcript::new("be brief");
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.turns()[0], Turn::system("be brief"));
    }

    #[test]
    fn balanced_requires_every_call_answered_once() {
        let mut transcript = Transcript::new("sys");
        transcript.push(Turn::user("hi"));
        transcript.push(Turn::tool_request(
            None,
            vec![
                ToolCallRequest::new("c1", "a", json!({})),
                ToolCallRequest::new("c2", "b", json!({})),
            ],
        ));
        transcript.push(Turn::tool("c1", "one"));
        assert!(!transcript.is_balanced());

        transcript.push(Turn::tool("c2", "two"));
        transcript.push(Turn::assistant("done"));
        assert!(transcript.is_balanced());

        transcript.push(Turn::tool("c2", "again"));
        assert!(!transcript.is_balanced());
    }

    #[test]
    fn serializes_without_empty_fields() {
        let value = serde_json::to_value(Turn::user("hello")).unwrap();
        assert_eq!(value, json!({ "role": "user", "content": "hello" }));

        let value = serde_json::to_value(Turn::tool("c1", "ok")).unwrap();
        assert_eq!(
            value,
            json!({ "role": "tool", "content": "ok", "tool_call_id": "c1" })
        );
    }
}
