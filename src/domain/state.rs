use crate::domain::types::{
    EntityValue, Message, MessageRole, ToolMemory, UserProfile,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, info};

/// Oldest messages are trimmed once the history exceeds this window.
pub const MESSAGE_WINDOW: usize = 7;

/// The only mutable cross-turn entity. Owned by exactly one session at a
/// time; turn processing is serialized by the session owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub messages: Vec<Message>,

    // Core memory
    #[serde(default)]
    pub user_profile: Option<UserProfile>,
    #[serde(default)]
    pub context_entities: Map<String, Value>,

    // Tool-related memory
    #[serde(default)]
    pub last_tool_used: Option<String>,
    #[serde(default)]
    pub last_intent: Option<String>,
    #[serde(default)]
    pub last_scheme_mentioned: Option<String>,
    #[serde(default)]
    pub tool_memory: HashMap<String, ToolMemory>,

    // Dynamic state: tool name -> required fields still unresolved
    #[serde(default)]
    pub missing_inputs: HashMap<String, Vec<String>>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message and trims the oldest entries beyond the window.
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        if self.messages.len() > MESSAGE_WINDOW {
            let excess = self.messages.len() - MESSAGE_WINDOW;
            self.messages.drain(..excess);
        }
    }

    pub fn add_message(&mut self, role: MessageRole, content: impl Into<String>) {
        self.push_message(Message::new(role, content));
    }

    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant)
    }

    /// Merges new facts into `context_entities`. Existing keys are
    /// overwritten, everything else survives; the map is never replaced
    /// wholesale. Nested location objects are flattened to a display string.
    pub fn merge_context(&mut self, new_entities: Map<String, Value>) {
        for (key, value) in new_entities {
            let value = if key == "location" {
                flatten_location(value)
            } else {
                value
            };
            self.context_entities.insert(key, value);
        }
    }

    /// Convenience for merging extractor output without hand-converting.
    pub fn merge_entities(&mut self, entities: &HashMap<String, EntityValue>) {
        let mut map = Map::new();
        for (key, value) in entities {
            match serde_json::to_value(value) {
                Ok(json) => {
                    map.insert(key.clone(), json);
                }
                Err(error) => {
                    debug!(%key, %error, "Skipping entity that failed to serialize");
                }
            }
        }
        self.merge_context(map);
    }

    pub fn set_last_tool(&mut self, tool_name: impl Into<String>) {
        self.last_tool_used = Some(tool_name.into());
    }

    pub fn update_user_profile(&mut self, profile: UserProfile) {
        debug!(user_type = %profile.user_type, "Updated user profile on state");
        self.user_profile = Some(profile);
    }

    pub fn record_tool_memory(&mut self, tool_name: &str, data: Map<String, Value>) {
        self.tool_memory.insert(
            tool_name.to_string(),
            ToolMemory {
                tool_name: tool_name.to_string(),
                data,
            },
        );
    }

    pub fn tool_memory(&self, tool_name: &str) -> Option<&Map<String, Value>> {
        self.tool_memory.get(tool_name).map(|memory| &memory.data)
    }

    /// Records or clears the unresolved required fields for a tool.
    pub fn set_missing_inputs(&mut self, tool_name: &str, fields: Vec<String>) {
        if fields.is_empty() {
            self.missing_inputs.remove(tool_name);
        } else {
            self.missing_inputs.insert(tool_name.to_string(), fields);
        }
    }

    /// A topic switch is a recorded intent or scheme being contradicted by
    /// the new turn, not merely a first mention.
    pub fn is_topic_switch(&self, intent: Option<&str>, scheme: Option<&str>) -> bool {
        let intent_changed = matches!(
            (self.last_intent.as_deref(), intent),
            (Some(last), Some(new)) if last != new
        );
        let scheme_changed = matches!(
            (self.last_scheme_mentioned.as_deref(), scheme),
            (Some(last), Some(new)) if last != new
        );
        intent_changed || scheme_changed
    }

    /// Partial reset on topic switch: per-topic memory is dropped, messages
    /// and the user profile survive.
    pub fn reset_topic(&mut self) {
        info!("Topic switch detected; clearing per-topic conversation memory");
        self.last_scheme_mentioned = None;
        self.last_intent = None;
        self.last_tool_used = None;
        self.context_entities = Map::new();
        self.missing_inputs.clear();
    }
}

fn flatten_location(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let joined = ["city", "state", "country"]
                .iter()
                .filter_map(|key| map.get(*key).and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(", ");
            if joined.is_empty() {
                map.get("raw")
                    .and_then(Value::as_str)
                    .map(|raw| Value::String(raw.to_string()))
                    .unwrap_or(Value::Object(map))
            } else {
                Value::String(joined)
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filled_state() -> ConversationState {
        let mut state = ConversationState::new();
        state.last_intent = Some("explain".to_string());
        state.last_scheme_mentioned = Some("PMEGP".to_string());
        state.last_tool_used = Some("SchemeExplainer".to_string());
        state
            .context_entities
            .insert("sector".to_string(), json!("manufacturing"));
        state
            .missing_inputs
            .insert("EligibilityChecker".to_string(), vec!["age".to_string()]);
        state.add_message(MessageRole::User, "tell me about PMEGP");
        state.add_message(MessageRole::Assistant, "PMEGP is ...");
        state
    }

    #[test]
    fn messages_are_trimmed_to_window() {
        let mut state = ConversationState::new();
        for index in 0..10 {
            state.add_message(MessageRole::User, format!("message {index}"));
        }
        assert_eq!(state.messages.len(), MESSAGE_WINDOW);
        assert_eq!(state.messages[0].content, "message 3");
        assert_eq!(state.messages.last().map(|m| m.content.as_str()), Some("message 9"));
    }

    #[test]
    fn context_merge_overwrites_but_never_replaces() {
        let mut state = ConversationState::new();
        state.merge_context(
            json!({"sector": "manufacturing", "age": "28"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        state.merge_context(json!({"age": "29"}).as_object().cloned().unwrap());

        assert_eq!(state.context_entities["sector"], json!("manufacturing"));
        assert_eq!(state.context_entities["age"], json!("29"));
    }

    #[test]
    fn nested_location_is_flattened_to_display_string() {
        let mut state = ConversationState::new();
        state.merge_context(
            json!({"location": {"raw": "dharwad", "city": "Dharwad", "state": "Karnataka", "country": "India"}})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(
            state.context_entities["location"],
            json!("Dharwad, Karnataka, India")
        );
    }

    #[test]
    fn topic_switch_requires_a_recorded_previous_topic() {
        let state = ConversationState::new();
        assert!(!state.is_topic_switch(Some("explain"), Some("PMEGP")));

        let state = filled_state();
        assert!(!state.is_topic_switch(Some("explain"), Some("PMEGP")));
        assert!(state.is_topic_switch(Some("check_eligibility"), Some("PMEGP")));
        assert!(state.is_topic_switch(Some("explain"), Some("SPECS")));
        assert!(!state.is_topic_switch(None, None));
    }

    #[test]
    fn topic_reset_preserves_messages_and_profile() {
        let mut state = filled_state();
        let message_count = state.messages.len();
        state.reset_topic();

        assert!(state.context_entities.is_empty());
        assert!(state.missing_inputs.is_empty());
        assert!(state.last_intent.is_none());
        assert!(state.last_scheme_mentioned.is_none());
        assert!(state.last_tool_used.is_none());
        assert_eq!(state.messages.len(), message_count);
    }

    #[test]
    fn state_round_trips_through_serde() {
        let state = filled_state();
        let encoded = serde_json::to_string(&state).expect("encode");
        let decoded: ConversationState = serde_json::from_str(&encoded).expect("decode");

        assert_eq!(decoded.messages, state.messages);
        assert_eq!(decoded.context_entities, state.context_entities);
        assert_eq!(decoded.last_intent, state.last_intent);
        assert_eq!(decoded.last_scheme_mentioned, state.last_scheme_mentioned);
        assert_eq!(decoded.last_tool_used, state.last_tool_used);
    }
}
