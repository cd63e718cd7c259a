use crate::domain::state::ConversationState;
use crate::domain::types::{
    AnalysisGeneratorOutput, EligibilityCheckRequest, EligibilityCheckResponse,
    InsightGeneratorInput, InsightGeneratorOutput, Metadata, SchemeExplanationResponse,
    SchemeMetadata, ToolRegistryEntry,
};
use crate::infrastructure::llm::LlmClient;
use crate::infrastructure::tools::DiscoveredInputs;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const SCHEMA_SYSTEM_PROMPT: &str = r#"
You fill tool input payloads for a government scheme assistant. You are given
the name of the input schema a tool expects, the fields it requires, and
everything known about the conversation. Produce a JSON object containing as
many of the required fields as the known facts justify. Never invent values:
omit a field entirely rather than guessing it. Respond ONLY with the JSON
object, no commentary.
"#;

/// Static catalogue of the input schemas the registry may name. Resolves a
/// schema name to its required fields at startup, no runtime reflection;
/// consulted when a tool server publishes no declaration of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    SchemeMetadata,
    EligibilityCheckRequest,
    InsightGeneratorInput,
}

impl SchemaKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SchemeMetadata" => Some(SchemaKind::SchemeMetadata),
            "EligibilityCheckRequest" => Some(SchemaKind::EligibilityCheckRequest),
            "InsightGeneratorInput" => Some(SchemaKind::InsightGeneratorInput),
            _ => None,
        }
    }

    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            SchemaKind::SchemeMetadata => &["scheme_name", "user_profile"],
            SchemaKind::EligibilityCheckRequest => &["scheme_name", "user_profile"],
            SchemaKind::InsightGeneratorInput => &["user_query", "user_profile"],
        }
    }

    /// Checks that a payload actually deserializes as an instance of this
    /// schema, so a model fill that put a string where the tool expects an
    /// object is caught before the wire call.
    pub fn validate(self, payload: &Value) -> Result<(), serde_json::Error> {
        match self {
            SchemaKind::SchemeMetadata => deserializes_as::<SchemeMetadata>(payload),
            SchemaKind::EligibilityCheckRequest => deserializes_as::<EligibilityCheckRequest>(payload),
            SchemaKind::InsightGeneratorInput => deserializes_as::<InsightGeneratorInput>(payload),
        }
    }
}

/// Output-side counterpart of [`SchemaKind`]: names the response shapes the
/// registry may declare. Responses are parsed defensively regardless, so a
/// mismatch here is reported, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    SchemeExplanation,
    EligibilityCheck,
    InsightGenerator,
    AnalysisGenerator,
}

impl ResponseKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SchemeExplanationResponse" => Some(ResponseKind::SchemeExplanation),
            "EligibilityCheckResponse" => Some(ResponseKind::EligibilityCheck),
            "InsightGeneratorOutput" => Some(ResponseKind::InsightGenerator),
            "AnalysisGeneratorOutput" => Some(ResponseKind::AnalysisGenerator),
            _ => None,
        }
    }

    pub fn check(self, response: &Value) -> Result<(), serde_json::Error> {
        match self {
            ResponseKind::SchemeExplanation => deserializes_as::<SchemeExplanationResponse>(response),
            ResponseKind::EligibilityCheck => deserializes_as::<EligibilityCheckResponse>(response),
            ResponseKind::InsightGenerator => deserializes_as::<InsightGeneratorOutput>(response),
            ResponseKind::AnalysisGenerator => deserializes_as::<AnalysisGeneratorOutput>(response),
        }
    }
}

fn deserializes_as<T: DeserializeOwned>(value: &Value) -> Result<(), serde_json::Error> {
    serde_json::from_value::<T>(value.clone()).map(|_| ())
}

/// A payload that reached the required-field count but does not deserialize
/// as the declared input schema. Task-local: the one task fails, the plan
/// keeps going.
#[derive(Debug, Error)]
#[error("payload for schema '{schema}' failed validation: {message}")]
pub struct SchemaError {
    pub schema: String,
    pub message: String,
}

impl SchemaError {
    pub fn user_message(&self) -> String {
        "The input assembled for this tool did not match what the tool expects, so it was skipped."
            .to_string()
    }
}

/// The assembled payload for one tool call, plus the required fields that
/// could not be filled from any source.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaOutcome {
    pub payload: Map<String, Value>,
    pub missing: Vec<String>,
}

/// Builds a tool's input payload in layers: deterministic facts from the
/// current turn, then a model pass for whatever is still open, then the
/// planner's explicit per-task input, which always wins.
pub struct SchemaGenerator {
    llm: Arc<dyn LlmClient>,
}

impl SchemaGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn generate(
        &self,
        entry: &ToolRegistryEntry,
        metadata: &Metadata,
        state: &ConversationState,
        discovered: &DiscoveredInputs,
        task_input: &Map<String, Value>,
    ) -> Result<SchemaOutcome, SchemaError> {
        let mut payload = deterministic_fill(metadata, state);

        // The server's own declaration wins; the static catalogue stands in
        // when the server publishes none.
        let required: Vec<String> = if discovered.required.is_empty() {
            SchemaKind::from_name(&entry.input_schema)
                .map(|kind| {
                    kind.required_fields()
                        .iter()
                        .map(|field| field.to_string())
                        .collect()
                })
                .unwrap_or_default()
        } else {
            discovered.required.clone()
        };

        let open_fields: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|field| !has_value(&payload, field))
            .collect();

        if !open_fields.is_empty() {
            match self
                .llm
                .chat_json(
                    SCHEMA_SYSTEM_PROMPT,
                    &compose_fill_message(entry, metadata, state, &open_fields),
                )
                .await
            {
                Ok(Value::Object(filled)) => {
                    for (key, value) in filled {
                        if !value.is_null() && !has_value(&payload, &key) {
                            payload.insert(key, value);
                        }
                    }
                }
                Ok(other) => {
                    warn!(tool = %entry.tool_name, got = ?other, "Schema fill returned a non-object, ignoring")
                }
                Err(err) => {
                    warn!(tool = %entry.tool_name, error = %err, "Schema fill model call failed, continuing without it")
                }
            }
        }

        // Planner-supplied input overrides everything else.
        for (key, value) in task_input {
            payload.insert(key.clone(), value.clone());
        }

        let missing: Vec<String> = required
            .iter()
            .filter(|field| !has_value(&payload, field))
            .cloned()
            .collect();

        // A complete payload must also be a well-typed instance of the
        // declared schema. An incomplete one is sent as-is so the tool can
        // name its missing fields.
        if missing.is_empty() {
            if let Some(kind) = SchemaKind::from_name(&entry.input_schema) {
                if let Err(err) = kind.validate(&Value::Object(payload.clone())) {
                    return Err(SchemaError {
                        schema: entry.input_schema.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        debug!(
            tool = %entry.tool_name,
            fields = payload.len(),
            missing = missing.len(),
            "Input payload assembled"
        );
        Ok(SchemaOutcome { payload, missing })
    }
}

/// Facts the extractor already established; no model needed for these.
fn deterministic_fill(metadata: &Metadata, state: &ConversationState) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("query".to_string(), Value::String(metadata.query.clone()));
    payload.insert("user_query".to_string(), Value::String(metadata.query.clone()));

    if let Some(scheme) = metadata.scheme().or(state.last_scheme_mentioned.as_deref()) {
        payload.insert("scheme_name".to_string(), Value::String(scheme.to_string()));
    }

    let profile = metadata.user_profile.as_ref().or(state.user_profile.as_ref());
    if let Some(profile) = profile {
        match serde_json::to_value(profile) {
            Ok(value) => {
                payload.insert("user_profile".to_string(), value);
            }
            Err(err) => warn!(error = %err, "User profile failed to serialize"),
        }
    }

    if !state.context_entities.is_empty() {
        payload.insert(
            "context_entities".to_string(),
            Value::Object(state.context_entities.clone()),
        );
    }
    if !metadata.intents.is_empty() {
        payload.insert("detected_intents".to_string(), json!(metadata.intents));
    }
    payload
}

fn has_value(payload: &Map<String, Value>, field: &str) -> bool {
    match payload.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(text)) => !text.trim().is_empty(),
        Some(_) => true,
    }
}

fn compose_fill_message(
    entry: &ToolRegistryEntry,
    metadata: &Metadata,
    state: &ConversationState,
    open_fields: &[&str],
) -> String {
    let mut known = Vec::new();
    known.push(format!("Query: {}", metadata.query));
    if let Some(profile) = &metadata.user_profile {
        known.push(format!(
            "User: {} from {}",
            profile.user_type,
            profile.location.display()
        ));
    }
    if !state.context_entities.is_empty() {
        known.push(format!(
            "Conversation entities: {}",
            Value::Object(state.context_entities.clone())
        ));
    }
    if let Some(last) = state.last_assistant_message() {
        known.push(format!("Last assistant reply: {}", last.content));
    }

    format!(
        "Input schema: {}\nRequired fields still open: {}\n\nKnown facts:\n{}",
        entry.input_schema,
        open_fields.join(", "),
        known.join("\n")
    )
}
