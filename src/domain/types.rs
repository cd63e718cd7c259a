use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use utoipa::ToSchema;

/// A raw location string resolved into administrative regions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub raw: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

impl Location {
    /// Canonical form for queries that never name a place, or name only the country.
    pub fn india(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            city: None,
            state: None,
            country: Some("India".to_string()),
        }
    }

    /// Single-line rendering used when a location lands in `context_entities`.
    pub fn display(&self) -> String {
        [self.city.as_deref(), self.state.as_deref(), self.country.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Free-text classification, e.g. "woman_entrepreneur" or "student".
    pub user_type: String,
    pub location: Location,
}

/// Entity values come back from the extraction model as either a scalar or a
/// list, and both shapes are legitimate (multi-scheme queries stay lists).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityValue {
    One(String),
    Many(Vec<String>),
}

impl EntityValue {
    pub fn first(&self) -> Option<&str> {
        match self {
            EntityValue::One(value) => Some(value.as_str()),
            EntityValue::Many(values) => values.first().map(String::as_str),
        }
    }

    /// Singleton lists collapse to a scalar; multi-element lists are preserved.
    pub fn coerce_singleton(self) -> Self {
        match self {
            EntityValue::Many(mut values) if values.len() == 1 => {
                EntityValue::One(values.remove(0))
            }
            other => other,
        }
    }
}

/// Structured interpretation of one user query. Created once per turn by the
/// extractor and read-only afterwards; cross-turn accumulation happens on
/// `ConversationState`, never here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub query: String,
    pub intents: Vec<String>,
    #[serde(default)]
    pub tools_required: Vec<String>,
    #[serde(default)]
    pub entities: HashMap<String, EntityValue>,
    pub user_profile: Option<UserProfile>,
}

impl Metadata {
    pub fn scheme(&self) -> Option<&str> {
        self.entities.get("scheme").and_then(EntityValue::first)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    Sequential,
    Parallel,
}

impl ExecutionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionType::Sequential => "sequential",
            ExecutionType::Parallel => "parallel",
        }
    }
}

/// One planned tool invocation. `input_from` chains this task to an earlier
/// task's textual output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolTask {
    pub tool_name: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub input_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub execution_type: ExecutionType,
    pub task_list: Vec<ToolTask>,
}

impl ExecutionPlan {
    pub fn empty() -> Self {
        Self {
            execution_type: ExecutionType::Sequential,
            task_list: Vec::new(),
        }
    }
}

/// Static per-tool descriptor loaded from the registry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ToolRegistryEntry {
    pub tool_name: String,
    pub intents: Vec<String>,
    pub endpoint: String,
    pub input_schema: String,
    pub output_schema: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub tool_used: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_used: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn from_tool(tool: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_used: Some(tool.into()),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Last raw output of a tool, kept per tool name on the conversation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMemory {
    pub tool_name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

// --- Scheme explainer contract ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeMetadata {
    pub scheme_name: String,
    pub user_profile: UserProfile,
    #[serde(default)]
    pub context_entities: Option<HashMap<String, EntityValue>>,
    #[serde(default)]
    pub detected_intents: Option<Vec<String>>,
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeExplanationResponse {
    pub scheme_name: String,
    pub explanation: String,
    #[serde(default)]
    pub follow_up_suggestions: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

// --- Eligibility checker contract ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityCheckRequest {
    pub scheme_name: String,
    pub user_profile: UserProfile,
    /// e.g. {"age": "28", "category": "SC", "sector": "manufacturing"}
    #[serde(default)]
    pub context_entities: Option<HashMap<String, EntityValue>>,
    /// Original query, carried for logging.
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityCheckResponse {
    pub scheme_name: String,
    /// Tri-state: decided yes, decided no, or unknown pending more data.
    pub eligible: Option<bool>,
    #[serde(default)]
    pub reasons: Vec<String>,
    /// Non-empty whenever `eligible` is unknown.
    #[serde(default)]
    pub missing_fields: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl EligibilityCheckResponse {
    /// The interactive loop terminates once the checker either decided or can
    /// no longer justify indeterminacy.
    pub fn is_decided(&self) -> bool {
        self.eligible.is_some() || self.missing_fields.is_empty()
    }
}

/// A document the insight generator's retriever ranked for the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDoc {
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

// --- Insight / analysis generator contracts ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightGeneratorInput {
    /// The original, verbatim query from the user.
    pub user_query: String,
    pub user_profile: UserProfile,
    /// Documents retrieved from the vector store, ranked by similarity.
    #[serde(default)]
    pub retrieved_documents: Vec<RetrievedDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightGeneratorOutput {
    pub insight_summary: String,
    pub detailed_explanation: String,
    #[serde(default)]
    pub potential_benefits: Vec<String>,
    #[serde(default)]
    pub associated_risks: Vec<String>,
    #[serde(default)]
    pub actionable_steps: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisGeneratorOutput {
    pub insight_summary: String,
    pub detailed_explanation: String,
    #[serde(default)]
    pub data_summary: Vec<String>,
    #[serde(default)]
    pub actionable_steps: Vec<String>,
    #[serde(default)]
    pub data_table: Option<Vec<Map<String, Value>>>,
    #[serde(default)]
    pub sources: Vec<String>,
}
