use crate::application::locations::LocationNormalizer;
use crate::domain::state::ConversationState;
use crate::domain::types::{EntityValue, Metadata, UserProfile};
use crate::infrastructure::llm::{LlmClient, LlmError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

const EXTRACTION_SYSTEM_PROMPT: &str = r#"
You are a metadata extraction assistant for an Indian government scheme helpdesk.
Extract the following structured fields from a user query:
- query: the query restated as an explicit, self-contained question. Use the conversation
  context (if provided) to resolve pronouns and follow-up references; otherwise repeat the
  query verbatim.
- intents: a list of high-level user goals such as 'explain', 'check_eligibility', 'register',
  'investment_insight', 'analyze_trade_data'.
- entities: key entities such as the name of the scheme. If multiple schemes are mentioned,
  return them as a list.
- user_profile: includes 'user_type' (e.g. 'woman_entrepreneur', 'student') and 'location'.
  If no location is specified, use "unknown" or "India" as a fallback. If user_type is not
  explicit, infer it from context (e.g. someone asking about subsidies is an "entrepreneur").
  Always return a non-empty user_type and location.

Respond ONLY with the following JSON structure, with no additional commentary:
{
    "query": "...",
    "intents": [...],
    "entities": {
        "scheme": "..."
    },
    "user_profile": {
        "user_type": "...",
        "location": "..."
    }
}
"#;

const FALLBACK_USER_TYPE: &str = "entrepreneur";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("language model call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("no JSON object found in extraction response")]
    Unparsable,
    #[error("extraction response missing required key '{0}'")]
    MissingKey(&'static str),
}

impl ExtractionError {
    pub fn user_message(&self) -> String {
        match self {
            ExtractionError::Llm(err) => err.user_message(),
            ExtractionError::Unparsable | ExtractionError::MissingKey(_) => {
                "I could not understand the query well enough to route it. Please rephrase."
                    .to_string()
            }
        }
    }
}

/// Turns a raw query (plus optional prior-turn state) into a [`Metadata`]
/// record. Stateless: merging extracted entities back into the conversation
/// is the caller's responsibility.
pub struct MetadataExtractor {
    llm: Arc<dyn LlmClient>,
    locations: Arc<LocationNormalizer>,
}

impl MetadataExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, locations: Arc<LocationNormalizer>) -> Self {
        Self { llm, locations }
    }

    pub async fn extract(
        &self,
        query: &str,
        state: Option<&ConversationState>,
    ) -> Result<Metadata, ExtractionError> {
        let user_message = compose_user_message(query, state);
        debug!(query, with_context = state.is_some(), "Extracting metadata");

        let raw = self
            .llm
            .chat_json(EXTRACTION_SYSTEM_PROMPT, &user_message)
            .await?;
        let object = raw.as_object().ok_or(ExtractionError::Unparsable)?;

        let expanded_query = object
            .get("query")
            .and_then(Value::as_str)
            .filter(|expanded| !expanded.trim().is_empty())
            .unwrap_or(query)
            .to_string();

        let intents = object
            .get("intents")
            .and_then(Value::as_array)
            .ok_or(ExtractionError::MissingKey("intents"))?
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect::<Vec<_>>();
        if intents.is_empty() {
            return Err(ExtractionError::MissingKey("intents"));
        }

        let entities = parse_entities(object.get("entities"));
        let user_profile = self.parse_profile(object.get("user_profile")).await;

        info!(
            intents = ?intents,
            scheme = entities.get("scheme").and_then(EntityValue::first),
            "Metadata extracted"
        );

        Ok(Metadata {
            query: expanded_query,
            intents,
            tools_required: Vec::new(),
            entities,
            user_profile: Some(user_profile),
        })
    }

    async fn parse_profile(&self, profile: Option<&Value>) -> UserProfile {
        let profile = profile.and_then(Value::as_object);

        let user_type = profile
            .and_then(|map| map.get("user_type"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|user_type| !user_type.is_empty())
            .unwrap_or(FALLBACK_USER_TYPE)
            .to_string();

        let raw_location = profile
            .and_then(|map| map.get("location"))
            .map(location_hint)
            .unwrap_or_default();

        let location = self.locations.normalize(&raw_location).await;

        UserProfile {
            user_type,
            location,
        }
    }
}

/// The model may return location as a bare string or as a partial object;
/// reduce either to the raw string the normalizer expects.
fn location_hint(value: &Value) -> String {
    match value {
        Value::String(raw) => raw.clone(),
        Value::Object(map) => map
            .get("raw")
            .or_else(|| map.get("city"))
            .or_else(|| map.get("state"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

fn parse_entities(entities: Option<&Value>) -> HashMap<String, EntityValue> {
    let mut parsed = HashMap::new();
    let Some(map) = entities.and_then(Value::as_object) else {
        return parsed;
    };
    for (key, value) in map {
        let Ok(entity) = serde_json::from_value::<EntityValue>(value.clone()) else {
            debug!(%key, "Dropping entity with unsupported shape");
            continue;
        };
        parsed.insert(key.clone(), entity.coerce_singleton());
    }
    parsed
}

fn compose_user_message(query: &str, state: Option<&ConversationState>) -> String {
    let Some(state) = state else {
        return query.to_string();
    };

    let mut context_lines = Vec::new();
    if let Some(last_tool) = &state.last_tool_used {
        context_lines.push(format!("Last tool used: {last_tool}"));
    }
    if let Some(last) = state.last_assistant_message() {
        context_lines.push(format!("Last assistant reply: {}", last.content));
    }
    if !state.context_entities.is_empty() {
        context_lines.push(format!(
            "Known entities so far: {}",
            Value::Object(state.context_entities.clone())
        ));
    }

    if context_lines.is_empty() {
        query.to_string()
    } else {
        format!(
            "Conversation context:\n{}\n\nCurrent query:\n{}",
            context_lines.join("\n"),
            query
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::locations::{GeoAddress, GeocodeError, Geocoder};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedLlm {
        replies: Mutex<VecDeque<String>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            self.replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .ok_or_else(|| LlmError::InvalidResponse("script exhausted".into()))
        }
    }

    struct StaticGeocoder;

    #[async_trait]
    impl Geocoder for StaticGeocoder {
        async fn lookup(&self, _raw: &str) -> Result<Option<GeoAddress>, GeocodeError> {
            Ok(Some(GeoAddress {
                city: Some("Bengaluru".to_string()),
                state: Some("Karnataka".to_string()),
                country: Some("India".to_string()),
            }))
        }
    }

    fn extractor(replies: Vec<&str>) -> MetadataExtractor {
        MetadataExtractor::new(
            ScriptedLlm::new(replies),
            Arc::new(LocationNormalizer::with_delay(
                Box::new(StaticGeocoder),
                Duration::ZERO,
            )),
        )
    }

    #[tokio::test]
    async fn extracts_intents_entities_and_profile() {
        let extractor = extractor(vec![
            r#"{"query": "Explain the PMEGP scheme", "intents": ["explain"], "entities": {"scheme": "PMEGP"}, "user_profile": {"user_type": "entrepreneur", "location": "Bengaluru"}}"#,
        ]);

        let metadata = extractor.extract("tell me about PMEGP", None).await.expect("metadata");
        assert_eq!(metadata.query, "Explain the PMEGP scheme");
        assert_eq!(metadata.intents, vec!["explain"]);
        assert_eq!(metadata.scheme(), Some("PMEGP"));
        assert!(metadata.tools_required.is_empty());

        let profile = metadata.user_profile.expect("profile");
        assert_eq!(profile.user_type, "entrepreneur");
        assert_eq!(profile.location.city.as_deref(), Some("Bengaluru"));
    }

    #[tokio::test]
    async fn singleton_scheme_list_becomes_scalar_but_multi_stays_list() {
        let extractor = extractor(vec![
            r#"{"intents": ["explain"], "entities": {"scheme": ["SPECS"]}, "user_profile": {"user_type": "entrepreneur", "location": "india"}}"#,
        ]);
        let metadata = extractor.extract("what is SPECS", None).await.expect("metadata");
        assert_eq!(
            metadata.entities.get("scheme"),
            Some(&EntityValue::One("SPECS".to_string()))
        );

        let extractor = extractor_multi();
        let metadata = extractor
            .extract("can I combine ESDM and SPECS", None)
            .await
            .expect("metadata");
        assert_eq!(
            metadata.entities.get("scheme"),
            Some(&EntityValue::Many(vec![
                "Karnataka ESDM subsidy".to_string(),
                "SPECS scheme".to_string()
            ]))
        );
    }

    fn extractor_multi() -> MetadataExtractor {
        extractor(vec![
            r#"{"intents": ["explain", "check_eligibility"], "entities": {"scheme": ["Karnataka ESDM subsidy", "SPECS scheme"]}, "user_profile": {"user_type": "entrepreneur", "location": "unknown"}}"#,
        ])
    }

    #[tokio::test]
    async fn unknown_location_short_circuits_to_india() {
        let extractor = extractor(vec![
            r#"{"intents": ["explain"], "entities": {}, "user_profile": {"user_type": "student", "location": "unknown"}}"#,
        ]);
        let metadata = extractor.extract("what schemes exist", None).await.expect("metadata");
        let profile = metadata.user_profile.expect("profile");
        assert_eq!(profile.location.country.as_deref(), Some("India"));
        assert!(profile.location.city.is_none());
    }

    #[tokio::test]
    async fn missing_user_type_falls_back_to_entrepreneur() {
        let extractor = extractor(vec![
            r#"{"intents": ["explain"], "entities": {"scheme": "PMEGP"}, "user_profile": {"user_type": "", "location": "India"}}"#,
        ]);
        let metadata = extractor.extract("subsidy for machinery", None).await.expect("metadata");
        assert_eq!(
            metadata.user_profile.expect("profile").user_type,
            FALLBACK_USER_TYPE
        );
    }

    #[tokio::test]
    async fn unparsable_reply_is_a_typed_error() {
        let extractor = extractor(vec!["I do not feel like emitting JSON today."]);
        let result = extractor.extract("anything", None).await;
        assert!(matches!(result, Err(ExtractionError::Llm(_))));
    }

    #[tokio::test]
    async fn missing_intents_is_a_typed_error() {
        let extractor = extractor(vec![
            r#"{"entities": {"scheme": "PMEGP"}, "user_profile": {"user_type": "x", "location": "India"}}"#,
        ]);
        let result = extractor.extract("anything", None).await;
        assert!(matches!(result, Err(ExtractionError::MissingKey("intents"))));
    }

    #[test]
    fn context_hint_includes_prior_turn_facts() {
        let mut state = ConversationState::new();
        state.set_last_tool("SchemeExplainer");
        state.add_message(crate::domain::types::MessageRole::Assistant, "PMEGP offers...");
        state
            .context_entities
            .insert("scheme".to_string(), Value::String("PMEGP".to_string()));

        let message = compose_user_message("am I eligible?", Some(&state));
        assert!(message.contains("Last tool used: SchemeExplainer"));
        assert!(message.contains("PMEGP offers..."));
        assert!(message.contains("Current query:\nam I eligible?"));
    }
}
