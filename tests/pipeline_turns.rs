// Pipeline turn tests - full extract -> map -> plan -> execute cycles
//
// Tests that drive the conversation pipeline end to end against scripted
// model replies and scripted tool servers.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use udyamitra::application::executor::{PlanExecutor, NO_TOOLS_MESSAGE};
use udyamitra::application::extractor::MetadataExtractor;
use udyamitra::application::locations::{GeoAddress, GeocodeError, Geocoder, LocationNormalizer};
use udyamitra::application::mapper::ToolMapper;
use udyamitra::application::pipeline::{Pipeline, Stage};
use udyamitra::application::planner::Planner;
use udyamitra::config::ToolRegistry;
use udyamitra::domain::types::ToolRegistryEntry;
use udyamitra::infrastructure::llm::{LlmClient, LlmError};
use udyamitra::infrastructure::tools::{DiscoveredInputs, ToolInvokeError, ToolTransport};

// ============================================================================
// Scripted collaborators
// ============================================================================

/// Routes each chat call to a purpose-specific reply queue based on the
/// system prompt, so a test scripts extraction, planning, and summaries
/// independently of call interleaving.
#[derive(Default)]
struct ScriptedLlm {
    extraction: Mutex<VecDeque<String>>,
    planning: Mutex<VecDeque<String>>,
    summaries: Mutex<VecDeque<String>>,
}

impl ScriptedLlm {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push_extraction(&self, reply: &str) {
        self.extraction.lock().expect("lock").push_back(reply.to_string());
    }

    fn push_plan(&self, reply: &str) {
        self.planning.lock().expect("lock").push_back(reply.to_string());
    }

    fn push_summary(&self, reply: &str) {
        self.summaries.lock().expect("lock").push_back(reply.to_string());
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(&self, system: &str, _user: &str) -> Result<String, LlmError> {
        let queue = if system.contains("metadata extraction") {
            &self.extraction
        } else if system.contains("execution planner") {
            &self.planning
        } else {
            &self.summaries
        };
        queue
            .lock()
            .expect("lock")
            .pop_front()
            .ok_or_else(|| LlmError::InvalidResponse("no scripted reply left".into()))
    }
}

struct ScriptedTransport {
    responses: Mutex<HashMap<String, VecDeque<String>>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
        })
    }

    fn push_response(&self, tool: &str, body: &str) {
        self.responses
            .lock()
            .expect("lock")
            .entry(tool.to_string())
            .or_default()
            .push_back(body.to_string());
    }
}

#[async_trait]
impl ToolTransport for ScriptedTransport {
    async fn discover(&self, _entry: &ToolRegistryEntry) -> DiscoveredInputs {
        DiscoveredInputs::default()
    }

    async fn invoke(
        &self,
        entry: &ToolRegistryEntry,
        _payload: &Value,
    ) -> Result<String, ToolInvokeError> {
        self.responses
            .lock()
            .expect("lock")
            .get_mut(&entry.tool_name)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| ToolInvokeError::Timeout {
                tool: entry.tool_name.clone(),
            })
    }
}

struct OfflineGeocoder;

#[async_trait]
impl Geocoder for OfflineGeocoder {
    async fn lookup(&self, _raw: &str) -> Result<Option<GeoAddress>, GeocodeError> {
        Ok(Some(GeoAddress {
            city: Some("Bengaluru".to_string()),
            state: Some("Karnataka".to_string()),
            country: Some("India".to_string()),
        }))
    }
}

// ============================================================================
// Fixture
// ============================================================================

fn registry() -> Arc<ToolRegistry> {
    let entry = |tool_name: &str, intents: &[&str]| ToolRegistryEntry {
        tool_name: tool_name.to_string(),
        intents: intents.iter().map(|intent| intent.to_string()).collect(),
        endpoint: format!("http://localhost:8011/{}", tool_name.to_lowercase()),
        input_schema: "SchemeMetadata".to_string(),
        output_schema: "SchemeExplanationResponse".to_string(),
        model: None,
        description: None,
    };
    Arc::new(ToolRegistry::from_entries(vec![
        entry("SchemeExplainer", &["explain"]),
        entry("EligibilityChecker", &["check_eligibility"]),
    ]))
}

fn pipeline(llm: Arc<ScriptedLlm>, transport: Arc<ScriptedTransport>) -> Pipeline {
    let registry = registry();
    let locations = Arc::new(LocationNormalizer::with_delay(
        Box::new(OfflineGeocoder),
        Duration::ZERO,
    ));
    let extractor = MetadataExtractor::new(llm.clone(), locations);
    let mapper = ToolMapper::new(&registry);
    let planner = Planner::new(llm.clone());
    let executor = PlanExecutor::new(registry, transport, llm);
    Pipeline::new(extractor, mapper, planner, executor)
}

const TWO_SCHEME_EXTRACTION: &str = r#"{
    "query": "Can I claim both the Karnataka ESDM subsidy and the SPECS scheme for the same machinery?",
    "intents": ["explain", "check_eligibility"],
    "entities": {"scheme": ["Karnataka ESDM subsidy", "SPECS scheme"]},
    "user_profile": {"user_type": "entrepreneur", "location": "Bengaluru"}
}"#;

const CHAINED_PLAN: &str = r#"{
    "execution_type": "sequential",
    "tasks": [
        {"tool": "SchemeExplainer", "input": {"scheme_name": "Karnataka ESDM subsidy"}, "input_from": null},
        {"tool": "EligibilityChecker", "input": {}, "input_from": "SchemeExplainer"}
    ]
}"#;

// ============================================================================
// Turn scenarios
// ============================================================================

#[tokio::test]
async fn two_scheme_query_runs_explainer_then_chained_checker() {
    let llm = ScriptedLlm::new();
    let transport = ScriptedTransport::new();

    llm.push_extraction(TWO_SCHEME_EXTRACTION);
    llm.push_plan(CHAINED_PLAN);
    llm.push_summary("Both schemes cover capital subsidy for electronics units.");
    llm.push_summary("You can claim only one of the two for the same machinery.");
    transport.push_response(
        "SchemeExplainer",
        r#"{"scheme_name": "Karnataka ESDM subsidy", "explanation": "capital subsidy for ESDM units"}"#,
    );
    transport.push_response(
        "EligibilityChecker",
        r#"{"scheme_name": "SPECS scheme", "eligible": true, "reasons": ["no double-dipping"], "missing_fields": []}"#,
    );

    let mut pipeline = pipeline(llm, transport);
    let outcome = pipeline
        .start("Can I claim both the Karnataka ESDM subsidy and the SPECS scheme for the same machinery?")
        .await;

    assert_eq!(outcome.stage, Stage::Completed);
    assert!(outcome.results.contains_key("SchemeExplainer"));
    assert!(outcome.results.contains_key("EligibilityChecker"));
    assert!(outcome.message.contains("only one of the two"));

    let state = pipeline.state();
    assert_eq!(state.last_tool_used.as_deref(), Some("EligibilityChecker"));
    assert_eq!(state.last_intent.as_deref(), Some("explain"));
    assert_eq!(
        state.last_scheme_mentioned.as_deref(),
        Some("Karnataka ESDM subsidy")
    );
    assert!(state.tool_memory.contains_key("SchemeExplainer"));
}

#[tokio::test]
async fn unmapped_intents_complete_with_no_tools_message() {
    let llm = ScriptedLlm::new();
    llm.push_extraction(
        r#"{"intents": ["write_poetry"], "entities": {}, "user_profile": {"user_type": "student", "location": "unknown"}}"#,
    );

    let mut pipeline = pipeline(llm, ScriptedTransport::new());
    let outcome = pipeline.start("write me a poem about subsidies").await;

    assert_eq!(outcome.stage, Stage::Completed);
    assert_eq!(outcome.message, NO_TOOLS_MESSAGE);
    assert!(outcome.results.is_empty());
}

#[tokio::test]
async fn prose_tool_response_degrades_instead_of_failing_the_turn() {
    let llm = ScriptedLlm::new();
    let transport = ScriptedTransport::new();
    llm.push_extraction(
        r#"{"intents": ["explain"], "entities": {"scheme": "PMEGP"}, "user_profile": {"user_type": "entrepreneur", "location": "unknown"}}"#,
    );
    llm.push_plan(
        r#"{"execution_type": "sequential", "tasks": [{"tool": "SchemeExplainer", "input": {}}]}"#,
    );
    llm.push_summary("PMEGP subsidizes new micro-enterprises.");
    transport.push_response(
        "SchemeExplainer",
        "PMEGP gives margin money subsidy, there is no JSON here at all.",
    );

    let mut pipeline = pipeline(llm, transport);
    let outcome = pipeline.start("what is PMEGP").await;

    assert_eq!(outcome.stage, Stage::Completed);
    let wrapped = outcome
        .results
        .get("SchemeExplainer")
        .and_then(|result| result.get("output_text"))
        .and_then(Value::as_str)
        .expect("raw text wrapped under output_text");
    assert!(wrapped.contains("margin money subsidy"));
}

#[tokio::test]
async fn topic_switch_clears_context_but_keeps_transcript_and_profile() {
    let llm = ScriptedLlm::new();
    let transport = ScriptedTransport::new();

    // Turn 1: explain PMEGP.
    llm.push_extraction(
        r#"{"intents": ["explain"], "entities": {"scheme": "PMEGP"}, "user_profile": {"user_type": "entrepreneur", "location": "Bengaluru"}}"#,
    );
    llm.push_plan(
        r#"{"execution_type": "sequential", "tasks": [{"tool": "SchemeExplainer", "input": {}}]}"#,
    );
    llm.push_summary("PMEGP explained.");
    transport.push_response("SchemeExplainer", r#"{"scheme_name": "PMEGP", "explanation": "x"}"#);

    // Turn 2: different intent and scheme.
    llm.push_extraction(
        r#"{"intents": ["check_eligibility"], "entities": {"scheme": "SPECS"}, "user_profile": {"user_type": "entrepreneur", "location": "Bengaluru"}}"#,
    );
    llm.push_plan(
        r#"{"execution_type": "sequential", "tasks": [{"tool": "EligibilityChecker", "input": {}}]}"#,
    );
    llm.push_summary("Eligibility for SPECS checked.");
    transport.push_response(
        "EligibilityChecker",
        r#"{"scheme_name": "SPECS", "eligible": true, "missing_fields": []}"#,
    );

    let mut pipeline = pipeline(llm, transport);
    pipeline.start("what is PMEGP").await;
    let messages_before = pipeline.state().messages.len();
    assert!(pipeline.state().tool_memory.contains_key("SchemeExplainer"));

    let outcome = pipeline.process_turn("am I eligible for SPECS?").await;

    assert_eq!(outcome.stage, Stage::Completed);
    let state = pipeline.state();
    assert_eq!(state.last_intent.as_deref(), Some("check_eligibility"));
    assert_eq!(state.last_scheme_mentioned.as_deref(), Some("SPECS"));
    // Context entities were rebuilt from the new turn only.
    assert_eq!(
        state.context_entities.get("scheme").and_then(Value::as_str),
        Some("SPECS")
    );
    assert!(state.messages.len() > messages_before);
    assert!(state.user_profile.is_some());
}

#[tokio::test]
async fn extraction_failure_ends_the_turn_in_error() {
    let llm = ScriptedLlm::new();
    // No scripted extraction reply: the model call errors out.
    let mut pipeline = pipeline(llm, ScriptedTransport::new());
    let outcome = pipeline.start("anything").await;

    assert_eq!(outcome.stage, Stage::Error);
    assert!(outcome.results.is_empty());
    // The failure is still part of the transcript.
    assert_eq!(pipeline.state().messages.len(), 2);
}

#[tokio::test]
async fn planning_failure_ends_the_turn_in_error() {
    let llm = ScriptedLlm::new();
    // Extraction succeeds, but no scripted plan reply: the planner call errors.
    llm.push_extraction(TWO_SCHEME_EXTRACTION);

    let mut pipeline = pipeline(llm, ScriptedTransport::new());
    let outcome = pipeline.start("claim both schemes?").await;

    assert_eq!(outcome.stage, Stage::Error);
    assert!(outcome.results.is_empty());
    // The transcript still carries the user query and the error reply.
    assert_eq!(pipeline.state().messages.len(), 2);
}

#[tokio::test]
async fn broken_dependency_keeps_the_sibling_result() {
    let llm = ScriptedLlm::new();
    let transport = ScriptedTransport::new();

    llm.push_extraction(TWO_SCHEME_EXTRACTION);
    // The checker reads from a tool that is not part of the plan at all.
    llm.push_plan(
        r#"{"execution_type": "sequential", "tasks": [
            {"tool": "SchemeExplainer", "input": {}},
            {"tool": "EligibilityChecker", "input": {}, "input_from": "InvestorInsight"}
        ]}"#,
    );
    llm.push_summary("Explainer summary.");
    transport.push_response(
        "SchemeExplainer",
        r#"{"scheme_name": "Karnataka ESDM subsidy", "explanation": "x"}"#,
    );

    let mut pipeline = pipeline(llm, transport);
    let outcome = pipeline.start("claim both schemes?").await;

    assert_eq!(outcome.stage, Stage::Completed);
    assert!(outcome.message.contains("Explainer summary."));
    assert!(outcome.results.contains_key("SchemeExplainer"));
    let failed = outcome
        .results
        .get("EligibilityChecker")
        .and_then(|result| result.get("error"))
        .and_then(Value::as_str)
        .expect("error slot for the broken dependency");
    assert!(failed.contains("earlier step"));
}

#[tokio::test]
async fn failed_tool_still_surfaces_successful_sibling() {
    let llm = ScriptedLlm::new();
    let transport = ScriptedTransport::new();

    llm.push_extraction(TWO_SCHEME_EXTRACTION);
    llm.push_plan(
        r#"{"execution_type": "sequential", "tasks": [
            {"tool": "SchemeExplainer", "input": {}},
            {"tool": "EligibilityChecker", "input": {}}
        ]}"#,
    );
    llm.push_summary("Explainer summary.");
    transport.push_response(
        "SchemeExplainer",
        r#"{"scheme_name": "Karnataka ESDM subsidy", "explanation": "x"}"#,
    );
    // EligibilityChecker has no scripted response and times out.

    let mut pipeline = pipeline(llm, transport);
    let outcome = pipeline.start("claim both schemes?").await;

    assert_eq!(outcome.stage, Stage::Completed);
    assert!(outcome.message.contains("Explainer summary."));
    assert!(outcome.message.contains("took too long"));
    let failed = outcome
        .results
        .get("EligibilityChecker")
        .and_then(|result| result.get("error"))
        .and_then(Value::as_str)
        .expect("error slot for failed tool");
    assert!(failed.contains("EligibilityChecker"));
}
