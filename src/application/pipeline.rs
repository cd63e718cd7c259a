use crate::application::executor::{ExecutionReport, PlanExecutor};
use crate::application::extractor::MetadataExtractor;
use crate::application::mapper::ToolMapper;
use crate::application::planner::Planner;
use crate::domain::state::ConversationState;
use crate::domain::types::{Metadata, MessageRole};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, instrument};
use utoipa::ToSchema;

/// Where a turn currently stands; surfaced verbatim at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Idle,
    MetadataExtraction,
    Planning,
    Execution,
    Completed,
    Error,
}

/// Everything one processed turn hands back to the caller.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub message: String,
    pub stage: Stage,
    /// Parsed per-tool outputs, keyed by tool name. Failed tasks carry their
    /// error text under `"error"`.
    pub results: Map<String, Value>,
    pub state: ConversationState,
}

/// One conversation's end-to-end turn processor: extract metadata, map
/// intents to tools, plan, execute, fold results into state. Owns the
/// `ConversationState` for its session; turns run strictly one at a time.
pub struct Pipeline {
    extractor: MetadataExtractor,
    mapper: ToolMapper,
    planner: Planner,
    executor: PlanExecutor,
    state: ConversationState,
}

impl Pipeline {
    pub fn new(
        extractor: MetadataExtractor,
        mapper: ToolMapper,
        planner: Planner,
        executor: PlanExecutor,
    ) -> Self {
        Self {
            extractor,
            mapper,
            planner,
            executor,
            state: ConversationState::new(),
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Discards all accumulated conversation memory and processes the query
    /// as the first turn of a fresh session.
    pub async fn start(&mut self, query: &str) -> TurnOutcome {
        self.state = ConversationState::new();
        self.process_turn(query).await
    }

    /// Processes a follow-up turn against the accumulated state.
    #[instrument(skip_all, fields(turn_messages = self.state.messages.len()))]
    pub async fn process_turn(&mut self, query: &str) -> TurnOutcome {
        self.state.add_message(MessageRole::User, query);

        // METADATA_EXTRACTION
        let mut metadata = match self.extractor.extract(query, Some(&self.state)).await {
            Ok(metadata) => metadata,
            Err(err) => {
                error!(error = %err, "Turn failed during metadata extraction");
                return self.error_outcome(err.user_message());
            }
        };
        self.absorb_metadata(&metadata);

        // PLANNING
        metadata.tools_required = self.mapper.map_tools(&metadata);
        let plan = match self.planner.plan(&metadata, self.executor.registry()).await {
            Ok(plan) => plan,
            Err(err) => {
                error!(error = %err, "Turn failed during planning");
                return self.error_outcome(err.user_message());
            }
        };

        // EXECUTION
        let report = match self
            .executor
            .run_execution_plan(&plan, &metadata, &mut self.state)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "Turn failed during plan execution");
                return self.error_outcome(err.user_message());
            }
        };

        let message = report.combined_message();
        self.state.add_message(MessageRole::Assistant, &message);
        info!(
            tools = report.results.len(),
            succeeded = report.succeeded(),
            "Turn completed"
        );
        TurnOutcome {
            message,
            stage: Stage::Completed,
            results: results_map(&report),
            state: self.state.clone(),
        }
    }

    /// Record the turn's topic and detect whether it changed. A switch clears
    /// topic-scoped memory but keeps the transcript and profile.
    fn absorb_metadata(&mut self, metadata: &Metadata) {
        let intent = metadata.intents.first().map(String::as_str);
        let scheme = metadata.scheme();

        if self.state.is_topic_switch(intent, scheme) {
            info!(?intent, ?scheme, "Topic switch detected, clearing topic memory");
            self.state.reset_topic();
        }

        if let Some(intent) = intent {
            self.state.last_intent = Some(intent.to_string());
        }
        if let Some(scheme) = scheme {
            self.state.last_scheme_mentioned = Some(scheme.to_string());
        }
        self.state.merge_entities(&metadata.entities);
        if let Some(profile) = &metadata.user_profile {
            self.state.update_user_profile(profile.clone());
        }
    }

    fn error_outcome(&mut self, message: String) -> TurnOutcome {
        self.state.add_message(MessageRole::Assistant, &message);
        TurnOutcome {
            message,
            stage: Stage::Error,
            results: Map::new(),
            state: self.state.clone(),
        }
    }
}

fn results_map(report: &ExecutionReport) -> Map<String, Value> {
    let mut results = Map::new();
    for result in &report.results {
        let value = if result.failed {
            let mut error = Map::new();
            error.insert("error".to_string(), Value::String(result.summary.clone()));
            Value::Object(error)
        } else {
            result.parsed.clone()
        };
        results.insert(result.tool_name.clone(), value);
    }
    results
}
