use crate::application::schema::{ResponseKind, SchemaGenerator};
use crate::config::ToolRegistry;
use crate::domain::state::ConversationState;
use crate::domain::types::{ExecutionPlan, ExecutionType, Metadata, ToolTask};
use crate::infrastructure::jsonx;
use crate::infrastructure::llm::LlmClient;
use crate::infrastructure::tools::ToolTransport;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const NO_TOOLS_MESSAGE: &str = "no tools could be executed";

/// `ParallelUnsupported` and `UnknownTool` abort the whole plan; an
/// unresolved dependency is caught per task and recorded in its result slot.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("parallel execution is not supported yet")]
    ParallelUnsupported,
    #[error("tool '{0}' is not registered")]
    UnknownTool(String),
    #[error("task '{task}' depends on output of '{dependency}', which has not produced any")]
    DependencyUnresolved { task: String, dependency: String },
}

impl ExecutionError {
    pub fn user_message(&self) -> String {
        match self {
            ExecutionError::ParallelUnsupported => {
                "This request needs tools run in parallel, which is not supported yet.".to_string()
            }
            ExecutionError::UnknownTool(tool) => {
                format!("The planned tool '{tool}' is not available.")
            }
            ExecutionError::DependencyUnresolved { task, .. } => {
                format!("The step '{task}' could not run because an earlier step produced no output.")
            }
        }
    }
}

/// Outcome of a single task. A failed task records its error text as the
/// summary and the plan keeps going.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub tool_name: String,
    /// Raw response body as the tool sent it.
    pub raw_text: String,
    /// Defensively parsed response; never absent, worst case `{"output_text": raw}`.
    pub parsed: Value,
    /// User-facing prose for this task.
    pub summary: String,
    pub missing_fields: Vec<String>,
    pub failed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub results: Vec<TaskResult>,
}

impl ExecutionReport {
    /// Single-task plans flatten to that task's prose; multi-task plans join
    /// the per-tool sections; an empty plan yields a fixed notice.
    pub fn combined_message(&self) -> String {
        match self.results.as_slice() {
            [] => NO_TOOLS_MESSAGE.to_string(),
            [only] => only.summary.clone(),
            many => many
                .iter()
                .map(|result| format!("[{}]\n{}", result.tool_name, result.summary))
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.results.is_empty() && self.results.iter().any(|result| !result.failed)
    }
}

/// Runs an execution plan task by task: discover the tool's required inputs,
/// assemble a payload, invoke, parse defensively, summarize for the user, and
/// fold everything back into the conversation state.
pub struct PlanExecutor {
    registry: Arc<ToolRegistry>,
    transport: Arc<dyn ToolTransport>,
    schemas: SchemaGenerator,
    llm: Arc<dyn LlmClient>,
}

impl PlanExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        transport: Arc<dyn ToolTransport>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            registry,
            transport,
            schemas: SchemaGenerator::new(llm.clone()),
            llm,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn run_execution_plan(
        &self,
        plan: &ExecutionPlan,
        metadata: &Metadata,
        state: &mut ConversationState,
    ) -> Result<ExecutionReport, ExecutionError> {
        if plan.execution_type == ExecutionType::Parallel {
            return Err(ExecutionError::ParallelUnsupported);
        }

        let mut report = ExecutionReport::default();
        for task in &plan.task_list {
            let result = self.run_task(task, metadata, state, &report).await?;
            self.update_state(state, metadata, &result);
            report.results.push(result);
        }

        if report.results.is_empty() {
            info!("Plan contained no tasks");
        }
        Ok(report)
    }

    async fn run_task(
        &self,
        task: &ToolTask,
        metadata: &Metadata,
        state: &ConversationState,
        report: &ExecutionReport,
    ) -> Result<TaskResult, ExecutionError> {
        let entry = self
            .registry
            .get(&task.tool_name)
            .ok_or_else(|| ExecutionError::UnknownTool(task.tool_name.clone()))?;

        info!(tool = %task.tool_name, "Executing task");
        let discovered = self.transport.discover(entry).await;
        let seed_input = match resolve_seed_input(task, report) {
            Ok(seed) => seed,
            Err(err) => {
                warn!(tool = %task.tool_name, error = %err, "Dependency unresolved, continuing with remaining tasks");
                return Ok(failed_result(&task.tool_name, err.user_message(), Vec::new()));
            }
        };

        let outcome = match self
            .schemas
            .generate(entry, metadata, state, &discovered, &seed_input)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(tool = %task.tool_name, error = %err, "Payload rejected by schema validation, continuing with remaining tasks");
                return Ok(failed_result(&task.tool_name, err.user_message(), Vec::new()));
            }
        };

        let raw_text = match self.transport.invoke(entry, &Value::Object(outcome.payload)).await {
            Ok(body) => body,
            Err(err) => {
                warn!(tool = %task.tool_name, error = %err, "Tool call failed, continuing with remaining tasks");
                return Ok(failed_result(&task.tool_name, err.user_message(), outcome.missing));
            }
        };

        let parsed = jsonx::parse_or_wrap(&raw_text);
        if let Some(kind) = ResponseKind::from_name(&entry.output_schema) {
            if let Err(err) = kind.check(&parsed) {
                warn!(tool = %task.tool_name, error = %err, "Response does not match the declared output schema");
            }
        }
        let missing_fields = missing_from_response(&parsed, outcome.missing);
        let summary = self.summarize(&task.tool_name, &parsed, &raw_text).await;

        Ok(TaskResult {
            tool_name: task.tool_name.clone(),
            raw_text,
            parsed,
            summary,
            missing_fields,
            failed: false,
        })
    }

    async fn summarize(&self, tool_name: &str, parsed: &Value, raw_text: &str) -> String {
        let context = format!("Result from the {tool_name} tool");
        match self.llm.summarize(parsed, Some(&context)).await {
            Ok(prose) => prose,
            Err(err) => {
                warn!(tool = %tool_name, error = %err, "Summary pass failed, returning raw tool text");
                raw_text.to_string()
            }
        }
    }

    /// Failed tasks keep their error text in the report but leave no other
    /// trace in the state: last tool, tool memory, and missing inputs only
    /// reflect tools that actually answered.
    fn update_state(&self, state: &mut ConversationState, metadata: &Metadata, result: &TaskResult) {
        state.merge_entities(&metadata.entities);
        if let Some(profile) = &metadata.user_profile {
            state.update_user_profile(profile.clone());
        }
        if result.failed {
            return;
        }
        state.set_last_tool(&result.tool_name);
        if let Value::Object(data) = &result.parsed {
            state.record_tool_memory(&result.tool_name, data.clone());
        }
        state.push_message(crate::domain::types::Message::from_tool(
            &result.tool_name,
            &result.summary,
        ));
        state.set_missing_inputs(&result.tool_name, result.missing_fields.clone());
    }
}

fn failed_result(tool_name: &str, summary: String, missing_fields: Vec<String>) -> TaskResult {
    TaskResult {
        tool_name: tool_name.to_string(),
        raw_text: String::new(),
        parsed: Value::Null,
        summary,
        missing_fields,
        failed: true,
    }
}

/// A chained task reads its predecessor's textual output; everything else
/// uses the planner's verbatim input.
fn resolve_seed_input(
    task: &ToolTask,
    report: &ExecutionReport,
) -> Result<Map<String, Value>, ExecutionError> {
    let Some(source) = &task.input_from else {
        return Ok(task.input.clone());
    };

    let predecessor = report
        .results
        .iter()
        .find(|result| &result.tool_name == source && !result.failed)
        .ok_or_else(|| ExecutionError::DependencyUnresolved {
            task: task.tool_name.clone(),
            dependency: source.clone(),
        })?;

    let mut seed = Map::new();
    seed.insert(
        "output_text".to_string(),
        Value::String(predecessor.summary.clone()),
    );
    Ok(seed)
}

/// The tool itself is authoritative about what it still needs, including an
/// explicit empty list meaning "nothing". Only when the response carries no
/// `missing_fields` at all do we fall back to the fields the schema layer
/// could not fill.
fn missing_from_response(parsed: &Value, schema_missing: Vec<String>) -> Vec<String> {
    match parsed.get("missing_fields").and_then(Value::as_array) {
        Some(fields) => fields
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        None => schema_missing,
    }
}
