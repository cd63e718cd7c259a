use crate::config::ToolRegistry;
use crate::domain::types::{ExecutionPlan, ExecutionType, Metadata, ToolTask};
use crate::infrastructure::llm::{LlmClient, LlmError};
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const PLANNING_SYSTEM_PROMPT: &str = r#"
You are an execution planner for a government scheme assistant. Given a user
query and the tools selected for it, produce an execution plan as JSON:
{
    "execution_type": "sequential" or "parallel",
    "tasks": [
        {
            "tool": "<tool name, exactly as listed>",
            "input": { ...partial input fields you can fill from the query... },
            "input_from": "<name of an earlier tool whose output feeds this task, or null>"
        }
    ]
}
Rules:
- Use only the listed tools, each at most once.
- Order tasks so that any task with "input_from" comes after the task it reads from.
- Prefer "sequential" unless the tasks are fully independent.
- Respond ONLY with the JSON object.
"#;

/// Planning failures end the turn. Running tools in a made-up order would be
/// worse than telling the user the turn failed.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("planning model call failed: {0}")]
    Model(#[from] LlmError),
    #[error("planning model returned an unusable plan")]
    Unusable,
}

impl PlanningError {
    pub fn user_message(&self) -> String {
        match self {
            PlanningError::Model(err) => err.user_message(),
            PlanningError::Unusable => {
                "I could not work out a usable plan of action for this request. Please try rephrasing it."
                    .to_string()
            }
        }
    }
}

/// Asks the model for a task ordering over the already-selected tools. The
/// planner never picks tools itself; it only arranges what the mapper chose,
/// so any hallucinated tool names are discarded during parsing.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn plan(
        &self,
        metadata: &Metadata,
        registry: &ToolRegistry,
    ) -> Result<ExecutionPlan, PlanningError> {
        if metadata.tools_required.is_empty() {
            debug!("No tools required, producing empty plan");
            return Ok(ExecutionPlan::empty());
        }

        let user_message = compose_planning_message(metadata, registry);
        let raw = self
            .llm
            .chat_json(PLANNING_SYSTEM_PROMPT, &user_message)
            .await?;

        let plan = parse_plan(&raw, &metadata.tools_required).ok_or(PlanningError::Unusable)?;
        info!(
            execution_type = plan.execution_type.as_str(),
            tasks = plan.task_list.len(),
            "Execution plan ready"
        );
        Ok(plan)
    }
}

fn parse_plan(raw: &Value, tools_required: &[String]) -> Option<ExecutionPlan> {
    let object = raw.as_object()?;

    let execution_type = match object.get("execution_type").and_then(Value::as_str) {
        Some("parallel") => ExecutionType::Parallel,
        _ => ExecutionType::Sequential,
    };

    let mut task_list = Vec::new();
    for task in object.get("tasks").and_then(Value::as_array)? {
        let task = task.as_object()?;
        let tool_name = task.get("tool").and_then(Value::as_str)?.to_string();
        if !tools_required.contains(&tool_name) {
            warn!(tool = %tool_name, "Dropping planned task for unselected tool");
            continue;
        }
        let input = task
            .get("input")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let input_from = task
            .get("input_from")
            .and_then(Value::as_str)
            .map(str::to_string);
        task_list.push(ToolTask {
            tool_name,
            input,
            input_from,
        });
    }

    if task_list.is_empty() {
        return None;
    }
    Some(ExecutionPlan {
        execution_type,
        task_list,
    })
}

fn compose_planning_message(metadata: &Metadata, registry: &ToolRegistry) -> String {
    let mut message = format!("User query: {}\n\nAvailable tools:\n", metadata.query);
    for tool in &metadata.tools_required {
        let description = registry
            .get(tool)
            .and_then(|entry| entry.description.as_deref())
            .unwrap_or("no description");
        let _ = writeln!(message, "- {tool}: {description}");
    }
    if let Some(profile) = &metadata.user_profile {
        let _ = writeln!(
            message,
            "\nUser profile: {} from {}",
            profile.user_type,
            profile.location.display()
        );
    }
    message
}
