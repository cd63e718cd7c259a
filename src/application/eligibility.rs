use crate::domain::types::{
    EligibilityCheckRequest, EligibilityCheckResponse, EntityValue, ToolRegistryEntry,
};
use crate::infrastructure::jsonx;
use crate::infrastructure::llm::LlmClient;
use crate::infrastructure::tools::{ToolInvokeError, ToolTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The follow-up loop gives up after this many question/answer rounds and
/// reports that eligibility cannot be determined, instead of asking forever.
pub const DEFAULT_MAX_TURNS: usize = 5;

const QUESTION_SYSTEM_PROMPT: &str = r#"
You help a government scheme assistant collect missing applicant details. Given
a list of missing field names and the scheme being checked, write one short,
polite question in plain language per field, in the same order as the fields.
Respond ONLY with JSON of the form {"questions": ["...", "..."]}.
"#;

#[derive(Debug, Error)]
pub enum EligibilityError {
    #[error(transparent)]
    Tool(#[from] ToolInvokeError),
    #[error("eligibility tool returned an unusable response: {0}")]
    Malformed(String),
}

/// Seam over the remote eligibility tool so the loop is testable without a
/// server.
#[async_trait]
pub trait EligibilityChecker: Send + Sync {
    async fn check(
        &self,
        request: &EligibilityCheckRequest,
    ) -> Result<EligibilityCheckResponse, EligibilityError>;
}

/// Checks eligibility by invoking the registered eligibility tool endpoint.
pub struct RemoteEligibilityChecker {
    transport: Arc<dyn ToolTransport>,
    entry: ToolRegistryEntry,
}

impl RemoteEligibilityChecker {
    pub fn new(transport: Arc<dyn ToolTransport>, entry: ToolRegistryEntry) -> Self {
        Self { transport, entry }
    }
}

#[async_trait]
impl EligibilityChecker for RemoteEligibilityChecker {
    async fn check(
        &self,
        request: &EligibilityCheckRequest,
    ) -> Result<EligibilityCheckResponse, EligibilityError> {
        let payload = serde_json::to_value(request)
            .map_err(|err| EligibilityError::Malformed(err.to_string()))?;
        let raw = self.transport.invoke(&self.entry, &payload).await?;
        let parsed = jsonx::parse_or_wrap(&raw);
        serde_json::from_value(parsed)
            .map_err(|err| EligibilityError::Malformed(err.to_string()))
    }
}

/// Builds one plain-language follow-up question per missing field, with a
/// fixed phrasing fallback when the model is unavailable.
pub struct QuestionGenerator {
    llm: Arc<dyn LlmClient>,
}

impl QuestionGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// One question per missing field, in field order. Any shortfall in the
    /// model's output is padded with fixed phrasing so fields and questions
    /// always pair up positionally.
    pub async fn questions_for(&self, fields: &[String], scheme: &str) -> Vec<String> {
        let user_message = format!(
            "Missing fields: {}\nScheme being checked: {scheme}",
            fields.join(", ")
        );
        let generated = match self.llm.chat_json(QUESTION_SYSTEM_PROMPT, &user_message).await {
            Ok(value) => value
                .get("questions")
                .and_then(serde_json::Value::as_array)
                .map(|questions| {
                    questions
                        .iter()
                        .filter_map(serde_json::Value::as_str)
                        .map(str::trim)
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "Question generation failed, using fixed phrasing");
                Vec::new()
            }
        };

        fields
            .iter()
            .enumerate()
            .map(|(index, field)| {
                generated
                    .get(index)
                    .filter(|question| !question.is_empty())
                    .cloned()
                    .unwrap_or_else(|| fallback_question(field))
            })
            .collect()
    }
}

fn fallback_question(field: &str) -> String {
    format!("Could you tell me your {}?", field.replace('_', " "))
}

/// Where the loop ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    /// The checker reached a yes/no (or ran out of things to ask about).
    Decided(EligibilityCheckResponse),
    /// The turn cap was hit with fields still missing.
    CannotDetermine {
        asked: usize,
        last_response: EligibilityCheckResponse,
    },
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStep {
    /// Put this question to the user, then call `submit_answer` and advance again.
    Ask { field: String, question: String },
    Done(LoopOutcome),
}

/// Interactive follow-up state machine: check, ask about the first missing
/// field, merge the answer, check again. The caller (CLI or API) drives it by
/// alternating `advance` and `submit_answer`.
pub struct EligibilityLoop {
    checker: Arc<dyn EligibilityChecker>,
    questions: QuestionGenerator,
    request: EligibilityCheckRequest,
    max_turns: usize,
    turns_used: usize,
    pending_field: Option<String>,
}

impl EligibilityLoop {
    pub fn new(
        checker: Arc<dyn EligibilityChecker>,
        llm: Arc<dyn LlmClient>,
        request: EligibilityCheckRequest,
    ) -> Self {
        Self::with_max_turns(checker, llm, request, DEFAULT_MAX_TURNS)
    }

    pub fn with_max_turns(
        checker: Arc<dyn EligibilityChecker>,
        llm: Arc<dyn LlmClient>,
        request: EligibilityCheckRequest,
        max_turns: usize,
    ) -> Self {
        Self {
            checker,
            questions: QuestionGenerator::new(llm),
            request,
            max_turns,
            turns_used: 0,
            pending_field: None,
        }
    }

    /// Runs one CHECK transition and reports what to do next.
    pub async fn advance(&mut self) -> Result<LoopStep, EligibilityError> {
        let response = self.checker.check(&self.request).await?;

        if response.is_decided() {
            info!(
                scheme = %response.scheme_name,
                eligible = ?response.eligible,
                turns = self.turns_used,
                "Eligibility decided"
            );
            return Ok(LoopStep::Done(LoopOutcome::Decided(response)));
        }

        if self.turns_used >= self.max_turns {
            warn!(
                scheme = %response.scheme_name,
                turns = self.turns_used,
                "Turn cap reached with fields still missing"
            );
            return Ok(LoopStep::Done(LoopOutcome::CannotDetermine {
                asked: self.turns_used,
                last_response: response,
            }));
        }

        // Questions are generated for the whole batch of missing fields, but
        // only the first field/question pair goes to the user this turn; the
        // rest are regenerated from the checker's next response.
        let questions = self
            .questions
            .questions_for(&response.missing_fields, &response.scheme_name)
            .await;
        let field = response.missing_fields[0].clone();
        let question = questions
            .into_iter()
            .next()
            .unwrap_or_else(|| fallback_question(&field));
        self.pending_field = Some(field.clone());
        self.turns_used += 1;
        debug!(%field, turn = self.turns_used, "Asking follow-up");
        Ok(LoopStep::Ask { field, question })
    }

    /// Merges the user's answer under the field the last question asked for.
    /// A stray answer with no pending question is ignored.
    pub fn submit_answer(&mut self, answer: &str) {
        let Some(field) = self.pending_field.take() else {
            warn!("Answer received with no pending question");
            return;
        };
        let entities = self
            .request
            .context_entities
            .get_or_insert_with(HashMap::new);
        entities.insert(field, EntityValue::One(answer.trim().to_string()));
    }

    pub fn turns_used(&self) -> usize {
        self.turns_used
    }
}

/// Renders a terminal outcome as user-facing prose; the loop's driver prints
/// this directly.
pub fn outcome_message(outcome: &LoopOutcome) -> String {
    match outcome {
        LoopOutcome::Decided(response) => {
            let verdict = match response.eligible {
                Some(true) => format!("You appear to be eligible for {}.", response.scheme_name),
                Some(false) => {
                    format!("You do not appear to be eligible for {}.", response.scheme_name)
                }
                None => format!(
                    "The check for {} finished without a firm verdict.",
                    response.scheme_name
                ),
            };
            if response.reasons.is_empty() {
                verdict
            } else {
                format!("{verdict}\n- {}", response.reasons.join("\n- "))
            }
        }
        LoopOutcome::CannotDetermine { asked, last_response } => format!(
            "After {asked} follow-up questions, eligibility for {} still cannot be determined. Missing details: {}.",
            last_response.scheme_name,
            last_response.missing_fields.join(", ")
        ),
    }
}
