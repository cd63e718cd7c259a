use crate::infrastructure::jsonx;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("model provider returned status {status}: {message}")]
    Api { status: StatusCode, message: String },
    #[error("model provider returned invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn user_message(&self) -> String {
        match self {
            LlmError::Network(err) => {
                if err.is_connect() {
                    "Could not reach the language model service. Check that the endpoint is reachable.".to_string()
                } else if err.is_timeout() {
                    "The language model call timed out. Please try again shortly.".to_string()
                } else {
                    "A network error occurred while contacting the language model.".to_string()
                }
            }
            LlmError::Api { status, .. } => match *status {
                StatusCode::TOO_MANY_REQUESTS => {
                    "The language model service is rate limiting requests. Try again in a moment."
                        .to_string()
                }
                StatusCode::UNAUTHORIZED => {
                    "The language model rejected the API key. Check GROQ_API_KEY.".to_string()
                }
                status => format!(
                    "The language model request failed with status {}.",
                    status.as_u16()
                ),
            },
            LlmError::InvalidResponse(_) => {
                "The language model returned a response that could not be processed.".to_string()
            }
        }
    }
}

/// Chat-completion seam for every LLM-assisted component. Tests substitute a
/// scripted implementation; production uses [`GroqClient`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, system: &str, user: &str) -> Result<String, LlmError>;

    /// Runs a chat turn and recovers a JSON value from the reply using the
    /// layered parser.
    async fn chat_json(&self, system: &str, user: &str) -> Result<Value, LlmError> {
        let output = self.chat(system, user).await?;
        jsonx::extract_json(&output).ok_or_else(|| {
            LlmError::InvalidResponse(format!(
                "no JSON value found in model output: {}",
                snippet(&output)
            ))
        })
    }

    /// "Explain this JSON to the user" pass: converts a structured tool
    /// result into readable prose, citing sources and surfacing follow-up
    /// questions when present.
    async fn summarize(&self, payload: &Value, context: Option<&str>) -> Result<String, LlmError> {
        let system = "You are a helpful assistant that explains structured results about Indian \
                      government schemes in clear, user-friendly language. Highlight outcomes such \
                      as eligibility, cite any sources, and surface follow-up questions under a \
                      short subsection at the end.";
        let user = format!(
            "Context: {}\nJSON Response:\n{}\n\nWrite a clear, human-friendly summary of this information.",
            context.unwrap_or("Result from a government scheme assistance tool"),
            serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string()),
        );
        let response = self.chat(system, &user).await?;
        Ok(response.trim().to_string())
    }
}

/// OpenAI-compatible chat completions client (Groq hosts the models used by
/// the tool servers).
#[derive(Clone)]
pub struct GroqClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GroqClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self::with_client(base_url, api_key, model, Client::new())
    }

    pub fn with_client(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            http: client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{trimmed}/{path}")
    }
}

#[async_trait]
impl LlmClient for GroqClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let url = self.endpoint("/chat/completions");
        let payload = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                WireMessage {
                    role: "system",
                    content: system.to_string(),
                },
                WireMessage {
                    role: "user",
                    content: user.to_string(),
                },
            ],
        };
        info!(model = %self.model, url = %url, "Sending request to model provider");

        let response = self
            .http
            .post(url)
            .timeout(CALL_TIMEOUT)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let completion: ChatCompletionResponse = response.json().await?;
        debug!("Received response from model provider");

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices in completion".into()))?;

        Ok(choice.message.content.trim().to_string())
    }
}

fn snippet(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(200)
        .map(|(index, _)| index)
        .unwrap_or(text.len());
    &text[..end]
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedLlm {
        replies: Mutex<VecDeque<String>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            }
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

    #[tokio::test]
    async fn chat_json_recovers_fenced_payload() {
        let llm = ScriptedLlm::new(vec!["```json\n{\"intents\": [\"explain\"]}\n```"]);
        let value = llm.chat_json("system", "user").await.expect("value");
        assert_eq!(value["intents"], json!(["explain"]));
    }

    #[tokio::test]
    async fn chat_json_rejects_pure_prose() {
        let llm = ScriptedLlm::new(vec!["I could not produce JSON, sorry."]);
        let result = llm.chat_json("system", "user").await;
        assert!(matches!(result, Err(LlmError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn summarize_returns_trimmed_prose() {
        let llm = ScriptedLlm::new(vec!["  You are eligible for PMEGP.  \n"]);
        let summary = llm
            .summarize(&json!({"eligible": true}), Some("eligibility check"))
            .await
            .expect("summary");
        assert_eq!(summary, "You are eligible for PMEGP.");
    }
}
