use crate::domain::types::ToolRegistryEntry;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ToolInvokeError {
    #[error("failed to reach tool '{tool}' at {endpoint}: {source}")]
    Connect {
        tool: String,
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("call to tool '{tool}' timed out")]
    Timeout { tool: String },
    #[error("tool '{tool}' returned status {status}")]
    Status { tool: String, status: StatusCode },
}

impl ToolInvokeError {
    pub fn user_message(&self) -> String {
        match self {
            ToolInvokeError::Connect { tool, .. } => {
                format!("The tool '{tool}' could not be reached. Please try again later.")
            }
            ToolInvokeError::Timeout { tool } => {
                format!("The tool '{tool}' took too long to answer.")
            }
            ToolInvokeError::Status { tool, .. } => {
                format!("The tool '{tool}' reported an internal problem.")
            }
        }
    }
}

/// Required-input declaration fetched from a tool server. The authoritative
/// contract lives on the server, not in the static registry, so tools can
/// evolve independently of the orchestrator's config.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredInputs {
    pub server_tool: Option<String>,
    pub required: Vec<String>,
}

/// Network seam towards the remote tool servers. One connect/call round trip
/// per task; no pooling is assumed across tasks.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Asks the server which input fields it requires. Failure degrades to an
    /// empty declaration rather than aborting the task.
    async fn discover(&self, entry: &ToolRegistryEntry) -> DiscoveredInputs;

    /// Invokes the tool with the validated payload wrapped in the
    /// `schema_dict` envelope and returns the raw response text.
    async fn invoke(&self, entry: &ToolRegistryEntry, payload: &Value)
        -> Result<String, ToolInvokeError>;
}

#[derive(Debug, Deserialize)]
struct SchemaDeclaration {
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    required: Vec<String>,
}

#[derive(Clone)]
pub struct HttpToolTransport {
    http: Client,
}

impl HttpToolTransport {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self { http: client }
    }

    fn schema_url(endpoint: &str) -> String {
        format!("{}/schema", endpoint.trim_end_matches('/'))
    }
}

impl Default for HttpToolTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn discover(&self, entry: &ToolRegistryEntry) -> DiscoveredInputs {
        let url = Self::schema_url(&entry.endpoint);
        debug!(tool = %entry.tool_name, url = %url, "Fetching tool input declaration");

        let response = self
            .http
            .get(&url)
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match response {
            Ok(response) => match response.json::<SchemaDeclaration>().await {
                Ok(declaration) => DiscoveredInputs {
                    server_tool: declaration.tool,
                    required: declaration.required,
                },
                Err(error) => {
                    warn!(tool = %entry.tool_name, %error, "Tool schema declaration was unreadable");
                    DiscoveredInputs::default()
                }
            },
            Err(error) => {
                warn!(tool = %entry.tool_name, %error, "Failed to fetch input declaration");
                DiscoveredInputs::default()
            }
        }
    }

    async fn invoke(
        &self,
        entry: &ToolRegistryEntry,
        payload: &Value,
    ) -> Result<String, ToolInvokeError> {
        info!(tool = %entry.tool_name, endpoint = %entry.endpoint, "Invoking tool");
        let envelope = json!({ "schema_dict": payload });

        let response = self
            .http
            .post(&entry.endpoint)
            .timeout(CALL_TIMEOUT)
            .json(&envelope)
            .send()
            .await
            .map_err(|source| {
                if source.is_timeout() {
                    ToolInvokeError::Timeout {
                        tool: entry.tool_name.clone(),
                    }
                } else {
                    ToolInvokeError::Connect {
                        tool: entry.tool_name.clone(),
                        endpoint: entry.endpoint.clone(),
                        source,
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolInvokeError::Status {
                tool: entry.tool_name.clone(),
                status,
            });
        }

        let body = response.text().await.map_err(|source| {
            ToolInvokeError::Connect {
                tool: entry.tool_name.clone(),
                endpoint: entry.endpoint.clone(),
                source,
            }
        })?;
        debug!(tool = %entry.tool_name, bytes = body.len(), "Tool responded");
        Ok(body)
    }
}
