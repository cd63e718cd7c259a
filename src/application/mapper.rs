use crate::config::ToolRegistry;
use crate::domain::types::Metadata;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Reverse index from intent strings to the registry tools that declare them.
/// Built once at startup; matching is exact (case-insensitive) rather than
/// fuzzy, so intents the extraction prompt emits must appear verbatim in the
/// registry.
pub struct ToolMapper {
    by_intent: HashMap<String, Vec<String>>,
}

impl ToolMapper {
    pub fn new(registry: &ToolRegistry) -> Self {
        let mut by_intent: HashMap<String, Vec<String>> = HashMap::new();
        for entry in registry.iter() {
            for intent in &entry.intents {
                by_intent
                    .entry(intent.to_lowercase())
                    .or_default()
                    .push(entry.tool_name.clone());
            }
        }
        debug!(intents = by_intent.len(), "Intent index built");
        Self { by_intent }
    }

    /// Resolves `metadata.intents` to tool names, preserving the intent order
    /// and dropping duplicates when two intents map to the same tool.
    pub fn map_tools(&self, metadata: &Metadata) -> Vec<String> {
        let mut tools = Vec::new();
        for intent in &metadata.intents {
            match self.by_intent.get(&intent.to_lowercase()) {
                Some(candidates) => {
                    for tool in candidates {
                        if !tools.contains(tool) {
                            tools.push(tool.clone());
                        }
                    }
                }
                None => warn!(%intent, "No registered tool serves intent"),
            }
        }
        tools
    }

    pub fn tools_for_intent(&self, intent: &str) -> &[String] {
        self.by_intent
            .get(&intent.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
