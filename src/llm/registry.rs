//! Provider id → adapter lookup.

use std::collections::HashMap;
use std::sync::Arc;

use super::command::CommandSettings;
use super::{
    AdapterKind, ChatCompletionsAdapter, CommandAdapter, LlmSettings, Provider, ProviderAdapter,
};
use crate::config::ProviderConfig;

/// Adapters available to runs, keyed by provider id.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every configured provider.
    #[must_use]
    pub fn from_config(providers: &HashMap<String, ProviderConfig>, max_steps: usize) -> Self {
        let mut registry = Self::new();
        for (id, provider) in providers {
            let adapter: Arc<dyn ProviderAdapter> = match provider.clone() {
                ProviderConfig::ChatCompletions {
                    base_url,
                    api_key,
                    model,
                    parallel_tool_calls,
                    azure_deployment,
                    azure_api_version,
                } => {
                    let provider = match (Provider::detect_from_url(&base_url), azure_deployment) {
                        (Provider::AzureOpenAI { api_version, .. }, Some(deployment)) => {
                            Provider::azure(deployment, azure_api_version.unwrap_or(api_version))
                        }
                        (detected, _) => detected,
                    };
                    Arc::new(ChatCompletionsAdapter::new(LlmSettings {
                        base_url,
                        api_key,
                        model,
                        provider,
                        parallel_tool_calls,
                        max_steps,
                    }))
                }
                ProviderConfig::Command {
                    command,
                    args,
                    env,
                    model,
                } => Arc::new(CommandAdapter::new(CommandSettings {
                    command,
                    args,
                    env,
                    model,
                })),
            };
            tracing::info!(provider = %id, kind = ?adapter.kind(), "Registered provider adapter");
            registry.insert(id.clone(), adapter);
        }
        registry
    }

    pub fn insert(&mut self, id: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(id.into(), adapter);
    }

    #[must_use]
    pub fn with(mut self, id: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.insert(id, adapter);
        self
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(id).cloned()
    }

    /// Whether `id` names a self-contained backend. Unknown ids are not.
    #[must_use]
    pub fn is_self_contained(&self, id: &str) -> bool {
        self.adapters
            .get(id)
            .is_some_and(|a| a.kind() == AdapterKind::SelfContained)
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_kinds() {
        let mut providers = HashMap::new();
        providers.insert(
            "local".to_string(),
            ProviderConfig::ChatCompletions {
                base_url: "http://localhost:11434".into(),
                api_key: None,
                model: "qwen".into(),
                parallel_tool_calls: None,
                azure_deployment: None,
                azure_api_version: None,
            },
        );
        providers.insert(
            "cli".to_string(),
            ProviderConfig::Command {
                command: "agent".into(),
                args: Vec::new(),
                env: HashMap::new(),
                model: "cli-model".into(),
            },
        );

        let registry = AdapterRegistry::from_config(&providers, 10);
        assert_eq!(registry.ids(), vec!["cli".to_string(), "local".to_string()]);
        assert!(registry.is_self_contained("cli"));
        assert!(!registry.is_self_contained("local"));
        assert!(!registry.is_self_contained("missing"));
        assert_eq!(registry.get("local").unwrap().default_model(), "qwen");
    }
}
