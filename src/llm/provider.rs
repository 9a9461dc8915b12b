//! Endpoint flavors of OpenAI-compatible chat APIs.
//!
//! The differences that matter to the chat adapter are the request URL and
//! the authentication header.

/// Default Azure API version when none is configured.
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-08-01-preview";

/// Supported endpoint flavors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Provider {
    /// `OpenAI` (api.openai.com)
    OpenAI,
    /// Azure `OpenAI` Service
    AzureOpenAI {
        /// Deployment name (required for Azure)
        deployment_name: String,
        /// API version (e.g., "2024-08-01-preview")
        api_version: String,
    },
    /// `OpenRouter` (openrouter.ai)
    OpenRouter,
    /// Groq (groq.com)
    Groq,
    /// Local servers (Ollama, LM Studio, llama.cpp) and anything else.
    #[default]
    Generic,
}

impl Provider {
    /// Detect the flavor from a base URL.
    ///
    /// Azure detection leaves the deployment empty; use [`Self::azure`]
    /// when the deployment name is known.
    #[must_use]
    pub fn detect_from_url(base_url: &str) -> Self {
        let lower = base_url.to_lowercase();

        if lower.contains("openai.azure.com") || lower.contains("azure.com") {
            Self::azure("", DEFAULT_AZURE_API_VERSION)
        } else if lower.contains("openrouter.ai") {
            Self::OpenRouter
        } else if lower.contains("groq.com") {
            Self::Groq
        } else if lower.contains("openai.com") {
            Self::OpenAI
        } else {
            Self::Generic
        }
    }

    /// Azure flavor with an explicit deployment.
    #[must_use]
    pub fn azure(deployment_name: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self::AzureOpenAI {
            deployment_name: deployment_name.into(),
            api_version: api_version.into(),
        }
    }

    /// Build the chat completions URL.
    ///
    /// Azure addresses the deployment instead of the model.
    #[must_use]
    pub fn build_chat_url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');

        match self {
            Self::AzureOpenAI {
                deployment_name,
                api_version,
            } => format!(
                "{base}/openai/deployments/{deployment_name}/chat/completions?api-version={api_version}"
            ),
            _ if base.ends_with("/v1") => format!("{base}/chat/completions"),
            _ => format!("{base}/v1/chat/completions"),
        }
    }

    /// Attach credentials to a request.
    #[must_use]
    pub fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        api_key: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match (self, api_key) {
            (_, None) => request,
            (Self::AzureOpenAI { .. }, Some(key)) => request.header("api-key", key),
            (_, Some(key)) => request.bearer_auth(key),
        }
    }

    /// Whether streamed responses can carry a final usage chunk.
    #[must_use]
    pub fn supports_stream_usage(&self) -> bool {
        matches!(self, Self::OpenAI | Self::AzureOpenAI { .. } | Self::OpenRouter)
    }
}
