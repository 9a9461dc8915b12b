use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::llm::provider::DEFAULT_AZURE_API_VERSION;

/// Provider id used when providers are derived from `LLM_*` variables.
pub const DEFAULT_PROVIDER_ID: &str = "default";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Project directory the agent works in
    #[arg(long, env = "PROJECT_DIR")]
    pub project_dir: Option<String>,

    /// Port of the dev server being overlaid
    #[arg(long, env = "DEV_SERVER_PORT")]
    pub dev_server_port: Option<u16>,

    /// Provider id to use when a run does not name one
    #[arg(long)]
    pub provider: Option<String>,

    /// Model to use when a run does not name one
    #[arg(long)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub project: ProjectConfig,
    #[serde(default)]
    pub dev_server: DevServerConfig,
    pub agent: AgentConfig,
    pub history: HistoryConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    pub dir: PathBuf,
    /// Tool-state directory, relative to `dir`.
    pub state_dir: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DevServerConfig {
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    pub max_steps: usize,
    pub confirm_commands: bool,
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    pub capacity: usize,
}

/// One configured backend.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// OpenAI-compatible endpoint, tool loop run by this server.
    ChatCompletions {
        base_url: String,
        #[serde(default)]
        api_key: Option<String>,
        model: String,
        #[serde(default)]
        parallel_tool_calls: Option<bool>,
        #[serde(default)]
        azure_deployment: Option<String>,
        #[serde(default)]
        azure_api_version: Option<String>,
    },
    /// External agent CLI that owns its tools.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        model: String,
    },
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", 3000)?
            .set_default("server.host", "127.0.0.1")?
            .set_default("project.dir", ".")?
            .set_default("project.state_dir", ".overlay-agent")?
            .set_default("agent.provider", DEFAULT_PROVIDER_ID)?
            .set_default("agent.max_steps", 25)?
            .set_default("agent.confirm_commands", true)?
            .set_default("agent.command_timeout_secs", 120)?
            .set_default("history.capacity", 500)?;

        builder = match &cli.config {
            Some(path) => builder.add_source(File::new(path, FileFormat::Yaml)),
            None => builder.add_source(File::new("config.yaml", FileFormat::Yaml).required(false)),
        };

        // E.g. OVERLAY_SERVER__PORT=8000, OVERLAY_AGENT__CONFIRM_COMMANDS=false
        builder = builder.add_source(
            Environment::with_prefix("OVERLAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // Flags (and the env vars clap reads for them) win over everything.
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(dir) = cli.project_dir {
            builder = builder.set_override("project.dir", dir)?;
        }
        if let Some(port) = cli.dev_server_port {
            builder = builder.set_override("dev_server.port", port)?;
        }
        if let Some(provider) = cli.provider {
            builder = builder.set_override("agent.provider", provider)?;
        }
        if let Some(model) = cli.model {
            builder = builder.set_override("agent.model", model)?;
        }

        let mut cfg: Self = builder.build()?.try_deserialize()?;

        if cfg.providers.is_empty() {
            if let Some(provider) = provider_from_llm_env() {
                cfg.providers.insert(DEFAULT_PROVIDER_ID.to_string(), provider);
            }
        }

        Ok(cfg)
    }

    /// Absolute-or-relative path of the tool-state directory.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.project.dir.join(&self.project.state_dir)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.command_timeout_secs)
    }
}

/// Build a chat-completions provider from `LLM_BASE_URL` / `LLM_MODEL` /
/// `LLM_API_KEY` and the Azure variables, when they are set.
pub fn provider_from_llm_env() -> Option<ProviderConfig> {
    let base_url = std::env::var("LLM_BASE_URL")
        .ok()
        .filter(|s| !s.trim().is_empty())?;
    let model = std::env::var("LLM_MODEL")
        .ok()
        .filter(|s| !s.trim().is_empty())?;

    let api_key = std::env::var("LLM_API_KEY")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let parallel_tool_calls = std::env::var("LLM_PARALLEL_TOOLS")
        .ok()
        .and_then(|s| s.parse().ok());
    let azure_deployment = std::env::var("AZURE_DEPLOYMENT_NAME").ok();
    let azure_api_version = azure_deployment.as_ref().map(|_| {
        std::env::var("AZURE_API_VERSION").unwrap_or_else(|_| DEFAULT_AZURE_API_VERSION.to_string())
    });

    Some(ProviderConfig::ChatCompletions {
        base_url,
        api_key,
        model,
        parallel_tool_calls,
        azure_deployment,
        azure_api_version,
    })
}
