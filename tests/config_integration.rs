use overlay_agent::config::{AppConfig, ProviderConfig};
use serial_test::serial;
use std::env;
use std::fs;

const ARGV0: &str = "overlay-agent";

// Helper to clear environment variables that might interfere with tests
fn clear_env_vars() {
    unsafe {
        env::remove_var("OVERLAY_SERVER__PORT");
        env::remove_var("OVERLAY_AGENT__CONFIRM_COMMANDS");
        env::remove_var("CONFIG_FILE");
        env::remove_var("PORT");
        env::remove_var("PROJECT_DIR");
        env::remove_var("DEV_SERVER_PORT");
        env::remove_var("LLM_BASE_URL");
        env::remove_var("LLM_MODEL");
        env::remove_var("LLM_API_KEY");
        env::remove_var("AZURE_DEPLOYMENT_NAME");
    }
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = AppConfig::load_from_args([ARGV0]).expect("defaults should load");
    assert_eq!(config.server.port, 3000);
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.project.state_dir, ".overlay-agent");
    assert_eq!(config.agent.provider, "default");
    assert_eq!(config.agent.max_steps, 25);
    assert!(config.agent.confirm_commands);
    assert_eq!(config.history.capacity, 500);
    assert_eq!(config.dev_server.port, None);
    assert!(config.providers.is_empty());
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("OVERLAY_SERVER__PORT", "9090");
        env::set_var("OVERLAY_AGENT__CONFIRM_COMMANDS", "false");
    }

    let config = AppConfig::load_from_args([ARGV0]).expect("Failed to load config");
    assert_eq!(config.server.port, 9090);
    assert!(!config.agent.confirm_commands);

    clear_env_vars();
}

#[test]
#[serial]
fn test_cli_flags_win_over_env() {
    clear_env_vars();
    unsafe {
        env::set_var("OVERLAY_SERVER__PORT", "9090");
    }

    let config = AppConfig::load_from_args([
        ARGV0,
        "--port",
        "4000",
        "--dev-server-port",
        "5173",
        "--provider",
        "claude",
    ])
    .expect("Failed to load config");
    assert_eq!(config.server.port, 4000);
    assert_eq!(config.dev_server.port, Some(5173));
    assert_eq!(config.agent.provider, "claude");

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load() {
    clear_env_vars();

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("overlay.yaml");
    fs::write(
        &file_path,
        r#"
server:
  port: 7070
agent:
  provider: claude
providers:
  claude:
    kind: command
    command: claude-agent
    args: ["--stream-json"]
  local:
    kind: chat_completions
    base_url: http://localhost:11434/v1
    model: qwen2.5-coder
"#,
    )
    .expect("Failed to write temp config");

    let config = AppConfig::load_from_args([ARGV0, "--config", file_path.to_str().unwrap()])
        .expect("Failed to load config from file");
    assert_eq!(config.server.port, 7070);
    assert_eq!(config.agent.provider, "claude");
    assert_eq!(config.providers.len(), 2);
    assert!(matches!(
        &config.providers["claude"],
        ProviderConfig::Command { command, args, .. } if command == "claude-agent" && args == &["--stream-json"]
    ));
    assert!(matches!(
        &config.providers["local"],
        ProviderConfig::ChatCompletions { model, .. } if model == "qwen2.5-coder"
    ));
}

#[test]
#[serial]
fn test_llm_env_provider_fallback() {
    clear_env_vars();
    unsafe {
        env::set_var("LLM_BASE_URL", "https://api.openai.com/v1");
        env::set_var("LLM_MODEL", "gpt-4o");
    }

    let config = AppConfig::load_from_args([ARGV0]).expect("Failed to load config");
    assert!(matches!(
        config.providers.get("default"),
        Some(ProviderConfig::ChatCompletions { base_url, model, api_key: None, .. })
            if base_url == "https://api.openai.com/v1" && model == "gpt-4o"
    ));

    clear_env_vars();
}

#[test]
#[serial]
fn test_cwd_config_fallback() {
    clear_env_vars();

    // Create ./config.yaml
    let cwd_path = "config.yaml";
    fs::write(cwd_path, "server:\n  port: 6060\n").expect("Failed to write ./config.yaml");

    let port = AppConfig::load_from_args([ARGV0])
        .ok()
        .map(|c| c.server.port);

    // Clean up before asserting so a failure does not leak the file.
    fs::remove_file(cwd_path).unwrap();

    assert_eq!(port, Some(6060));
}
