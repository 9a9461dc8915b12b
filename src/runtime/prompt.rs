//! System prompt for tool-augmented runs.

use std::fmt::Write as _;
use std::path::Path;

/// Inputs to [`build_system_prompt`].
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub project_dir: &'a Path,
    pub dev_server_port: Option<u16>,
    pub tool_names: &'a [&'static str],
    pub creation_mode: bool,
    pub locale: Option<&'a str>,
}

#[must_use]
pub fn build_system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = String::new();

    if ctx.creation_mode {
        prompt.push_str(
            "You are a coding agent building a new web application from scratch. \
             Scaffold the project in the working directory, keep the structure small, \
             and make sure the dev server can serve it.\n",
        );
    } else {
        prompt.push_str(
            "You are a coding agent embedded in a running web application's dev server. \
             The user sees the app in the browser and asks for changes. Make focused edits \
             to the existing code; the page reloads once your turn is over.\n",
        );
    }

    let _ = writeln!(prompt, "\nProject directory: {}", ctx.project_dir.display());
    if let Some(port) = ctx.dev_server_port {
        let _ = writeln!(prompt, "Dev server: http://localhost:{port}");
    }

    if !ctx.tool_names.is_empty() {
        let _ = writeln!(prompt, "Available tools: {}.", ctx.tool_names.join(", "));
    }
    prompt.push_str(
        "\nUse paths relative to the project directory. \
         For larger or ambiguous requests call propose_plan first and stop. \
         If the request is unclear call ask_user and stop. \
         Otherwise make the change and finish with a short summary.\n",
    );

    if let Some(locale) = ctx.locale.filter(|l| !l.is_empty()) {
        let _ = writeln!(prompt, "\nRespond in the user's language ({locale}).");
    }

    prompt
}
