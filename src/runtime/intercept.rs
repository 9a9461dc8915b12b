//! Tool-call interception rules.
//!
//! Some tool calls are not ordinary tools from the user's point of view:
//! proposing a plan, asking questions, entering and leaving a native plan
//! mode, and writing the plan file are turned into interaction points. This
//! module decides which rule applies; it has no side effects so the policy
//! can be tested without a stream.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::normalized::QuestionSpec;

const PROPOSE_PLAN_TOOLS: &[&str] = &["propose_plan", "ProposePlan"];
const ASK_USER_TOOLS: &[&str] = &["ask_user", "AskUserQuestion", "ask_user_question"];
const ENTER_PLAN_TOOLS: &[&str] = &["EnterPlanMode", "enter_plan_mode"];
const EXIT_PLAN_TOOLS: &[&str] = &["ExitPlanMode", "exit_plan_mode"];
const WRITE_TOOLS: &[&str] = &["write_file", "Write", "write", "create_file"];

static PLANS_DIR_FILE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)(^|/)plans/[^/]+\.md$").ok());
static TOP_LEVEL_PLAN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^(\./)?plan\.md$").ok());

/// What the orchestrator should do with a tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallAction {
    /// Explicit plan proposal.
    ProposePlan { title: String, content: String },
    /// Clarifying questions for the user.
    AskUser { questions: Vec<QuestionSpec> },
    EnterPlanMode,
    /// Leave native plan mode; `plan` is the marker's own plan text, if any.
    ExitPlanMode { plan: Option<String> },
    /// Write to a plan file: keep the content as the pending plan body.
    CapturePlanFile { content: String },
    /// Interaction call with nothing usable in it; shown neither as a
    /// `tool_use` nor as its result.
    Drop,
    /// Emit as an ordinary `tool_use`.
    Forward,
}

/// Apply the interception rules in priority order.
#[must_use]
pub fn classify_tool_call(name: &str, input: &Value, project_dir: &Path) -> ToolCallAction {
    if PROPOSE_PLAN_TOOLS.contains(&name) {
        let content = str_field(input, &["plan", "content"]).unwrap_or_default();
        let (parsed_title, body) = parse_plan(&content);
        let title = str_field(input, &["title"])
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(parsed_title);
        return ToolCallAction::ProposePlan {
            title,
            content: body,
        };
    }

    if ASK_USER_TOOLS.contains(&name) {
        let questions = parse_questions(input);
        if !questions.is_empty() {
            return ToolCallAction::AskUser { questions };
        }
        // The tool itself reports the malformed input back to the model.
        return ToolCallAction::Drop;
    }

    if ENTER_PLAN_TOOLS.contains(&name) {
        return ToolCallAction::EnterPlanMode;
    }

    if EXIT_PLAN_TOOLS.contains(&name) {
        return ToolCallAction::ExitPlanMode {
            plan: str_field(input, &["plan"]).filter(|p| !p.trim().is_empty()),
        };
    }

    if WRITE_TOOLS.contains(&name) {
        if let (Some(path), Some(content)) = (
            str_field(input, &["path", "file_path", "filePath"]),
            str_field(input, &["content"]),
        ) {
            if is_plan_file(&path, project_dir) {
                return ToolCallAction::CapturePlanFile { content };
            }
        }
    }

    ToolCallAction::Forward
}

/// Tool families whose results are never shown: no real side effect happened.
#[must_use]
pub fn is_interaction_tool(name: &str) -> bool {
    PROPOSE_PLAN_TOOLS.contains(&name)
        || ASK_USER_TOOLS.contains(&name)
        || ENTER_PLAN_TOOLS.contains(&name)
        || EXIT_PLAN_TOOLS.contains(&name)
}

/// Whether `path` follows the plan-file convention: a markdown file directly
/// under a `plans/` directory, or `plan.md` at the project root.
#[must_use]
pub fn is_plan_file(path: &str, project_dir: &Path) -> bool {
    let normalized = path.replace('\\', "/");
    let relative = Path::new(&normalized)
        .strip_prefix(project_dir)
        .map_or_else(|_| normalized.clone(), |p| p.to_string_lossy().into_owned());

    PLANS_DIR_FILE
        .as_ref()
        .is_some_and(|re| re.is_match(&normalized))
        || TOP_LEVEL_PLAN
            .as_ref()
            .is_some_and(|re| re.is_match(&relative))
}

/// Split plan text into `(title, body)`.
///
/// The first top-level heading becomes the title and is removed from the
/// body. Without one, the first line is the title and the rest the body.
#[must_use]
pub fn parse_plan(content: &str) -> (String, String) {
    let content = content.trim();
    if content.is_empty() {
        return ("Plan".to_string(), String::new());
    }

    let lines: Vec<&str> = content.lines().collect();
    if let Some(idx) = lines.iter().position(|l| l.starts_with("# ")) {
        let title = lines[idx].trim_start_matches("# ").trim().to_string();
        let body = lines
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, l)| *l)
            .collect::<Vec<_>>()
            .join("\n");
        return (title, body.trim().to_string());
    }

    let title = lines[0].trim_start_matches('#').trim().to_string();
    let body = lines[1..].join("\n").trim().to_string();
    (title, body)
}

fn str_field(input: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| input.get(*k).and_then(Value::as_str))
        .map(ToString::to_string)
}

fn parse_questions(input: &Value) -> Vec<QuestionSpec> {
    if let Some(list) = input.get("questions") {
        if let Ok(questions) = serde_json::from_value::<Vec<QuestionSpec>>(list.clone()) {
            return questions;
        }
    }
    // Single-question shorthand.
    str_field(input, &["question"])
        .map(|question| {
            vec![QuestionSpec {
                question,
                header: None,
                options: Vec::new(),
                multi_select: false,
            }]
        })
        .unwrap_or_default()
}
