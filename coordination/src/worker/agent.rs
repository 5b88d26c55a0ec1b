//! The LLM coding agent contract (§6): a subprocess that accepts a prompt
//! and a working directory and emits a newline-delimited stream of JSON
//! events. The core extracts text, tool names, and token/cost usage from
//! those events; a parse failure falls back to best-effort regex
//! extraction.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::{CoordError, CoordResult};

/// The literal sentinel an agent must emit to signal it has finished.
pub const SENTINEL: &str = "<promise>COMPLETE</promise>";

/// Fallback phrases accepted case-insensitively when the sentinel is absent.
const FALLBACK_PHRASES: &[&str] = &["task completed", "task complete", "done", "finished"];

/// What one agent invocation produced.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub final_text: String,
    pub tools_used: Vec<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost: f64,
    pub stderr_tail: String,
}

impl AgentOutcome {
    /// Completion is signalled by the literal sentinel, or, as a fallback,
    /// case-insensitive match of a small phrase list (§6, §8 item 8).
    pub fn signalled_complete(&self) -> bool {
        let lower = self.final_text.to_lowercase();
        if lower.contains(&SENTINEL.to_lowercase()) {
            return true;
        }
        FALLBACK_PHRASES.iter().any(|p| lower.contains(p))
    }
}

/// Abstraction over the external LLM agent subprocess contract, so the
/// worker loop is unit-testable without shelling out to a real agent.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        work_dir: &Path,
        timeout: Duration,
    ) -> CoordResult<AgentOutcome>;
}

/// Spawns the configured agent binary as a detached-from-signals subprocess
/// in its own process group, reads stdout/stderr concurrently so neither
/// pipe backs up, and parses the NDJSON event stream.
pub struct ProcessAgentRunner {
    pub agent_binary: String,
}

impl ProcessAgentRunner {
    pub fn new(agent_binary: impl Into<String>) -> Self {
        Self {
            agent_binary: agent_binary.into(),
        }
    }
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn run(
        &self,
        prompt: &str,
        work_dir: &Path,
        timeout: Duration,
    ) -> CoordResult<AgentOutcome> {
        let mut cmd = Command::new(&self.agent_binary);
        cmd.arg(prompt)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| CoordError::AgentSpawnFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoordError::AgentSpawnFailed("missing stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CoordError::AgentSpawnFailed("missing stderr pipe".into()))?;

        let stdout_task = tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            let mut collected = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push(line);
            }
            collected
        });
        let stderr_task = tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            let mut collected = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        });

        let wait_result = tokio::time::timeout(timeout, child.wait()).await;
        if wait_result.is_err() {
            let _ = child.kill().await;
            return Err(CoordError::AgentTimeout(timeout));
        }

        let stdout_lines = stdout_task.await.unwrap_or_default();
        let stderr_collected = stderr_task.await.unwrap_or_default();

        Ok(parse_event_stream(&stdout_lines, &stderr_collected))
    }
}

/// Parse an agent's NDJSON event stream (§6): extract the last `text`
/// event's content (the agent's final answer), aggregate tool names, and
/// sum token/cost fields across all events that carry them. A line that
/// fails to parse as JSON is kept for the regex fallback extraction.
pub fn parse_event_stream(lines: &[String], stderr: &str) -> AgentOutcome {
    let mut outcome = AgentOutcome::default();
    let mut unparsed = Vec::new();

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(event) => {
                if let Some(text) = extract_text(&event) {
                    outcome.final_text = text;
                }
                extract_tools(&event, &mut outcome.tools_used);
                let (p, c, cost) = extract_usage(&event);
                outcome.prompt_tokens += p;
                outcome.completion_tokens += c;
                outcome.cost += cost;
            }
            Err(_) => unparsed.push(trimmed.to_string()),
        }
    }

    if outcome.final_text.is_empty() && !unparsed.is_empty() {
        outcome.final_text = regex_fallback_extract(&unparsed.join("\n"));
    }

    outcome.stderr_tail = stderr.lines().rev().take(40).collect::<Vec<_>>().join("\n");
    outcome
}

/// Text content: from fields in order of preference — event type `text`
/// with `part.text`, then top-level `.text`, then Anthropic/OpenAI-shaped
/// nested content.
fn extract_text(event: &Value) -> Option<String> {
    if event.get("type").and_then(Value::as_str) == Some("text") {
        if let Some(t) = event.pointer("/part/text").and_then(Value::as_str) {
            return Some(t.to_string());
        }
    }
    if let Some(t) = event.get("text").and_then(Value::as_str) {
        return Some(t.to_string());
    }
    // Anthropic-shaped: {"content": [{"type": "text", "text": "..."}]}
    if let Some(content) = event.get("content").and_then(Value::as_array) {
        for item in content {
            if item.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(t) = item.get("text").and_then(Value::as_str) {
                    return Some(t.to_string());
                }
            }
        }
    }
    // OpenAI-shaped: {"choices": [{"message": {"content": "..."}}]}
    if let Some(t) = event
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        return Some(t.to_string());
    }
    None
}

fn extract_tools(event: &Value, tools: &mut Vec<String>) {
    if let Some(name) = event.pointer("/part/tool_name").and_then(Value::as_str) {
        tools.push(name.to_string());
    }
    if let Some(name) = event.pointer("/tool_call/name").and_then(Value::as_str) {
        tools.push(name.to_string());
    }
    if let Some(content) = event.get("content").and_then(Value::as_array) {
        for item in content {
            if item.get("type").and_then(Value::as_str) == Some("tool_use") {
                if let Some(name) = item.get("name").and_then(Value::as_str) {
                    tools.push(name.to_string());
                }
            }
        }
    }
}

fn extract_usage(event: &Value) -> (i64, i64, f64) {
    let prompt = event
        .pointer("/part/tokens/input")
        .or_else(|| event.pointer("/usage/prompt_tokens"))
        .or_else(|| event.pointer("/usage/input_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let completion = event
        .pointer("/part/tokens/output")
        .or_else(|| event.pointer("/usage/completion_tokens"))
        .or_else(|| event.pointer("/usage/output_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let cost = event
        .pointer("/part/cost")
        .or_else(|| event.get("cost"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    (prompt, completion, cost)
}

fn regex_fallback_extract(raw: &str) -> String {
    let re = Regex::new(r#""text"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap();
    let mut last = None;
    for caps in re.captures_iter(raw) {
        last = caps.get(1).map(|m| m.as_str().to_string());
    }
    last.map(|s| s.replace("\\n", "\n").replace("\\\"", "\""))
        .unwrap_or_else(|| raw.to_string())
}

/// Build the §4.3(d) prompt: declares the worker's identity and task id,
/// requires the sentinel, forbids touching internal-tooling directories,
/// and instructs the agent to commit with the `"Task <id>: "` title prefix.
pub fn build_prompt(
    worker_id: &str,
    task_id: i64,
    task_text: &str,
    deny_list: &[PathBuf],
) -> String {
    let deny = deny_list
        .iter()
        .map(|p| format!("- {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You are worker {worker_id}, executing task {task_id} inside your own git worktree.\n\n\
         ## Task\n\n{task_text}\n\n\
         ## Instructions\n\n\
         1. Implement the task fully within this worktree.\n\
         2. Do not touch any of the following internal tooling paths:\n{deny}\n\
         3. When finished, create a git commit titled exactly:\n   \"Task {task_id}: <short summary>\"\n\
         4. When the task is fully and completely done, end your reply with this token on its own line:\n\n   {SENTINEL}\n\n\
         Only emit {SENTINEL} when you are genuinely confident the task is done."
    )
}
